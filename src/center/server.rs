//! Center server: master/slave replication with a compensating putback.
//!
//! A master fans every mutating command out to its secondaries before
//! applying it locally. When the secondaries succeeded but the local apply
//! failed, the original command's compensation is enqueued onto the putback
//! channel; a background worker drains it towards the secondaries, and
//! failures of the compensation itself land in an append-only audit log.
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch, Mutex};

use whisper_index::oid::{status_target_oids, OidInfo};
use whisper_index::record::Record;
use whisper_rpc::client::RpcClient;
use whisper_rpc::message::EndpointHandler;
use whisper_util::background::{BackgroundRunner, Worker, WorkerStatus};
use whisper_util::data::STATUS_RECORD_DEL;
use whisper_util::encode::enc;
use whisper_util::error::Error;

use crate::center::Center;
use crate::rpc::CenterRpc;

/// Audit of compensations that could not be delivered, in the operator's
/// home directory
pub const PUT_BACK_LOG_FILE: &str = "center-server-put-back.log";

pub struct CenterServer {
	pub center: Arc<Center>,
	/// Advertised host:port of this center's RPC endpoint
	pub host: String,
	is_master: AtomicBool,
	peers: Mutex<Vec<Arc<RpcClient<CenterRpc>>>>,
	putback_tx: ArcSwapOption<mpsc::UnboundedSender<CenterRpc>>,
	// excludes concurrent appends to the audit log
	putback_log_mutex: Mutex<()>,
	bg: Arc<BackgroundRunner>,
	stop_tx: Arc<watch::Sender<bool>>,
}

impl CenterServer {
	pub fn new(
		center: Arc<Center>,
		host: String,
		bg: Arc<BackgroundRunner>,
		stop_tx: Arc<watch::Sender<bool>>,
	) -> Arc<CenterServer> {
		Arc::new(CenterServer {
			center,
			host,
			is_master: AtomicBool::new(false),
			peers: Mutex::new(Vec::new()),
			putback_tx: ArcSwapOption::new(None),
			putback_log_mutex: Mutex::new(()),
			bg,
			stop_tx,
		})
	}

	pub fn is_master(&self) -> bool {
		self.is_master.load(Ordering::SeqCst)
	}

	/// Role transition pushed by the coordinator. Gaining the master role
	/// spawns the putback worker, losing it closes the channel so the
	/// worker drains and exits.
	pub async fn set_master(self: &Arc<Self>, is_master: bool) {
		self.is_master.store(is_master, Ordering::SeqCst);
		if is_master {
			if self.putback_tx.load().is_none() {
				let (tx, rx) = mpsc::unbounded_channel();
				self.putback_tx.store(Some(Arc::new(tx)));
				self.bg.spawn_worker(PutbackWorker {
					server: self.clone(),
					rx,
					next: None,
				});
				info!("center server put back is running");
			} else {
				info!("center server put back is already running");
			}
		} else if self.putback_tx.swap(None).is_some() {
			// dropping the last sender closes the channel
			info!("center server put back is stopping");
		}
	}

	/// Open an outbound client to a peer center learned from the
	/// coordinator
	pub async fn connect_to_other(&self, addr: &str) -> Result<(), Error> {
		let client = RpcClient::<CenterRpc>::connect(addr).await?;
		self.peers.lock().await.push(client);
		info!("center server client to other server connected - {}", addr);
		Ok(())
	}

	pub async fn peer_count(&self) -> usize {
		self.peers.lock().await.len()
	}

	// ---- the replication state machine ----

	async fn handle_mutation(self: &Arc<Self>, req: CenterRpc) -> Result<CenterRpc, Error> {
		let is_master = self.is_master();
		// captured before anyone applies: the compensation needs the
		// pre-change state
		let compensation = if is_master {
			self.compensation_for(&req).await
		} else {
			Vec::new()
		};

		if is_master {
			let peers = self.peers.lock().await.clone();
			for peer in peers.iter() {
				info!(
					"center server sync master to slave pack - {} - {}",
					self.host,
					peer.addr()
				);
				match peer.call(&req).await {
					Ok(Ok(_)) => (),
					// logical failure on the peer, propagated as-is
					Ok(Err(e)) => return Err(e),
					// transport error: the master does not apply
					Err(e) => return Err(e),
				}
			}
		}

		match self.apply(&req).await {
			Ok(resp) => Ok(resp),
			Err(e) => {
				// the secondaries are now ahead of us; compensate, and
				// still surface the local failure
				if is_master {
					if compensation.is_empty() {
						error!("center server has no compensation for failed {:?}", req);
					}
					for putback in compensation {
						self.enqueue_putback(putback).await;
					}
				}
				Err(e)
			}
		}
	}

	/// The inverse operations to run on the secondaries if the local apply
	/// fails after they already committed. Empty when no compensation is
	/// possible.
	async fn compensation_for(&self, req: &CenterRpc) -> Vec<CenterRpc> {
		match req {
			CenterRpc::PutRecord(rec) => vec![CenterRpc::PutbackPutRecord(rec.clone())],
			CenterRpc::ChangeOidStatus { oid, .. } => {
				let (index_id, targets) = match status_target_oids(oid) {
					Ok(t) => t,
					Err(_) => return Vec::new(),
				};
				let mut comps = Vec::new();
				for target in targets {
					if let Ok(prev) = self.center.get(index_id, &target).await {
						comps.push(CenterRpc::PutbackChangeOidStatus {
							oid: target,
							prev_status: prev.status,
						});
					}
				}
				comps
			}
			_ => Vec::new(),
		}
	}

	async fn apply(&self, req: &CenterRpc) -> Result<CenterRpc, Error> {
		match req {
			CenterRpc::PutRecord(rec) => {
				let info = OidInfo::parse(&rec.oid)?;
				self.center.set(info.index_id, rec.clone()).await?;
				Ok(CenterRpc::Ok)
			}
			CenterRpc::ChangeOidStatus { oid, status } => {
				// a logical oid (no copy suffix) addresses every copy
				let (index_id, targets) = status_target_oids(oid)?;
				let mut changed = false;
				for target in targets {
					match self.center.get(index_id, &target).await {
						Ok(mut rec) => {
							rec.status = *status;
							self.center.set(index_id, rec).await?;
							changed = true;
						}
						Err(_) => continue,
					}
				}
				if changed {
					Ok(CenterRpc::Ok)
				} else {
					Err(Error::Message(format!(
						"center update status get error - record not found {}",
						oid
					)))
				}
			}
			m => Err(Error::unexpected_rpc_message(m)),
		}
	}

	async fn enqueue_putback(&self, req: CenterRpc) {
		match self.putback_tx.load_full() {
			Some(tx) => {
				if tx.send(req).is_err() {
					error!("center server put back channel is closed");
				}
			}
			None => error!("center server put back worker is not running"),
		}
	}

	pub(crate) async fn putback_to_slaves(&self, req: CenterRpc) {
		let peers = self.peers.lock().await.clone();
		for peer in peers.iter() {
			match peer.call(&req).await {
				Ok(Ok(_)) => (),
				Ok(Err(e)) => {
					error!(
						"center server put back 2 slave fail - {} - {:?}",
						e, req
					);
					self.write_putback_log(&req).await;
				}
				Err(e) => {
					error!(
						"center server put back 2 slave error - {} - {:?}",
						e, req
					);
					self.write_putback_log(&req).await;
				}
			}
		}
	}

	async fn write_putback_log(&self, req: &CenterRpc) {
		let _lock = self.putback_log_mutex.lock().await;
		let path = user_home_file(PUT_BACK_LOG_FILE);
		let res = async {
			let body = enc(req)?;
			let mut file = tokio::fs::OpenOptions::new()
				.create(true)
				.append(true)
				.open(&path)
				.await?;
			file.write_all(&body).await?;
			Ok::<(), Error>(())
		}
		.await;
		if let Err(e) = res {
			error!("center server put back 2 slave write log error - {}", e);
		}
	}

	// ---- putback application, on a secondary ----

	async fn handle_putback_put(&self, mut rec: Record) -> Result<CenterRpc, Error> {
		rec.status = STATUS_RECORD_DEL;
		let info = OidInfo::parse(&rec.oid)?;
		self.center.set(info.index_id, rec).await?;
		Ok(CenterRpc::Ok)
	}

	async fn handle_putback_status(&self, oid: &str, prev_status: u32) -> Result<CenterRpc, Error> {
		let info = OidInfo::parse(oid)?;
		let mut rec = self.center.get(info.index_id, oid).await?;
		rec.status = prev_status;
		self.center.set(info.index_id, rec).await?;
		Ok(CenterRpc::Ok)
	}
}

#[async_trait]
impl EndpointHandler<CenterRpc> for CenterServer {
	async fn handle(self: &Arc<Self>, msg: CenterRpc, _from: SocketAddr) -> Result<CenterRpc, Error> {
		match msg {
			m if m.needs_slave_sync() => self.handle_mutation(m).await,
			CenterRpc::GetOidMeta(oid) => {
				let info = OidInfo::parse(&oid)?;
				let rec = self.center.get(info.index_id, &oid).await?;
				Ok(CenterRpc::Record(rec))
			}
			CenterRpc::PutbackPutRecord(rec) => self.handle_putback_put(rec).await,
			CenterRpc::PutbackChangeOidStatus { oid, prev_status } => {
				self.handle_putback_status(&oid, prev_status).await
			}
			CenterRpc::Close => {
				info!("center server stopping on close command");
				self.stop_tx.send(true)?;
				Ok(CenterRpc::Ok)
			}
			m => Err(Error::unexpected_rpc_message(&m)),
		}
	}
}

/// Drains the putback channel towards the secondaries. The channel closing
/// (master demoted, or shutdown) is the termination signal.
struct PutbackWorker {
	server: Arc<CenterServer>,
	rx: mpsc::UnboundedReceiver<CenterRpc>,
	next: Option<CenterRpc>,
}

#[async_trait]
impl Worker for PutbackWorker {
	fn name(&self) -> String {
		"center putback".to_string()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		if let Some(req) = self.next.take() {
			self.server.putback_to_slaves(req).await;
			return Ok(WorkerStatus::Busy);
		}
		match self.rx.try_recv() {
			Ok(req) => {
				self.next = Some(req);
				Ok(WorkerStatus::Busy)
			}
			Err(mpsc::error::TryRecvError::Empty) => Ok(WorkerStatus::Idle),
			Err(mpsc::error::TryRecvError::Disconnected) => {
				info!("center server put back is stopping");
				Ok(WorkerStatus::Done)
			}
		}
	}

	async fn wait_for_work(&mut self, must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		// on shutdown, the queue has already been drained by work()
		if *must_exit.borrow() {
			return WorkerStatus::Done;
		}
		match self.rx.recv().await {
			Some(req) => {
				self.next = Some(req);
				WorkerStatus::Busy
			}
			None => WorkerStatus::Done,
		}
	}
}

fn user_home_file(name: &str) -> PathBuf {
	match std::env::var_os("HOME") {
		Some(home) => PathBuf::from(home).join(name),
		None => PathBuf::from("/").join(name),
	}
}
