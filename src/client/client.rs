//! The client write/read path: parallel copy upload across agents with an
//! atomic-style abort that disables the object when any copy fails, and
//! sequential fallback read across copies.
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use whisper_block::block::{decode_block_list, Block};
use whisper_center::rpc::CenterRpc;
use whisper_index::oid::gen_oid_no_suffix;
use whisper_rpc::bus_client::BusClient;
use whisper_rpc::client::RpcClient;
use whisper_util::data::{STATUS_RECORD_DEL, STATUS_RECORD_DISABLE};
use whisper_util::encode::dec;
use whisper_util::error::{Error, OkOrMessage};

use crate::conn::Connect;

// Write strategies: filling rate / visit load / different disks /
// different hosts. Only FILLING_RATE is implemented, the others fall back
// to it with a warning.
pub const STRATEGY_FILLING_RATE: u32 = 1;
pub const STRATEGY_VISIT_AVG: u32 = 2;
pub const STRATEGY_DIR_PART: u32 = 3;
pub const STRATEGY_ADDR_PART: u32 = 4;

pub const COPY_NUMBER_DEFAULT: u32 = 2;

/// Watcher group shared by every client. Configuration pushes use a named
/// group so that each client receives them; the `all` group would deliver
/// to a single subscriber only.
pub const WATCH_GROUP_CLIENT: &str = "client";

/// Client routing configuration, refreshed over the bus
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConnConf {
	pub strategy: u32,
	pub copy_num: u32,
	/// Index new objects are written under
	pub index_id: u32,
	/// Per-upload timeout in milliseconds, 0 disables it
	pub timeout_millis: u64,
}

impl Default for ConnConf {
	fn default() -> Self {
		ConnConf {
			strategy: STRATEGY_FILLING_RATE,
			copy_num: 1,
			index_id: 1,
			timeout_millis: 0,
		}
	}
}

pub struct Client {
	conf: ArcSwap<ConnConf>,
	/// Published by the coordinator, already ordered by filling rate
	blocks: ArcSwap<Vec<Block>>,
	connects: Mutex<Vec<Arc<Connect>>>,
	center: ArcSwapOption<RpcClient<CenterRpc>>,
}

impl Client {
	pub fn new() -> Arc<Client> {
		Arc::new(Client {
			conf: ArcSwap::from_pointee(ConnConf::default()),
			blocks: ArcSwap::from_pointee(Vec::new()),
			connects: Mutex::new(Vec::new()),
			center: ArcSwapOption::new(None),
		})
	}

	/// Connect to the coordination bus and register the client watchers.
	/// Everything the client knows about the cluster arrives through them.
	/// `mediator_addr` is a full host:port.
	pub async fn start(self: &Arc<Self>, mediator_addr: &str) -> Result<Arc<BusClient>, Error> {
		let bus = BusClient::connect(mediator_addr).await?;
		info!("client mediator client started");

		let this = self.clone();
		bus.watch_in_group(WATCH_GROUP_CLIENT, "client-block-refresh", move |value, _old| {
			let this = this.clone();
			async move {
				match decode_block_list(&value) {
					Ok(blocks) => {
						for block in blocks.iter() {
							info!("client block refresh get block {:?}", block);
						}
						this.blocks.store(Arc::new(blocks));
					}
					Err(e) => error!("client block refresh decode error - {}", e),
				}
			}
		})
		.await?;

		let this = self.clone();
		bus.watch_in_group(WATCH_GROUP_CLIENT, "client-conf-refresh", move |value, _old| {
			let this = this.clone();
			async move {
				match dec::<ConnConf>(&value) {
					Ok(conf) => {
						info!("client conf refreshed {:?}", conf);
						this.conf.store(Arc::new(conf));
					}
					Err(e) => error!("client conf refresh error - {}", e),
				}
			}
		})
		.await?;

		let this = self.clone();
		bus.watch_in_group(WATCH_GROUP_CLIENT, "client-connect-to-center", move |value, _old| {
			let this = this.clone();
			async move {
				let addr = String::from_utf8_lossy(&value).into_owned();
				info!("client center addr is {}", addr);
				this.connect_to_center(&addr).await;
			}
		})
		.await?;

		let this = self.clone();
		bus.watch_in_group(WATCH_GROUP_CLIENT, "client-connect-to-node-server", move |value, _old| {
			let this = this.clone();
			async move {
				let addrs = String::from_utf8_lossy(&value).into_owned();
				this.connect_to_node_servers(&addrs).await;
			}
		})
		.await?;

		Ok(bus)
	}

	pub fn is_center_connected(&self) -> bool {
		self.center.load().is_some()
	}

	pub fn conf(&self) -> ConnConf {
		**self.conf.load()
	}

	pub fn block_count(&self) -> usize {
		self.blocks.load().len()
	}

	pub async fn node_server_count(&self) -> usize {
		self.connects.lock().await.len()
	}

	pub async fn connect_to_center(&self, addr: &str) {
		if let Some(old) = self.center.load_full() {
			info!("client center client is stopping");
			old.stop();
		}
		match RpcClient::connect(addr).await {
			Ok(c) => {
				self.center.store(Some(c));
				info!("client center client connected");
			}
			Err(e) => error!("client center client connect error - {}", e),
		}
	}

	/// Reconcile agent connections against a comma-separated address
	/// list: keep the ones still listed, close the removed ones, open the
	/// new ones.
	pub async fn connect_to_node_servers(&self, node_addrs: &str) {
		let wanted: Vec<&str> = node_addrs.split(',').filter(|a| !a.is_empty()).collect();
		info!("client to node servers ready to connect - {}", node_addrs);

		let mut connects = self.connects.lock().await;

		let mut kept: Vec<Arc<Connect>> = Vec::new();
		for connect in connects.drain(..) {
			if wanted.contains(&connect.addr()) {
				info!("client to node server already connected - {}", connect.addr());
				kept.push(connect);
			} else {
				info!("client to node server is disconnecting - {}", connect.addr());
				connect.close();
			}
		}

		let timeout = self.conf.load().timeout_millis;
		for addr in wanted {
			if kept.iter().any(|c| c.addr() == addr) {
				continue;
			}
			info!("client to node server is connecting - {}", addr);
			match Connect::connect(addr, timeout).await {
				Ok(c) => kept.push(c),
				Err(e) => error!("client to node server connect error - {} - {}", addr, e),
			}
		}

		*connects = kept;
	}

	pub async fn close(&self) {
		let connects = self.connects.lock().await;
		for connect in connects.iter() {
			connect.close();
		}
		if let Some(center) = self.center.load_full() {
			center.stop();
			info!("client center client stoped");
		}
	}

	async fn target_connect(&self, addr: &str) -> Option<Arc<Connect>> {
		self.connects
			.lock()
			.await
			.iter()
			.find(|c| c.addr().starts_with(addr))
			.cloned()
	}

	fn target_block(&self, block_id: u64) -> Option<Block> {
		self.blocks
			.load()
			.iter()
			.find(|b| b.block_id == block_id)
			.cloned()
	}

	/// The first copy_num+1 blocks of the published list. The list is
	/// sorted by filling rate when the coordinator publishes it, so
	/// "first N" means "least full N".
	fn target_blocks(&self, conf: &ConnConf) -> Result<Vec<Block>, Error> {
		if conf.strategy != STRATEGY_FILLING_RATE {
			warn!(
				"client write strategy {} not implemented, using filling rate",
				conf.strategy
			);
		}
		let blocks = self.blocks.load();
		let wanted = (conf.copy_num + 1) as usize;
		if blocks.len() < wanted {
			return Err(Error::Message("client not enough block to save".into()));
		}
		Ok(blocks[..wanted].to_vec())
	}

	fn center_client(&self) -> Result<Arc<RpcClient<CenterRpc>>, Error> {
		self.center
			.load_full()
			.ok_or_message("client center client not connected")
	}

	/// Upload copy_num+1 copies in parallel. If any copy fails, the
	/// logical oid is disabled on the primary (successes that already
	/// landed are not rolled back) and the save fails.
	pub async fn save(&self, body: Bytes, mime: u32) -> Result<String, Error> {
		let conf = **self.conf.load();
		let oid = gen_oid_no_suffix(conf.index_id, conf.copy_num);
		let blocks = self.target_blocks(&conf)?;

		let mut uploads = Vec::new();
		for (seq, block) in blocks.iter().enumerate() {
			let connect = self
				.target_connect(&block.addr)
				.await
				.ok_or_else(|| {
					Error::Message(format!("client save but connect not found {}", block.addr))
				})?;
			let oid_copy = format!("{}_{}", oid, seq);
			let body = body.clone();
			uploads.push(tokio::spawn(async move {
				connect.upload(&oid_copy, body, mime).await
			}));
		}

		// every uploader reports before we decide
		let mut failed_seq = None;
		for (seq, upload) in uploads.into_iter().enumerate() {
			let is_ok = upload.await?;
			if !is_ok && failed_seq.is_none() {
				failed_seq = Some(seq);
			}
		}

		match failed_seq {
			None => Ok(oid),
			Some(seq) => {
				// disable the logical oid so later reads cannot see a
				// partial object
				if let Ok(center) = self.center_client() {
					let oid = oid.clone();
					tokio::spawn(async move {
						if let Err(e) = center
							.call(&CenterRpc::ChangeOidStatus {
								oid: oid.clone(),
								status: STATUS_RECORD_DISABLE,
							})
							.await
						{
							error!(
								"client write fail then disable oid status error - {} - {}",
								oid, e
							);
						}
					});
				}
				let msg = format!(
					"client write fail {} - {}",
					oid, blocks[seq].addr
				);
				error!("{}", msg);
				Err(Error::Message(msg))
			}
		}
	}

	/// Multi-copy read: try copy 0, then each next copy in order. First
	/// success wins.
	pub async fn get(&self, oid: &str) -> Result<(Vec<u8>, u32), Error> {
		match self.get_one(&format!("{}_0", oid)).await {
			Ok(r) => return Ok(r),
			Err(e) => debug!("client get copy 0 failed - {} - {}", oid, e),
		}

		let copy_num = self.conf.load().copy_num;
		for seq in 1..=copy_num {
			info!("client try fetch time {} for {}", seq, oid);
			match self.get_one(&format!("{}_{}", oid, seq)).await {
				Ok(r) => return Ok(r),
				Err(e) => debug!("client get copy {} failed - {} - {}", seq, oid, e),
			}
		}

		Err(Error::Message("client get failed".into()))
	}

	async fn get_one(&self, oid: &str) -> Result<(Vec<u8>, u32), Error> {
		let center = self.center_client()?;
		let rec = match center.call(&CenterRpc::GetOidMeta(oid.to_string())).await? {
			Ok(CenterRpc::Record(rec)) => rec,
			Ok(m) => return Err(Error::unexpected_rpc_message(&m)),
			Err(e) => return Err(e),
		};

		// deleted and disabled copies are not readable
		if rec.status == STATUS_RECORD_DEL || rec.status == STATUS_RECORD_DISABLE {
			return Err(Error::Message(format!(
				"client target record not readable {} - status {}",
				oid, rec.status
			)));
		}

		let block = self
			.target_block(rec.block_id)
			.ok_or_else(|| {
				Error::Message(format!("client target block not found {}", rec.block_id))
			})?;
		let connect = self
			.target_connect(&block.addr)
			.await
			.ok_or_else(|| {
				Error::Message(format!("client target connect not found {}", block.addr))
			})?;

		let mime = rec.mime;
		let body = connect.download(&rec).await?;
		Ok((body, mime))
	}

	/// Flip the record status to deleted on the primary; no block-side
	/// deletion happens
	pub async fn del(&self, oid: &str) -> Result<(), Error> {
		let center = self.center_client()?;
		match center
			.call(&CenterRpc::ChangeOidStatus {
				oid: oid.to_string(),
				status: STATUS_RECORD_DEL,
			})
			.await?
		{
			Ok(_) => Ok(()),
			Err(e) => Err(e),
		}
	}
}
