//! Agent RPC server: stores blob bodies locally and reports their records
//! to the metadata primary
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use whisper_center::rpc::CenterRpc;
use whisper_index::record::Record;
use whisper_rpc::bus_client::BusClient;
use whisper_rpc::client::RpcClient;
use whisper_rpc::message::{EndpointHandler, Message};
use whisper_util::error::{Error, OkOrMessage};

use crate::block::decode_block_list;
use crate::node::{BlockInServer, Node};

/// RPC messages between clients and an agent
#[derive(Debug, Serialize, Deserialize)]
pub enum NodeRpc {
	Ok,
	/// Store a body locally and report the record to the center
	Save {
		oid: String,
		mime: u32,
		#[serde(with = "serde_bytes")]
		body: Vec<u8>,
	},
	/// Ranged read of one record's body
	Get(Record),
	/// Whole-block read under the block's write exclusion, for
	/// replication repair
	ReadFull { block_id: u64 },
	/// A body, response to Get and ReadFull
	Data(#[serde(with = "serde_bytes")] Vec<u8>),
	/// Politely shut the agent down
	Close,
}

impl Message for NodeRpc {
	type Response = Result<NodeRpc, Error>;
}

/// Watcher group shared by every agent. Configuration pushes use a named
/// group so that each agent receives them; the `all` group would deliver
/// to a single subscriber only.
pub const WATCH_GROUP_NODE_SERVER: &str = "node-server";

pub struct NodeServer {
	pub node: Arc<Node>,
	/// Advertised host:port of this agent's RPC endpoint; blocks are
	/// assigned to it by address
	pub host: String,
	center: ArcSwapOption<RpcClient<CenterRpc>>,
	stop_tx: Arc<watch::Sender<bool>>,
}

impl NodeServer {
	pub fn new(host: String, stop_tx: Arc<watch::Sender<bool>>) -> Arc<NodeServer> {
		Arc::new(NodeServer {
			node: Arc::new(Node::new()),
			host,
			center: ArcSwapOption::new(None),
			stop_tx,
		})
	}

	/// Connect to the coordination bus and register the agent watchers:
	/// center address pushes and block list refreshes. `mediator_addr` is
	/// a full host:port.
	pub async fn let_mediate(
		self: &Arc<Self>,
		mediator_addr: &str,
	) -> Result<Arc<BusClient>, Error> {
		let bus = BusClient::connect(mediator_addr).await?;
		info!("node server mediator client started");

		let this = self.clone();
		bus.watch_in_group(
			WATCH_GROUP_NODE_SERVER,
			"node-server-connect-to-center",
			move |value, _old| {
				let this = this.clone();
				async move {
					let addr = String::from_utf8_lossy(&value).into_owned();
					info!("node server center addr is {}", addr);
					this.connect_to_center(&addr).await;
				}
			},
		)
		.await?;

		let this = self.clone();
		bus.watch_in_group(WATCH_GROUP_NODE_SERVER, "node-server-block-refresh", move |value, _old| {
			let this = this.clone();
			async move {
				match decode_block_list(&value) {
					Ok(blocks) => {
						// the published table covers the whole cluster;
						// only blocks addressed to this agent are ours to
						// write
						let mine: Vec<_> = blocks
							.into_iter()
							.filter(|b| b.addr == this.host)
							.map(BlockInServer::new)
							.collect();
						for block in mine.iter() {
							info!("node server block refresh get block {:?}", block.block);
						}
						this.node.refresh_blocks(mine);
					}
					Err(e) => error!("node server block refresh decode error: {}", e),
				}
			}
		})
		.await?;

		Ok(bus)
	}

	pub fn is_center_connected(&self) -> bool {
		self.center.load().is_some()
	}

	pub async fn connect_to_center(&self, addr: &str) {
		if let Some(current) = self.center.load_full() {
			info!(
				"node server center client is already connected - {}",
				current.addr()
			);
			if current.addr() == addr {
				return;
			}
			info!("node server center client is stopping");
			current.stop();
		}
		match RpcClient::connect(addr).await {
			Ok(client) => {
				self.center.store(Some(client));
				info!("node server center client connected");
			}
			Err(e) => error!("node server center client connect error: {}", e),
		}
	}

	async fn handle_save(&self, oid: String, mime: u32, body: &[u8]) -> Result<NodeRpc, Error> {
		let mut rec = self.node.save_local(&oid, body).await?;
		rec.oid = oid;
		rec.mime = mime;

		let center = self
			.center
			.load_full()
			.ok_or_message("node server center client not connected")?;
		// TODO reset the block end position when the report fails, today a
		// monitor has to reconcile the unindexed tail
		match center.call(&CenterRpc::PutRecord(rec)).await {
			Ok(Ok(_)) => Ok(NodeRpc::Ok),
			Ok(Err(e)) => Err(Error::Message(format!(
				"node server put rec error - {}",
				e
			))),
			Err(e) => Err(Error::Message(format!(
				"node server put rec error - {}",
				e
			))),
		}
	}
}

#[async_trait]
impl EndpointHandler<NodeRpc> for NodeServer {
	async fn handle(self: &Arc<Self>, msg: NodeRpc, _from: SocketAddr) -> Result<NodeRpc, Error> {
		match msg {
			NodeRpc::Save { oid, mime, body } => self.handle_save(oid, mime, &body).await,
			NodeRpc::Get(rec) => Ok(NodeRpc::Data(self.node.get(&rec).await?)),
			NodeRpc::ReadFull { block_id } => {
				let _guard = self.node.lock_block(block_id).await?;
				Ok(NodeRpc::Data(self.node.read_full(block_id).await?))
			}
			NodeRpc::Close => {
				info!("node server stopping on close command");
				self.stop_tx.send(true)?;
				Ok(NodeRpc::Ok)
			}
			m => Err(Error::unexpected_rpc_message(&m)),
		}
	}
}
