//! Connection from the client to one agent
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use whisper_block::server::NodeRpc;
use whisper_index::record::Record;
use whisper_rpc::client::RpcClient;
use whisper_util::error::Error;

pub struct Connect {
	addr: String,
	c: Arc<RpcClient<NodeRpc>>,
	/// Per-call upload timeout in milliseconds, 0 disables it
	timeout_millis: u64,
}

impl Connect {
	pub async fn connect(addr: &str, timeout_millis: u64) -> Result<Arc<Connect>, Error> {
		let c = RpcClient::connect(addr).await?;
		info!("client to node server connected - {}", addr);
		Ok(Arc::new(Connect {
			addr: addr.to_string(),
			c,
			timeout_millis,
		}))
	}

	pub fn addr(&self) -> &str {
		&self.addr
	}

	pub fn close(&self) {
		self.c.stop();
		info!("client to node server disconnected - {}", self.addr);
	}

	/// Upload one copy. Failures are logged and reported as a boolean so
	/// the fan-out can wait for every copy.
	pub async fn upload(&self, oid: &str, body: Bytes, mime: u32) -> bool {
		let msg = NodeRpc::Save {
			oid: oid.to_string(),
			mime,
			body: body.to_vec(),
		};
		let res = if self.timeout_millis != 0 {
			self.c
				.call_timeout(&msg, Duration::from_millis(self.timeout_millis))
				.await
		} else {
			self.c.call(&msg).await
		};
		match res {
			Ok(Ok(_)) => true,
			Ok(Err(e)) => {
				error!("client upload error - {} - {}", oid, e);
				false
			}
			Err(Error::Timeout) => {
				error!("client upload timeout - {}", oid);
				false
			}
			Err(e) => {
				error!("client upload error - {} - {}", oid, e);
				false
			}
		}
	}

	/// Ranged download of one record's body
	pub async fn download(&self, rec: &Record) -> Result<Vec<u8>, Error> {
		match self.c.call(&NodeRpc::Get(rec.clone())).await? {
			Ok(NodeRpc::Data(body)) => Ok(body),
			Ok(m) => Err(Error::unexpected_rpc_message(&m)),
			Err(e) => {
				error!("client download error - {} - {}", rec.oid, e);
				Err(e)
			}
		}
	}
}
