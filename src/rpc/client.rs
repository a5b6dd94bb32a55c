//! Point-to-point RPC client side, with request multiplexing over one
//! connection
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use whisper_util::encode::{dec, enc};
use whisper_util::error::Error;

use crate::message::Message;
use crate::server::{FRAME_HEADER_LEN, MAX_FRAME_LEN, REQUEST_ID_LEN};

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<Vec<u8>>>>>;

pub struct RpcClient<M: Message> {
	addr: String,
	next_id: AtomicU64,
	pending: Pending,
	closed: Arc<AtomicBool>,
	write: Mutex<tokio::net::tcp::OwnedWriteHalf>,
	reader: JoinHandle<()>,
	_phantom: PhantomData<M>,
}

impl<M: Message> RpcClient<M> {
	pub async fn connect(addr: &str) -> Result<Arc<RpcClient<M>>, Error> {
		let socket = TcpStream::connect(addr).await?;
		socket.set_nodelay(true)?;
		let (read, write) = socket.into_split();

		let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
		let closed = Arc::new(AtomicBool::new(false));
		let reader = tokio::spawn(read_loop(
			read,
			pending.clone(),
			closed.clone(),
			addr.to_string(),
		));

		info!("rpc client connected - {}", addr);
		Ok(Arc::new(RpcClient {
			addr: addr.to_string(),
			next_id: AtomicU64::new(1),
			pending,
			closed,
			write: Mutex::new(write),
			reader,
			_phantom: PhantomData,
		}))
	}

	pub fn addr(&self) -> &str {
		&self.addr
	}

	pub async fn call(&self, msg: &M) -> Result<M::Response, Error> {
		self.call_opt(msg, None).await
	}

	pub async fn call_timeout(&self, msg: &M, timeout: Duration) -> Result<M::Response, Error> {
		self.call_opt(msg, Some(timeout)).await
	}

	async fn call_opt(&self, msg: &M, timeout: Option<Duration>) -> Result<M::Response, Error> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(Error::Message(format!(
				"rpc connection to {} closed",
				self.addr
			)));
		}

		let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = oneshot::channel();
		self.pending
			.lock()
			.unwrap()
			.insert(request_id, tx);

		let body = enc(msg)?;
		{
			let mut w = self.write.lock().await;
			w.write_all(&((REQUEST_ID_LEN + body.len()) as u32).to_be_bytes())
				.await?;
			w.write_all(&request_id.to_be_bytes()).await?;
			w.write_all(&body).await?;
		}

		// the reader may have stopped between the check above and the
		// registration: a pending entry would then never resolve
		if self.closed.load(Ordering::SeqCst) {
			self.pending.lock().unwrap().remove(&request_id);
			return Err(Error::Message(format!(
				"rpc connection to {} closed",
				self.addr
			)));
		}

		let resp_bytes = match timeout {
			None => rx
				.await
				.map_err(|_| Error::Message(format!("rpc connection to {} closed", self.addr)))?,
			Some(d) => match tokio::time::timeout(d, rx).await {
				Err(_) => {
					self.pending.lock().unwrap().remove(&request_id);
					return Err(Error::Timeout);
				}
				Ok(r) => r.map_err(|_| {
					Error::Message(format!("rpc connection to {} closed", self.addr))
				})?,
			},
		};

		dec(&resp_bytes)
	}

	/// Tear the connection down; every pending call gets a transport error
	pub fn stop(&self) {
		self.closed.store(true, Ordering::SeqCst);
		self.reader.abort();
		self.pending.lock().unwrap().clear();
	}
}

impl<M: Message> Drop for RpcClient<M> {
	fn drop(&mut self) {
		self.reader.abort();
	}
}

async fn read_loop(
	mut read: OwnedReadHalf,
	pending: Pending,
	closed: Arc<AtomicBool>,
	addr: String,
) {
	loop {
		let mut len_buf = [0u8; FRAME_HEADER_LEN];
		if read.read_exact(&mut len_buf).await.is_err() {
			break;
		}
		let len = u32::from_be_bytes(len_buf) as usize;
		if len < REQUEST_ID_LEN || len > MAX_FRAME_LEN {
			error!("rpc client {} received invalid frame length {}", addr, len);
			break;
		}
		let mut frame = vec![0u8; len];
		if read.read_exact(&mut frame).await.is_err() {
			break;
		}

		let mut id_buf = [0u8; REQUEST_ID_LEN];
		id_buf.copy_from_slice(&frame[..REQUEST_ID_LEN]);
		let request_id = u64::from_be_bytes(id_buf);

		let waiter = pending.lock().unwrap().remove(&request_id);
		match waiter {
			Some(tx) => {
				let _ = tx.send(frame[REQUEST_ID_LEN..].to_vec());
			}
			None => debug!("rpc client {} response for unknown request {}", addr, request_id),
		}
	}
	debug!("rpc client reader for {} stopped", addr);
	// Wake up the callers that will never get an answer
	closed.store(true, Ordering::SeqCst);
	pending.lock().unwrap().clear();
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::message::EndpointHandler;
	use crate::server::RpcServer;

	use std::net::SocketAddr;

	use async_trait::async_trait;
	use serde::{Deserialize, Serialize};
	use tokio::sync::watch;

	#[derive(Debug, Serialize, Deserialize)]
	enum EchoRpc {
		Echo(String),
		Reply(String),
		Fail,
	}

	impl Message for EchoRpc {
		type Response = Result<EchoRpc, Error>;
	}

	struct EchoHandler;

	#[async_trait]
	impl EndpointHandler<EchoRpc> for EchoHandler {
		async fn handle(self: &Arc<Self>, msg: EchoRpc, _from: SocketAddr) -> Result<EchoRpc, Error> {
			match msg {
				EchoRpc::Echo(s) => Ok(EchoRpc::Reply(s)),
				EchoRpc::Fail => Err(Error::Message("handler failure".into())),
				m => Err(Error::unexpected_rpc_message(&m)),
			}
		}
	}

	#[tokio::test]
	async fn test_rpc_roundtrip() {
		let server = RpcServer::bind("127.0.0.1:0").await.unwrap();
		let addr = server.local_addr();
		let (_stop_tx, stop_rx) = watch::channel(false);
		tokio::spawn(server.run(Arc::new(EchoHandler), stop_rx));

		let client = RpcClient::<EchoRpc>::connect(&addr.to_string()).await.unwrap();

		match client.call(&EchoRpc::Echo("ping".into())).await.unwrap() {
			Ok(EchoRpc::Reply(s)) => assert_eq!(s, "ping"),
			other => panic!("unexpected response: {:?}", other),
		}

		// A logical failure travels inside the response, not as a
		// transport error
		match client.call(&EchoRpc::Fail).await.unwrap() {
			Err(Error::RemoteError(msg)) => assert_eq!(msg, "handler failure"),
			other => panic!("unexpected response: {:?}", other),
		}
	}

	#[tokio::test]
	async fn test_rpc_concurrent_calls() {
		let server = RpcServer::bind("127.0.0.1:0").await.unwrap();
		let addr = server.local_addr();
		let (_stop_tx, stop_rx) = watch::channel(false);
		tokio::spawn(server.run(Arc::new(EchoHandler), stop_rx));

		let client = RpcClient::<EchoRpc>::connect(&addr.to_string()).await.unwrap();

		let mut calls = Vec::new();
		for i in 0..16 {
			let client = client.clone();
			calls.push(tokio::spawn(async move {
				client.call(&EchoRpc::Echo(format!("m{}", i))).await
			}));
		}
		for (i, c) in calls.into_iter().enumerate() {
			match c.await.unwrap().unwrap() {
				Ok(EchoRpc::Reply(s)) => assert_eq!(s, format!("m{}", i)),
				other => panic!("unexpected response: {:?}", other),
			}
		}
	}
}
