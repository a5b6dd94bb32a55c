//! Point-to-point RPC server side
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{watch, Mutex};

use whisper_util::background::wait_from;
use whisper_util::encode::{dec, enc};
use whisper_util::error::Error;

use crate::message::{EndpointHandler, Message};

/// Frames are `u32` length-prefixed; the length covers the 8-byte request id
/// and the encoded body that follow.
pub(crate) const FRAME_HEADER_LEN: usize = 4;
pub(crate) const REQUEST_ID_LEN: usize = 8;

/// Hard cap on a single frame, to fail fast on garbage input
pub(crate) const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

pub struct RpcServer {
	listener: TcpListener,
	local_addr: SocketAddr,
}

impl RpcServer {
	pub async fn bind(addr: &str) -> Result<RpcServer, Error> {
		let listener = TcpListener::bind(addr).await?;
		let local_addr = listener.local_addr()?;
		info!("rpc server listening on {}", local_addr);
		Ok(RpcServer {
			listener,
			local_addr,
		})
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// Accept loop: runs until the stop signal flips. Each connection runs
	/// in its own task; in-flight requests are cancelled on shutdown.
	pub async fn run<M, H>(
		self,
		handler: Arc<H>,
		must_exit: watch::Receiver<bool>,
	) -> Result<(), Error>
	where
		M: Message,
		H: EndpointHandler<M> + 'static,
	{
		loop {
			let mut exit = must_exit.clone();
			let accepted = select! {
				accepted = self.listener.accept() => accepted,
				_ = exit.changed() => {
					if *exit.borrow() {
						info!("rpc server on {} is stopping", self.local_addr);
						return Ok(());
					}
					continue;
				}
			};
			let (socket, from) = match accepted {
				Ok(a) => a,
				Err(e) => {
					error!("rpc server accept error: {}", e);
					continue;
				}
			};
			let handler = handler.clone();
			let exit = must_exit.clone();
			tokio::spawn(async move {
				select! {
					res = handle_conn(socket, from, handler) => {
						if let Err(e) = res {
							debug!("rpc connection with {} closed: {}", from, e);
						}
					}
					_ = wait_from(exit) => (),
				}
			});
		}
	}
}

async fn handle_conn<M, H>(socket: TcpStream, from: SocketAddr, handler: Arc<H>) -> Result<(), Error>
where
	M: Message,
	H: EndpointHandler<M> + 'static,
{
	socket.set_nodelay(true)?;
	let (mut read, write) = socket.into_split();
	let write = Arc::new(Mutex::new(write));

	loop {
		let mut len_buf = [0u8; FRAME_HEADER_LEN];
		read.read_exact(&mut len_buf).await?;
		let len = u32::from_be_bytes(len_buf) as usize;
		if len < REQUEST_ID_LEN || len > MAX_FRAME_LEN {
			return Err(Error::Message(format!("invalid rpc frame length {}", len)));
		}

		let mut frame = vec![0u8; len];
		read.read_exact(&mut frame).await?;

		let handler = handler.clone();
		let write = write.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_frame::<M, H>(frame, from, handler, write).await {
				warn!("rpc request from {} failed: {}", from, e);
			}
		});
	}
}

async fn handle_frame<M, H>(
	frame: Vec<u8>,
	from: SocketAddr,
	handler: Arc<H>,
	write: Arc<Mutex<OwnedWriteHalf>>,
) -> Result<(), Error>
where
	M: Message,
	H: EndpointHandler<M>,
{
	let mut id_buf = [0u8; REQUEST_ID_LEN];
	id_buf.copy_from_slice(&frame[..REQUEST_ID_LEN]);
	let request_id = u64::from_be_bytes(id_buf);

	let msg: M = dec(&frame[REQUEST_ID_LEN..])?;
	let resp = handler.handle(msg, from).await;
	let body = enc(&resp)?;

	let mut w = write.lock().await;
	w.write_all(&((REQUEST_ID_LEN + body.len()) as u32).to_be_bytes())
		.await?;
	w.write_all(&request_id.to_be_bytes()).await?;
	w.write_all(&body).await?;
	Ok(())
}
