//! Client side of the coordination bus: one long-lived connection, a
//! watcher registry with callbacks, and handlers for control commands
//! pushed by the coordinator.
//!
//! Callbacks and handlers are never invoked from the socket-reader task:
//! the reader only decodes frames and forwards them to a single dispatcher
//! task, which serializes every callback invocation.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use whisper_util::data::{find_delim, CL};
use whisper_util::error::Error;
use whisper_util::time::now_unix_secs;

use crate::bus_server::READ_LEN_ONCE;
use crate::pack::{cmd, dec_tri, frame_pack, decode_pack, Pack, WATCHER_GROUP_ALL};

pub type WatcherCallback = Box<dyn Fn(Vec<u8>, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type PackHandler = Box<dyn Fn(Pack) -> BoxFuture<'static, Pack> + Send + Sync>;

const WATCHER_STATUS_INIT: u32 = 0;
const WATCHER_STATUS_OK: u32 = 1;

struct Watcher {
	group: String,
	key: String,
	status: u32,
	callback: Arc<WatcherCallback>,
}

#[derive(Default)]
struct ClientState {
	watchers: Vec<Watcher>,
	handlers: HashMap<String, Arc<PackHandler>>,
}

pub struct BusClient {
	addr: String,
	write: Arc<Mutex<OwnedWriteHalf>>,
	state: Arc<Mutex<ClientState>>,
	reader: JoinHandle<()>,
	dispatcher: JoinHandle<()>,
}

impl BusClient {
	pub async fn connect(addr: &str) -> Result<Arc<BusClient>, Error> {
		let socket = TcpStream::connect(addr).await?;
		info!("bus client connected - {}", addr);
		let (read, write) = socket.into_split();
		let write = Arc::new(Mutex::new(write));
		let state = Arc::new(Mutex::new(ClientState::default()));

		let (tx_pack, rx_pack) = mpsc::unbounded_channel();
		let reader = tokio::spawn(read_loop(read, tx_pack, addr.to_string()));
		let dispatcher = tokio::spawn(dispatch_loop(rx_pack, state.clone(), write.clone()));

		Ok(Arc::new(BusClient {
			addr: addr.to_string(),
			write,
			state,
			reader,
			dispatcher,
		}))
	}

	pub fn addr(&self) -> &str {
		&self.addr
	}

	pub async fn send(&self, pack: &Pack) -> Result<(), Error> {
		write_pack(&self.write, pack).await
	}

	/// Register a watcher in the load-balanced `all` group
	pub async fn watch<F, Fut>(&self, key: &str, callback: F) -> Result<(), Error>
	where
		F: Fn(Vec<u8>, Vec<u8>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		self.watch_in_group(WATCHER_GROUP_ALL, key, callback).await
	}

	pub async fn watch_in_group<F, Fut>(
		&self,
		group: &str,
		key: &str,
		callback: F,
	) -> Result<(), Error>
	where
		F: Fn(Vec<u8>, Vec<u8>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		info!("bus client add watcher - {},{}", group, key);
		let boxed: WatcherCallback = Box::new(move |value, value_old| {
			Box::pin(callback(value, value_old))
		});
		self.state.lock().await.watchers.push(Watcher {
			group: group.to_string(),
			key: key.to_string(),
			status: WATCHER_STATUS_INIT,
			callback: Arc::new(boxed),
		});
		self.send(&Pack::with_body(
			cmd::REGISTER_WATCHER,
			format!("{},{}", group, key).into_bytes(),
		))
		.await
	}

	/// Install a handler for a control command pushed by the coordinator.
	/// Replaces any handler previously installed for the same command.
	pub async fn add_handler<F, Fut>(&self, command: &str, handler: F)
	where
		F: Fn(Pack) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Pack> + Send + 'static,
	{
		let boxed: PackHandler = Box::new(move |pack| Box::pin(handler(pack)));
		let mut state = self.state.lock().await;
		state
			.handlers
			.insert(command.to_string(), Arc::new(boxed));
		info!(
			"bus client handler number after add one - {} - {}",
			command,
			state.handlers.len()
		);
	}

	/// Whether every registered watcher has been acknowledged by the server
	pub async fn watchers_ready(&self) -> bool {
		self.state
			.lock()
			.await
			.watchers
			.iter()
			.all(|w| w.status == WATCHER_STATUS_OK)
	}

	/// Voluntary disconnect
	pub async fn close(&self) {
		info!("bus client is closing - {}", self.addr);
		let _ = self.send(&Pack::new(cmd::QUIT)).await;
		self.reader.abort();
		self.dispatcher.abort();
	}
}

impl Drop for BusClient {
	fn drop(&mut self) {
		self.reader.abort();
		self.dispatcher.abort();
	}
}

pub(crate) async fn write_pack(
	write: &Mutex<OwnedWriteHalf>,
	pack: &Pack,
) -> Result<(), Error> {
	let framed = frame_pack(pack)?;
	let mut w = write.lock().await;
	w.write_all(&framed).await?;
	Ok(())
}

/// Reads 1024-byte chunks and reassembles CL-delimited frames. A frame
/// split across two reads is buffered until complete.
pub(crate) struct PackReader {
	read: OwnedReadHalf,
	pending: Vec<u8>,
}

impl PackReader {
	pub(crate) fn new(read: OwnedReadHalf) -> Self {
		PackReader {
			read,
			pending: Vec::new(),
		}
	}

	/// Next decoded pack, or None once the connection is closed.
	/// Undecodable frames are logged and skipped.
	pub(crate) async fn next(&mut self) -> Option<Pack> {
		let mut chunk = [0u8; READ_LEN_ONCE];
		loop {
			while let Some(pos) = find_delim(&self.pending, CL) {
				let frame: Vec<u8> = self.pending.drain(..pos + CL.len()).collect();
				let frame = &frame[..pos];
				if frame.is_empty() {
					continue;
				}
				match decode_pack(frame) {
					Ok(pack) => return Some(pack),
					Err(e) => error!("undecodable pack on bus connection: {}", e),
				}
			}
			match self.read.read(&mut chunk).await {
				Ok(0) => return None,
				Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
				Err(_) => return None,
			}
		}
	}
}

async fn read_loop(read: OwnedReadHalf, tx: mpsc::UnboundedSender<Pack>, addr: String) {
	let mut reader = PackReader::new(read);
	while let Some(pack) = reader.next().await {
		if tx.send(pack).is_err() {
			break;
		}
	}
	info!("bus client reader for {} stopped", addr);
}

async fn dispatch_loop(
	mut rx: mpsc::UnboundedReceiver<Pack>,
	state: Arc<Mutex<ClientState>>,
	write: Arc<Mutex<OwnedWriteHalf>>,
) {
	while let Some(pack) = rx.recv().await {
		let command = pack.command.clone();
		match command.as_str() {
			cmd::TRIGGER_WATCHER => {
				let trigger = match dec_tri(&pack.body) {
					Ok(t) => t,
					Err(e) => {
						error!("bus client received bad trigger: {}", e);
						continue;
					}
				};
				let callbacks: Vec<Arc<WatcherCallback>> = {
					let state = state.lock().await;
					state
						.watchers
						.iter()
						.filter(|w| {
							w.group == trigger.group
								&& w.key == trigger.key && w.status == WATCHER_STATUS_OK
						})
						.map(|w| w.callback.clone())
						.collect()
				};
				for cb in callbacks {
					info!(
						"bus client watcher triggered - {},{}",
						trigger.group, trigger.key
					);
					cb(trigger.value.clone(), trigger.value_old.clone()).await;
				}
			}
			cmd::ADD_WATCHER_DONE => {
				let group_key = String::from_utf8_lossy(&pack.body).into_owned();
				let mut state = state.lock().await;
				match state
					.watchers
					.iter_mut()
					.find(|w| format!("{},{}", w.group, w.key) == group_key)
				{
					Some(w) => {
						w.status = WATCHER_STATUS_OK;
						info!("bus client watcher register ok - {}", group_key);
					}
					None => warn!("bus client add watcher done for unknown - {}", group_key),
				}
			}
			cmd::CHECK_ALIVE => {
				let reply = Pack::with_body(
					cmd::REPLY_ALIVE,
					now_unix_secs().to_string().into_bytes(),
				);
				if let Err(e) = write_pack(&write, &reply).await {
					error!("bus client alive reply error: {}", e);
				}
			}
			other => {
				let handler = state.lock().await.handlers.get(other).cloned();
				match handler {
					Some(h) => {
						let reply = h(pack).await;
						if !reply.is_no_return() {
							if let Err(e) = write_pack(&write, &reply).await {
								error!("bus client reply error: {}", e);
							}
						}
					}
					None => warn!("bus client found no handler for {}", other),
				}
			}
		}
	}
}
