//! Server side of the coordination bus. One long-lived TCP connection per
//! participant: keep-alive probing, host aliasing, watcher registration and
//! trigger dispatch, plus the operator DO_NOTIFY tunnel.
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use whisper_util::buffer_writer::BufferWriter;
use whisper_util::data::{split_on, SP};
use whisper_util::error::Error;
use whisper_util::time::now_unix_secs;

use crate::bus_client::{write_pack, PackReader};
use crate::pack::{cmd, enc_tri, Pack, Trigger, WATCHER_GROUP_ALL};

/// Seconds between a watcher registration and the firing of its
/// registration callback
pub const TRIGGER_DELAY_SEC: u64 = 3;
/// TCP keep-alive period set on every accepted connection
pub const CONN_KEEPALIVE_SEC: u64 = 30;
/// Seconds between two `?` probes published to every connection
pub const CHECK_ALIVE_INTERVAL_SEC: u64 = 10;
/// Size of one physical read on a bus connection
pub const READ_LEN_ONCE: usize = 1024;

pub type ServerPackHandler =
	Box<dyn Fn(Pack, String) -> BoxFuture<'static, Pack> + Send + Sync>;
pub type WatchRegisterCallback =
	Box<dyn Fn() -> BoxFuture<'static, (Vec<u8>, Vec<u8>)> + Send + Sync>;

struct WatcherInfo {
	group: String,
	key: String,
}

struct Conn {
	remote_addr: String,
	write: Arc<Mutex<OwnedWriteHalf>>,
}

/// Connection roster. Mutation and iteration all go through one lock:
/// the accept loop, the disconnect path and the broadcast paths contend
/// on it.
#[derive(Default)]
struct Roster {
	conns: Vec<Conn>,
	// keyed by remote transport address
	watcher_keys: HashMap<String, Vec<WatcherInfo>>,
	// logical host address to remote transport address
	host_addrs: HashMap<String, String>,
}

pub struct BusServer {
	local_addr: SocketAddr,
	roster: Mutex<Roster>,
	handlers: Mutex<HashMap<String, Arc<ServerPackHandler>>>,
	register_callbacks: Mutex<HashMap<String, Arc<WatchRegisterCallback>>>,
	alive_tx: mpsc::UnboundedSender<String>,
	alive_log: Mutex<Option<Arc<BufferWriter>>>,
	stop_tx: watch::Sender<bool>,
	stop_rx: watch::Receiver<bool>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BusServer {
	pub async fn start(addr: &str) -> Result<Arc<BusServer>, Error> {
		let listener = TcpListener::bind(addr).await?;
		let local_addr = listener.local_addr()?;
		info!("bus server started - {}", local_addr);

		let (stop_tx, stop_rx) = watch::channel(false);
		let (alive_tx, alive_rx) = mpsc::unbounded_channel();

		let server = Arc::new(BusServer {
			local_addr,
			roster: Mutex::new(Roster::default()),
			handlers: Mutex::new(HashMap::new()),
			register_callbacks: Mutex::new(HashMap::new()),
			alive_tx,
			alive_log: Mutex::new(None),
			stop_tx,
			stop_rx,
			tasks: Mutex::new(Vec::new()),
		});

		let accept = tokio::spawn(server.clone().accept_loop(listener));
		let probe = tokio::spawn(server.clone().check_alive_loop());
		let alive_log = tokio::spawn(server.clone().alive_log_loop(alive_rx));
		server
			.tasks
			.lock()
			.await
			.extend(vec![accept, probe, alive_log]);

		Ok(server)
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// Subscribe to the server stop signal
	pub fn stop_signal(&self) -> watch::Receiver<bool> {
		self.stop_rx.clone()
	}

	/// Install a handler for a command the built-ins do not cover.
	/// Replaces any handler previously installed for the same command.
	pub async fn add_handler<F, Fut>(&self, command: &str, handler: F)
	where
		F: Fn(Pack, String) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Pack> + Send + 'static,
	{
		let boxed: ServerPackHandler =
			Box::new(move |pack, remote| Box::pin(handler(pack, remote)));
		let mut handlers = self.handlers.lock().await;
		handlers.insert(command.to_string(), Arc::new(boxed));
		info!(
			"bus server handler number after add one - {} - {}",
			command,
			handlers.len()
		);
	}

	/// Install a registration callback: when a watcher registers for this
	/// `(group, key)`, the callback fires after [`TRIGGER_DELAY_SEC`] and
	/// its `(value, value_old)` is broadcast as a trigger.
	pub async fn add_watch_callback<F, Fut>(&self, group: &str, key: &str, callback: F)
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = (Vec<u8>, Vec<u8>)> + Send + 'static,
	{
		let group_key = format!("{},{}", group, key);
		let boxed: WatchRegisterCallback = Box::new(move || Box::pin(callback()));
		self.register_callbacks
			.lock()
			.await
			.insert(group_key.clone(), Arc::new(boxed));
		info!("bus server add watch register callback done - {}", group_key);
	}

	pub async fn set_alive_log_writer(&self, writer: Arc<BufferWriter>) {
		*self.alive_log.lock().await = Some(writer);
	}

	pub async fn list_clients(&self) -> Vec<String> {
		self.roster
			.lock()
			.await
			.conns
			.iter()
			.map(|c| c.remote_addr.clone())
			.collect()
	}

	/// Broadcast a pack to every connection
	pub async fn publish(&self, pack: &Pack) {
		let writes: Vec<Arc<Mutex<OwnedWriteHalf>>> = {
			let roster = self.roster.lock().await;
			roster.conns.iter().map(|c| c.write.clone()).collect()
		};
		for write in writes {
			if let Err(e) = write_pack(&write, pack).await {
				debug!("bus server publish write error: {}", e);
			}
		}
	}

	/// Unicast a pack to a connection, addressed either by its transport
	/// address or by a host alias declared with MAPPING_HOST
	pub async fn notify(&self, remote_addr: &str, pack: &Pack) {
		let target = {
			let roster = self.roster.lock().await;
			let alias = roster.host_addrs.get(remote_addr).cloned();
			roster
				.conns
				.iter()
				.find(|c| {
					c.remote_addr == remote_addr || Some(&c.remote_addr) == alias.as_ref()
				})
				.map(|c| c.write.clone())
		};
		match target {
			Some(write) => {
				if let Err(e) = write_pack(&write, pack).await {
					debug!("bus server notify write error: {}", e);
				}
			}
			None => warn!("remote addr not exists in clients - {}", remote_addr),
		}
	}

	/// Trigger the watcher bus, defaulting the empty group to `all`
	pub async fn tri(&self, group: &str, key: &str, value: &[u8], value_old: &[u8]) -> Vec<String> {
		let group = if group.is_empty() {
			WATCHER_GROUP_ALL
		} else {
			group
		};
		self.trigger(Trigger {
			group: group.to_string(),
			key: key.to_string(),
			value: value.to_vec(),
			value_old: value_old.to_vec(),
		})
		.await
	}

	/// Deliver a trigger. In the `all` group only the first matching client
	/// is notified (any-one-subscriber load balancing); in a named group
	/// every matching client is.
	pub async fn trigger(&self, t: Trigger) -> Vec<String> {
		let mut addrs = Vec::new();
		{
			let roster = self.roster.lock().await;
			'clients: for (remote_addr, watchers) in roster.watcher_keys.iter() {
				for w in watchers.iter() {
					if t.group != w.group || t.key != w.key {
						continue;
					}
					addrs.push(remote_addr.clone());
					if t.group == WATCHER_GROUP_ALL {
						break 'clients;
					}
					break;
				}
			}
		}
		info!(
			"bus server trigger - {},{} - {}",
			t.group,
			t.key,
			addrs.join(",")
		);

		let body = enc_tri(&t);
		for addr in addrs.iter() {
			let mut pack = Pack::with_body(cmd::TRIGGER_WATCHER, body.clone());
			pack.flag = true;
			self.notify(addr, &pack).await;
		}
		addrs
	}

	/// Shut the server down: stop all loops and wait for every connection
	/// task to finish
	pub async fn close(&self) {
		info!("bus server is closing");
		let _ = self.stop_tx.send(true);
		let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
		for h in handles {
			let _ = h.await;
		}
	}

	// ---- internals ----

	async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
		let mut stop = self.stop_rx.clone();
		loop {
			let accepted = select! {
				accepted = listener.accept() => accepted,
				_ = stop.changed() => {
					if *stop.borrow() {
						return;
					}
					continue;
				}
			};
			let (socket, peer) = match accepted {
				Ok(a) => a,
				Err(e) => {
					error!("bus server accept error: {}", e);
					continue;
				}
			};
			if let Err(e) = setup_keepalive(&socket) {
				error!("bus server set keepalive error: {}", e);
				continue;
			}

			let remote_addr = peer.to_string();
			let (read, write) = socket.into_split();
			let write = Arc::new(Mutex::new(write));

			{
				let mut roster = self.roster.lock().await;
				roster.conns.push(Conn {
					remote_addr: remote_addr.clone(),
					write,
				});
				info!("bus server found client connected - {}", remote_addr);
				info!("bus server client number - {}", roster.conns.len());
			}

			let task = tokio::spawn(self.clone().handle_conn(read, remote_addr));
			self.tasks.lock().await.push(task);
		}
	}

	async fn handle_conn(self: Arc<Self>, read: tokio::net::tcp::OwnedReadHalf, remote_addr: String) {
		let mut reader = PackReader::new(read);
		let mut stop = self.stop_rx.clone();
		loop {
			let pack = select! {
				pack = reader.next() => pack,
				_ = stop.changed() => {
					if *stop.borrow() {
						break;
					}
					continue;
				}
			};
			let pack = match pack {
				Some(p) => p,
				None => {
					info!("bus server found conn closed - {}", remote_addr);
					break;
				}
			};
			if !self.process_pack(pack, &remote_addr).await {
				break;
			}
		}
		self.disconnect(&remote_addr).await;
	}

	/// Returns false when the connection should be torn down
	async fn process_pack(self: &Arc<Self>, pack: Pack, remote_addr: &str) -> bool {
		let command = pack.command.clone();
		match command.as_str() {
			cmd::CLOSE => {
				let _ = self.stop_tx.send(true);
				false
			}
			cmd::QUIT => {
				info!("bus server client quitting - {}", remote_addr);
				false
			}
			cmd::REPLY_ALIVE => {
				let seconds_of_client = String::from_utf8_lossy(&pack.body).into_owned();
				let seconds_of_server = now_unix_secs();
				let client_host = self.client_host_by_remote_addr(remote_addr).await;
				let _ = self.alive_tx.send(format!(
					"{},{},{}",
					seconds_of_client, seconds_of_server, client_host
				));
				true
			}
			cmd::REGISTER_WATCHER => {
				self.register_watcher(pack, remote_addr).await;
				true
			}
			cmd::MAPPING_HOST => {
				let host_addr = String::from_utf8_lossy(&pack.body).into_owned();
				{
					let mut roster = self.roster.lock().await;
					roster
						.host_addrs
						.insert(host_addr.clone(), remote_addr.to_string());
				}
				info!(
					"bus server add host addr mapping - {} to {}",
					host_addr, remote_addr
				);
				self.reply(remote_addr, &Pack::ok(cmd::MAPPING_HOST)).await;
				true
			}
			cmd::DO_NOTIFY => {
				let is_ok = self.do_notify(&pack.body).await;
				let mut reply = Pack::new(cmd::DO_NOTIFY);
				reply.flag = is_ok;
				self.reply(remote_addr, &reply).await;
				true
			}
			other => {
				let handler = self.handlers.lock().await.get(other).cloned();
				match handler {
					Some(h) => {
						let reply = h(pack, remote_addr.to_string()).await;
						if !reply.is_no_return() {
							self.reply(remote_addr, &reply).await;
						}
					}
					None => warn!("bus server found no handler for {}", other),
				}
				true
			}
		}
	}

	async fn register_watcher(self: &Arc<Self>, pack: Pack, remote_addr: &str) {
		let group_key = String::from_utf8_lossy(&pack.body).into_owned();
		info!("bus server register watcher doing - {}", group_key);

		let parts: Vec<&str> = group_key.split(',').collect();
		if parts.len() != 2 {
			warn!(
				"bus server register watcher group/key not given - {}",
				group_key
			);
			return;
		}
		let (group, key) = (parts[0].to_string(), parts[1].to_string());

		{
			let mut roster = self.roster.lock().await;
			roster
				.watcher_keys
				.entry(remote_addr.to_string())
				.or_insert_with(Vec::new)
				.push(WatcherInfo {
					group: group.clone(),
					key: key.clone(),
				});
		}

		if let Some(callback) = self.register_callbacks.lock().await.get(&group_key).cloned()
		{
			let server = self.clone();
			tokio::spawn(async move {
				tokio::time::sleep(Duration::from_secs(TRIGGER_DELAY_SEC)).await;
				info!(
					"bus server trigger when client after watch register - {},{}",
					group, key
				);
				let (value, value_old) = callback().await;
				server
					.trigger(Trigger {
						group,
						key,
						value,
						value_old,
					})
					.await;
			});
		}

		self.reply(
			remote_addr,
			&Pack::with_body(cmd::ADD_WATCHER_DONE, pack.body),
		)
		.await;
	}

	/// Operator tunnel sub-grammar, split on SP:
	/// 3 parts pub, 4 parts notify, 5 parts tri
	async fn do_notify(&self, body: &[u8]) -> bool {
		let arr = split_on(body, SP);
		match arr.len() {
			3 if arr[0] == b"pub" => {
				let command = String::from_utf8_lossy(arr[1]).into_owned();
				self.publish(&Pack::with_body(&command, arr[2].to_vec()))
					.await;
				true
			}
			4 if arr[0] == b"notify" => {
				let remote_addr = String::from_utf8_lossy(arr[1]).into_owned();
				let command = String::from_utf8_lossy(arr[2]).into_owned();
				self.notify(&remote_addr, &Pack::with_body(&command, arr[3].to_vec()))
					.await;
				true
			}
			5 if arr[0] == b"tri" => {
				let group = String::from_utf8_lossy(arr[1]).into_owned();
				let key = String::from_utf8_lossy(arr[2]).into_owned();
				self.tri(&group, &key, arr[3], arr[4]).await;
				true
			}
			_ => false,
		}
	}

	async fn reply(&self, remote_addr: &str, pack: &Pack) {
		let target = {
			let roster = self.roster.lock().await;
			roster
				.conns
				.iter()
				.find(|c| c.remote_addr == remote_addr)
				.map(|c| c.write.clone())
		};
		if let Some(write) = target {
			if let Err(e) = write_pack(&write, pack).await {
				debug!("bus server reply write error: {}", e);
			}
		}
	}

	async fn disconnect(&self, remote_addr: &str) {
		let mut roster = self.roster.lock().await;
		let before = roster.conns.len();
		roster.conns.retain(|c| c.remote_addr != remote_addr);
		if roster.conns.len() < before {
			info!("bus server disconnect client - {}", remote_addr);
		}
	}

	async fn client_host_by_remote_addr(&self, remote_addr: &str) -> String {
		let roster = self.roster.lock().await;
		for (host, addr) in roster.host_addrs.iter() {
			if addr == remote_addr {
				return host.clone();
			}
		}
		remote_addr.to_string()
	}

	async fn check_alive_loop(self: Arc<Self>) {
		info!("bus server start check alive loop");
		let mut ticker = tokio::time::interval(Duration::from_secs(CHECK_ALIVE_INTERVAL_SEC));
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		let mut stop = self.stop_rx.clone();
		loop {
			select! {
				_ = ticker.tick() => {
					debug!("bus server check alive publishing");
					self.publish(&Pack::new(cmd::CHECK_ALIVE)).await;
				}
				_ = stop.changed() => {
					if *stop.borrow() {
						info!("bus server check alive loop is stopping");
						return;
					}
				}
			}
		}
	}

	async fn alive_log_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
		info!("bus server start check alive reply loop");
		let mut stop = self.stop_rx.clone();
		loop {
			let line = select! {
				line = rx.recv() => line,
				_ = stop.changed() => {
					if *stop.borrow() {
						return;
					}
					continue;
				}
			};
			let line = match line {
				Some(l) => l,
				None => return,
			};
			let writer = self.alive_log.lock().await.clone();
			match writer {
				Some(w) => {
					if let Err(e) = w.write_line(&line).await {
						error!("bus server alive log write error: {}", e);
					}
				}
				None => info!("bus server check alive - {}", line),
			}
		}
	}
}

fn setup_keepalive(socket: &TcpStream) -> Result<(), Error> {
	let sock_ref = socket2::SockRef::from(socket);
	let keepalive =
		socket2::TcpKeepalive::new().with_time(Duration::from_secs(CONN_KEEPALIVE_SEC));
	sock_ref.set_tcp_keepalive(&keepalive)?;
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::bus_client::BusClient;

	use std::sync::atomic::{AtomicUsize, Ordering};

	async fn wait_ready(client: &BusClient) {
		for _ in 0..100 {
			if client.watchers_ready().await {
				return;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		panic!("watchers were not acknowledged in time");
	}

	#[tokio::test]
	async fn test_watcher_all_group_notifies_one() {
		let server = BusServer::start("127.0.0.1:0").await.unwrap();
		let addr = server.local_addr().to_string();

		let hits = Arc::new(AtomicUsize::new(0));

		let c1 = BusClient::connect(&addr).await.unwrap();
		let h = hits.clone();
		c1.watch("block-refresh", move |_v, _old| {
			let h = h.clone();
			async move {
				h.fetch_add(1, Ordering::SeqCst);
			}
		})
		.await
		.unwrap();

		let c2 = BusClient::connect(&addr).await.unwrap();
		let h = hits.clone();
		c2.watch("block-refresh", move |_v, _old| {
			let h = h.clone();
			async move {
				h.fetch_add(1, Ordering::SeqCst);
			}
		})
		.await
		.unwrap();

		wait_ready(&c1).await;
		wait_ready(&c2).await;

		// empty group defaults to "all": exactly one subscriber receives it
		let notified = server.tri("", "block-refresh", b"v1", b"").await;
		assert_eq!(notified.len(), 1);
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert_eq!(hits.load(Ordering::SeqCst), 1);

		server.close().await;
	}

	#[tokio::test]
	async fn test_watcher_named_group_notifies_all() {
		let server = BusServer::start("127.0.0.1:0").await.unwrap();
		let addr = server.local_addr().to_string();

		let hits = Arc::new(AtomicUsize::new(0));
		let mut clients = Vec::new();
		for _ in 0..2 {
			let c = BusClient::connect(&addr).await.unwrap();
			let h = hits.clone();
			c.watch_in_group("named", "block-refresh", move |v, _old| {
				let h = h.clone();
				async move {
					assert_eq!(v, b"v2");
					h.fetch_add(1, Ordering::SeqCst);
				}
			})
			.await
			.unwrap();
			wait_ready(&c).await;
			clients.push(c);
		}

		let notified = server.tri("named", "block-refresh", b"v2", b"v1").await;
		assert_eq!(notified.len(), 2);
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert_eq!(hits.load(Ordering::SeqCst), 2);

		server.close().await;
	}

	#[tokio::test]
	async fn test_mapping_host_and_notify() {
		let server = BusServer::start("127.0.0.1:0").await.unwrap();
		let addr = server.local_addr().to_string();

		let c = BusClient::connect(&addr).await.unwrap();
		let got = Arc::new(AtomicUsize::new(0));
		let g = got.clone();
		c.add_handler("set-master", move |pack| {
			let g = g.clone();
			async move {
				assert_eq!(pack.body, b"true");
				g.fetch_add(1, Ordering::SeqCst);
				Pack::no_return()
			}
		})
		.await;

		c.send(&Pack::with_body(cmd::MAPPING_HOST, b"center-1:9770".to_vec()))
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_millis(100)).await;

		// notify through the declared alias instead of the transport addr
		server
			.notify(
				"center-1:9770",
				&Pack::with_body("set-master", b"true".to_vec()),
			)
			.await;
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert_eq!(got.load(Ordering::SeqCst), 1);

		server.close().await;
	}

	#[tokio::test]
	async fn test_do_notify_tri_grammar() {
		let server = BusServer::start("127.0.0.1:0").await.unwrap();
		let addr = server.local_addr().to_string();

		let c = BusClient::connect(&addr).await.unwrap();
		let hits = Arc::new(AtomicUsize::new(0));
		let h = hits.clone();
		c.watch_in_group("g", "conf-refresh", move |v, old| {
			let h = h.clone();
			async move {
				assert_eq!(v, b"new");
				assert_eq!(old, b"old");
				h.fetch_add(1, Ordering::SeqCst);
			}
		})
		.await
		.unwrap();
		wait_ready(&c).await;

		// operator tunnel: tri + group + key + value + valueOld
		let body = crate::pack::notify_body_tri("g", "conf-refresh", b"new", b"old");
		c.send(&Pack::with_body(cmd::DO_NOTIFY, body)).await.unwrap();

		tokio::time::sleep(Duration::from_millis(200)).await;
		assert_eq!(hits.load(Ordering::SeqCst), 1);

		server.close().await;
	}

	#[tokio::test]
	async fn test_registration_callback_fires() {
		let server = BusServer::start("127.0.0.1:0").await.unwrap();
		let addr = server.local_addr().to_string();

		server
			.add_watch_callback(WATCHER_GROUP_ALL, "block-refresh", || async {
				(b"blocks".to_vec(), Vec::new())
			})
			.await;

		let c = BusClient::connect(&addr).await.unwrap();
		let hits = Arc::new(AtomicUsize::new(0));
		let h = hits.clone();

		// tokio test time is real here; shorten the wait by checking the
		// callback scheduling only
		c.watch("block-refresh", move |v, _old| {
			let h = h.clone();
			async move {
				assert_eq!(v, b"blocks");
				h.fetch_add(1, Ordering::SeqCst);
			}
		})
		.await
		.unwrap();
		wait_ready(&c).await;

		tokio::time::sleep(Duration::from_secs(TRIGGER_DELAY_SEC + 1)).await;
		assert_eq!(hits.load(Ordering::SeqCst), 1);

		server.close().await;
	}
}
