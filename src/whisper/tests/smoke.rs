//! Whole-cluster smoke tests: coordinator, center, agents and client all
//! in one process, wired through the bus exactly as a deployment would be.
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;

use whisper_block::server::{NodeServer, WATCH_GROUP_NODE_SERVER};
use whisper_center::center::Center;
use whisper_center::mediate::CMD_MED_SET_MASTER;
use whisper_center::rpc::CenterRpc;
use whisper_center::server::CenterServer;
use whisper_client::client::{Client, ConnConf, WATCH_GROUP_CLIENT, STRATEGY_FILLING_RATE};
use whisper_mediator::mediator::Mediator;
use whisper_rpc::bus_client::BusClient;
use whisper_rpc::client::RpcClient;
use whisper_rpc::pack::Pack;
use whisper_rpc::server::RpcServer;
use whisper_util::background::BackgroundRunner;
use whisper_util::data::{MIME_JPG, STATUS_RECORD_DISABLE};
use whisper_util::encode::enc;

async fn wait_until<F, Fut>(what: &str, mut cond: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	for _ in 0..400 {
		if cond().await {
			return;
		}
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
	panic!("timed out waiting for {}", what);
}

async fn start_center(
	mediator_bus: &str,
	data_dir: &Path,
) -> (Arc<CenterServer>, String, Arc<BusClient>) {
	let center = Arc::new(Center::new());
	let id = center
		.new_index(&data_dir.to_string_lossy())
		.await
		.unwrap();
	assert_eq!(id, 1);

	let (stop_tx, stop_rx) = watch::channel(false);
	let (bg, _bg_done) = BackgroundRunner::new(stop_rx.clone());

	let rpc = RpcServer::bind("127.0.0.1:0").await.unwrap();
	let addr = rpc.local_addr().to_string();
	let cs = CenterServer::new(center, addr.clone(), bg, Arc::new(stop_tx));
	tokio::spawn(rpc.run(cs.clone(), stop_rx));

	let bus = cs.let_mediate(mediator_bus).await.unwrap();
	(cs, addr, bus)
}

struct Agent {
	server: Arc<NodeServer>,
	addr: String,
	stop_tx: Arc<watch::Sender<bool>>,
	_bus: Arc<BusClient>,
}

async fn start_agent(mediator_bus: &str) -> Agent {
	let (stop_tx, stop_rx) = watch::channel(false);
	let stop_tx = Arc::new(stop_tx);

	let rpc = RpcServer::bind("127.0.0.1:0").await.unwrap();
	let addr = rpc.local_addr().to_string();
	let server = NodeServer::new(addr.clone(), stop_tx.clone());
	tokio::spawn(rpc.run(server.clone(), stop_rx));

	let bus = server.let_mediate(mediator_bus).await.unwrap();
	Agent {
		server,
		addr,
		stop_tx,
		_bus: bus,
	}
}

struct Cluster {
	mediator: Arc<Mediator>,
	center: Arc<CenterServer>,
	center_addr: String,
	agents: Vec<Agent>,
	client: Arc<Client>,
	_center_bus: Arc<BusClient>,
	_client_bus: Arc<BusClient>,
	_dir: mktemp::Temp,
}

/// Bring a full cluster up: one coordinator, one master center, n agents
/// with one fresh block each, one client configured for copy_num copies.
async fn start_cluster(n_agents: usize, copy_num: u32, block_dirs: Vec<String>) -> Cluster {
	let dir = mktemp::Temp::new_dir().unwrap();

	let mediator = Mediator::start("127.0.0.1:0", dir.to_path_buf())
		.await
		.unwrap();
	let bus_addr = mediator.server.local_addr().to_string();

	let (center, center_addr, center_bus) =
		start_center(&bus_addr, &dir.to_path_buf().join("data_1")).await;

	let mut agents = Vec::new();
	for _ in 0..n_agents {
		agents.push(start_agent(&bus_addr).await);
	}

	let client = Client::new();
	let client_bus = client.start(&bus_addr).await.unwrap();

	let buses: Vec<Arc<BusClient>> = {
		let mut v = vec![client_bus.clone()];
		v.extend(agents.iter().map(|a| a._bus.clone()));
		v
	};
	wait_until("watcher registration", || {
		let buses = buses.clone();
		async move {
			for bus in buses.iter() {
				if !bus.watchers_ready().await {
					return false;
				}
			}
			true
		}
	})
	.await;

	// promote the center through its declared host mapping; the mapping
	// itself may still be in flight, so retry until the role sticks
	for _ in 0..200 {
		mediator
			.server
			.notify(
				&center_addr,
				&Pack::with_body(CMD_MED_SET_MASTER, b"true".to_vec()),
			)
			.await;
		tokio::time::sleep(Duration::from_millis(25)).await;
		if center.is_master() {
			break;
		}
	}
	assert!(center.is_master(), "center promotion timed out");

	// point the agents and the client at the center
	mediator
		.server
		.tri(
			WATCH_GROUP_NODE_SERVER,
			"node-server-connect-to-center",
			center_addr.as_bytes(),
			b"",
		)
		.await;
	mediator
		.server
		.tri(
			WATCH_GROUP_CLIENT,
			"client-connect-to-center",
			center_addr.as_bytes(),
			b"",
		)
		.await;

	// one block per agent, then publish the table
	for (agent, block_dir) in agents.iter().zip(block_dirs.iter()) {
		mediator
			.new_block(1, &agent.addr, block_dir, 64 * 1024 * 1024)
			.await
			.unwrap();
	}
	mediator.publish_blocks().await.unwrap();

	// client connections to every agent
	let agent_addrs: Vec<String> = agents.iter().map(|a| a.addr.clone()).collect();
	mediator
		.server
		.tri(
			WATCH_GROUP_CLIENT,
			"client-connect-to-node-server",
			agent_addrs.join(",").as_bytes(),
			b"",
		)
		.await;

	// client write configuration
	let conf = ConnConf {
		strategy: STRATEGY_FILLING_RATE,
		copy_num,
		index_id: 1,
		timeout_millis: 0,
	};
	mediator
		.server
		.tri(
			WATCH_GROUP_CLIENT,
			"client-conf-refresh",
			&enc(&conf).unwrap(),
			b"",
		)
		.await;

	let n_agents = agents.len();
	let client2 = client.clone();
	wait_until("cluster wiring", || {
		let client = client2.clone();
		async move {
			client.is_center_connected()
				&& client.block_count() >= n_agents
				&& client.node_server_count().await >= n_agents
				&& client.conf().copy_num == copy_num
		}
	})
	.await;

	let agent_servers: Vec<Arc<NodeServer>> = agents.iter().map(|a| a.server.clone()).collect();
	wait_until("agent wiring", || {
		let servers = agent_servers.clone();
		async move {
			servers
				.iter()
				.all(|s| s.is_center_connected() && s.node.block_count() > 0)
		}
	})
	.await;

	Cluster {
		mediator,
		center,
		center_addr,
		agents,
		client,
		_center_bus: center_bus,
		_client_bus: client_bus,
		_dir: dir,
	}
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_copy_roundtrip() {
	let dir = mktemp::Temp::new_dir().unwrap();
	let block_dir = dir.to_path_buf().join("blocks");
	tokio::fs::create_dir_all(&block_dir).await.unwrap();

	let cluster = start_cluster(
		1,
		0,
		vec![block_dir.to_string_lossy().into_owned()],
	)
	.await;

	let oid = cluster
		.client
		.save(Bytes::from_static(b"hello"), MIME_JPG)
		.await
		.unwrap();
	assert!(oid.starts_with("1_0_"));

	let (body, mime) = cluster.client.get(&oid).await.unwrap();
	assert_eq!(body, b"hello");
	assert_eq!(mime, MIME_JPG);

	cluster.mediator.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replica_read_fallback() {
	let dir = mktemp::Temp::new_dir().unwrap();
	let d0 = dir.to_path_buf().join("blocks-0");
	let d1 = dir.to_path_buf().join("blocks-1");
	tokio::fs::create_dir_all(&d0).await.unwrap();
	tokio::fs::create_dir_all(&d1).await.unwrap();

	let cluster = start_cluster(
		2,
		1,
		vec![
			d0.to_string_lossy().into_owned(),
			d1.to_string_lossy().into_owned(),
		],
	)
	.await;

	let oid = cluster
		.client
		.save(Bytes::from_static(b"replica"), MIME_JPG)
		.await
		.unwrap();

	// both copies are present: one per agent block dir
	assert!(tokio::fs::metadata(d0.join("block_1")).await.is_ok());
	assert!(tokio::fs::metadata(d1.join("block_2")).await.is_ok());

	// kill the agent hosting copy 0
	cluster.agents[0].stop_tx.send(true).unwrap();
	tokio::time::sleep(Duration::from_millis(200)).await;

	let (body, _mime) = cluster.client.get(&oid).await.unwrap();
	assert_eq!(body, b"replica");

	cluster.mediator.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_partial_write_disables_oid() {
	let dir = mktemp::Temp::new_dir().unwrap();
	let good = dir.to_path_buf().join("blocks-good");
	tokio::fs::create_dir_all(&good).await.unwrap();
	// second agent's block dir does not exist and cannot be created
	let broken = "/nonexistent-whisper-test/blocks".to_string();

	let cluster = start_cluster(
		2,
		1,
		vec![good.to_string_lossy().into_owned(), broken],
	)
	.await;

	let res = cluster
		.client
		.save(Bytes::from_static(b"doomed"), MIME_JPG)
		.await;
	assert!(res.is_err());

	// the copy that landed must end up disabled on the primary
	let meta = RpcClient::<CenterRpc>::connect(&cluster.center_addr)
		.await
		.unwrap();
	let center = cluster.center.clone();
	wait_until("oid disabled on the primary", || {
		let center = center.clone();
		async move {
			match center.center.records_by_block(1).await {
				Ok(recs) => {
					!recs.is_empty() && recs.iter().all(|r| r.status == STATUS_RECORD_DISABLE)
				}
				Err(_) => false,
			}
		}
	})
	.await;

	// and a metadata read shows the DISABLE status
	let recs = cluster.center.center.records_by_block(1).await.unwrap();
	match meta
		.call(&CenterRpc::GetOidMeta(recs[0].oid.clone()))
		.await
		.unwrap()
		.unwrap()
	{
		CenterRpc::Record(rec) => assert_eq!(rec.status, STATUS_RECORD_DISABLE),
		other => panic!("unexpected response: {:?}", other),
	}

	// the client refuses to serve a disabled object
	let oid_info: Vec<&str> = recs[0].oid.split('_').collect();
	let logical = oid_info[..4].join("_");
	assert!(cluster.client.get(&logical).await.is_err());

	cluster.mediator.close().await;
}
