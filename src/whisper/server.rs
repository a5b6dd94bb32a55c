//! Per-role startup, shutdown plumbing, and the operator control commands
use std::sync::Arc;

use tokio::sync::watch;

use whisper_block::server::{NodeRpc, NodeServer};
use whisper_center::center::Center;
use whisper_center::rpc::CenterRpc;
use whisper_center::server::CenterServer;
use whisper_client::client::Client;
use whisper_mediator::mediator::Mediator;
use whisper_rpc::bus_client::BusClient;
use whisper_rpc::client::RpcClient;
use whisper_rpc::pack::{cmd, Pack};
use whisper_rpc::server::RpcServer;
use whisper_util::background::{wait_from, BackgroundRunner};
use whisper_util::config::{Config, Role};
use whisper_util::data::{
	LOCALHOST, SERVER_PORT_AGENT, SERVER_PORT_CENTER, SERVER_PORT_MEDIATOR,
};
use whisper_util::error::Error;

pub async fn run_server(config: Config) -> Result<(), Error> {
	info!("starting whisper {} role", config.role.name());
	tokio::fs::create_dir_all(&config.base_dir).await?;

	match config.role {
		Role::Mediator => run_mediator(config).await,
		Role::Center => run_center(config).await,
		Role::Agent => run_agent(config).await,
		Role::Client => run_client(config).await,
	}
}

fn mediator_addr(config: &Config) -> String {
	format!("{}:{}", config.mediator_host, SERVER_PORT_MEDIATOR)
}

async fn run_mediator(config: Config) -> Result<(), Error> {
	let (_stop_tx, stop_rx) = watch_shutdown_signal();

	let bind = format!("{}:{}", LOCALHOST, SERVER_PORT_MEDIATOR);
	let mediator = Mediator::start(&bind, config.base_dir.clone()).await?;
	mediator.load().await?;

	// runs until a signal arrives or an operator sends CLOSE on the bus
	tokio::select! {
		_ = wait_from(stop_rx) => (),
		_ = wait_from(mediator.server.stop_signal()) => (),
	}

	mediator.persist().await?;
	mediator.close().await;
	info!("mediator exited");
	Ok(())
}

async fn run_center(config: Config) -> Result<(), Error> {
	let (stop_tx, stop_rx) = watch_shutdown_signal();

	let center = Arc::new(Center::load(&config.base_dir).await?);

	let (bg, bg_done) = BackgroundRunner::new(stop_rx.clone());

	let rpc = RpcServer::bind(&format!("{}:{}", LOCALHOST, SERVER_PORT_CENTER)).await?;
	let host = rpc.local_addr().to_string();
	let server = CenterServer::new(center, host, bg, stop_tx);
	let run_rpc = tokio::spawn(rpc.run(server.clone(), stop_rx.clone()));

	let bus = server.let_mediate(&mediator_addr(&config)).await?;

	wait_from(stop_rx).await;

	bus.close().await;
	if let Err(e) = run_rpc.await? {
		error!("center rpc server exited with error: {}", e);
	}
	// wait for the putback worker to drain
	bg_done.await?;
	info!("center exited");
	Ok(())
}

async fn run_agent(config: Config) -> Result<(), Error> {
	let (stop_tx, stop_rx) = watch_shutdown_signal();

	let host = format!("{}:{}", LOCALHOST, SERVER_PORT_AGENT);
	let rpc = RpcServer::bind(&host).await?;
	let server = NodeServer::new(host, stop_tx);
	let run_rpc = tokio::spawn(rpc.run(server.clone(), stop_rx.clone()));

	let bus = server.let_mediate(&mediator_addr(&config)).await?;

	wait_from(stop_rx).await;

	bus.close().await;
	if let Err(e) = run_rpc.await? {
		error!("node rpc server exited with error: {}", e);
	}
	info!("node server exited");
	Ok(())
}

async fn run_client(config: Config) -> Result<(), Error> {
	let (_stop_tx, stop_rx) = watch_shutdown_signal();

	let client = Client::new();
	let bus = client.start(&mediator_addr(&config)).await?;

	wait_from(stop_rx).await;

	client.close().await;
	bus.close().await;
	info!("client exited");
	Ok(())
}

pub async fn run_close(config: Config, rpc_host: Option<String>) -> Result<(), Error> {
	match config.role {
		Role::Mediator => {
			let bus = BusClient::connect(&mediator_addr(&config)).await?;
			bus.send(&Pack::new(cmd::CLOSE)).await?;
			bus.close().await;
		}
		Role::Center => {
			let addr =
				rpc_host.unwrap_or_else(|| format!("{}:{}", LOCALHOST, SERVER_PORT_CENTER));
			let client = RpcClient::<CenterRpc>::connect(&addr).await?;
			client.call(&CenterRpc::Close).await??;
		}
		Role::Agent => {
			let addr =
				rpc_host.unwrap_or_else(|| format!("{}:{}", LOCALHOST, SERVER_PORT_AGENT));
			let client = RpcClient::<NodeRpc>::connect(&addr).await?;
			client.call(&NodeRpc::Close).await??;
		}
		Role::Client => {
			info!("not implemented for closing client from shell, use mediator instead");
		}
	}
	Ok(())
}

pub async fn run_mediator_control(config: Config) -> Result<(), Error> {
	let body_file = config.mediator_control_body_file.clone().ok_or_else(|| {
		Error::Message("mediatorControlBodyFile required for mediator-control".into())
	})?;
	let body = tokio::fs::read(&body_file).await?;

	let bus = BusClient::connect(&mediator_addr(&config)).await?;
	bus.send(&Pack::with_body(cmd::DO_NOTIFY, body)).await?;
	// leave the reply a moment to come back before tearing down
	tokio::time::sleep(std::time::Duration::from_millis(500)).await;
	bus.close().await;
	Ok(())
}

#[cfg(unix)]
fn watch_shutdown_signal() -> (Arc<watch::Sender<bool>>, watch::Receiver<bool>) {
	use tokio::signal::unix::*;

	let (send_cancel, watch_cancel) = watch::channel(false);
	let send_cancel = Arc::new(send_cancel);
	let send_cancel2 = send_cancel.clone();
	tokio::spawn(async move {
		let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
		let mut sigterm =
			signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
		tokio::select! {
			_ = sigint.recv() => info!("Received SIGINT, shutting down."),
			_ = sigterm.recv() => info!("Received SIGTERM, shutting down."),
		}
		let _ = send_cancel2.send(true);
	});
	(send_cancel, watch_cancel)
}

#[cfg(not(unix))]
fn watch_shutdown_signal() -> (Arc<watch::Sender<bool>>, watch::Receiver<bool>) {
	let (send_cancel, watch_cancel) = watch::channel(false);
	let send_cancel = Arc::new(send_cancel);
	let send_cancel2 = send_cancel.clone();
	tokio::spawn(async move {
		tokio::signal::ctrl_c()
			.await
			.expect("Failed to install Ctrl-C handler");
		info!("Received Ctrl-C, shutting down.");
		let _ = send_cancel2.send(true);
	});
	(send_cancel, watch_cancel)
}
