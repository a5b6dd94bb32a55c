//! Runner for long-lived background workers

pub mod worker;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

pub use worker::{Worker, WorkerStatus};
use worker::WorkerProcessor;

/// Runner for long-lived background workers (putback drain, keep-alive
/// probing, audit logging). Workers are driven until the stop signal flips,
/// then drained.
pub struct BackgroundRunner {
	send_worker: mpsc::UnboundedSender<Box<dyn Worker>>,
}

impl BackgroundRunner {
	/// Create a new BackgroundRunner
	pub fn new(stop_signal: watch::Receiver<bool>) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
		let (send_worker, worker_out) = mpsc::unbounded_channel::<Box<dyn Worker>>();

		let await_all_done =
			tokio::spawn(async move { WorkerProcessor::new(worker_out, stop_signal).run().await });

		(Arc::new(Self { send_worker }), await_all_done)
	}

	pub fn spawn_worker<W>(&self, worker: W)
	where
		W: Worker + 'static,
	{
		self.send_worker
			.send(Box::new(worker))
			.ok()
			.expect("Could not put worker in queue");
	}
}

/// Await until the watched boolean becomes true
pub async fn wait_from(mut chan: watch::Receiver<bool>) {
	while !*chan.borrow() {
		if chan.changed().await.is_err() {
			return;
		}
	}
}
