//! The coordinator: owns the cluster block table, persists it, and pushes
//! it to agents and clients through the watcher bus.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs;
use tokio::sync::Mutex;

use whisper_block::block::{encode_block_list, sort_by_filling_rate, Block};
use whisper_rpc::bus_server::BusServer;
use whisper_util::data::{split_on, SP};
use whisper_util::encode::dec;
use whisper_util::error::Error;

pub const MEDIATOR_DATA_FILE: &str = "mediator.data";

/// Role watcher groups and their block-refresh keys. Registration
/// callbacks on these push the current block table to a fresh subscriber,
/// and [`Mediator::publish_blocks`] triggers them all.
pub const BLOCK_REFRESH_WATCHES: &[(&str, &str)] = &[
	("client", "client-block-refresh"),
	("node-server", "node-server-block-refresh"),
];

pub struct Mediator {
	pub dir: PathBuf,
	pub server: Arc<BusServer>,
	// key is the block id
	blocks: Mutex<BTreeMap<u64, Block>>,
}

impl Mediator {
	/// Start the bus server and install the block-refresh registration
	/// callbacks
	pub async fn start(bind_addr: &str, dir: impl Into<PathBuf>) -> Result<Arc<Mediator>, Error> {
		let server = BusServer::start(bind_addr).await?;
		let mediator = Arc::new(Mediator {
			dir: dir.into(),
			server,
			blocks: Mutex::new(BTreeMap::new()),
		});

		for &(group, key) in BLOCK_REFRESH_WATCHES {
			let this = mediator.clone();
			mediator
				.server
				.add_watch_callback(group, key, move || {
					let this = this.clone();
					async move {
						match this.encoded_block_list().await {
							Ok(body) => (body, Vec::new()),
							Err(e) => {
								error!("mediator block list encode error: {}", e);
								(Vec::new(), Vec::new())
							}
						}
					}
				})
				.await;
		}

		Ok(mediator)
	}

	pub async fn close(&self) {
		self.server.close().await;
	}

	fn persist_file(&self) -> PathBuf {
		self.dir.join(MEDIATOR_DATA_FILE)
	}

	/// Load the block table from disk. A missing file is not an error, the
	/// coordinator simply starts empty.
	pub async fn load(&self) -> Result<(), Error> {
		let fn_ = self.persist_file();
		let body = match fs::read(&fn_).await {
			Ok(body) => body,
			Err(e) => {
				info!("mediator load error but skip - {} - {}", fn_.display(), e);
				return Ok(());
			}
		};

		let mut blocks = self.blocks.lock().await;
		for fragment in split_on(&body, SP) {
			if fragment.is_empty() {
				continue;
			}
			let block: Block = dec(fragment)?;
			blocks.insert(block.block_id, block);
		}
		info!("mediator loaded block number {}", blocks.len());
		Ok(())
	}

	/// Write the block table to disk; an empty table removes the file
	pub async fn persist(&self) -> Result<(), Error> {
		let blocks = self.blocks.lock().await;
		let fn_ = self.persist_file();
		if blocks.is_empty() {
			let _ = fs::remove_file(&fn_).await;
			return Ok(());
		}

		let list: Vec<Block> = blocks.values().cloned().collect();
		let body = encode_block_list(&list)?;
		fs::write(&fn_, &body).await?;
		Ok(())
	}

	/// Allocate the next block id and record the new block
	pub async fn new_block(
		&self,
		index_id: u32,
		addr: &str,
		dir: &str,
		size: u64,
	) -> Result<u64, Error> {
		let mut blocks = self.blocks.lock().await;
		let block_id = blocks.keys().next_back().copied().unwrap_or(0) + 1;
		blocks.insert(
			block_id,
			Block {
				block_id,
				index_id,
				addr: addr.to_string(),
				dir: dir.to_string(),
				size,
				end: 0,
			},
		);
		Ok(block_id)
	}

	pub async fn block_count(&self) -> usize {
		self.blocks.lock().await.len()
	}

	/// The block table ordered by filling rate, least full first. This is
	/// the order write strategies consume.
	pub async fn block_list(&self) -> Vec<Block> {
		let blocks = self.blocks.lock().await;
		let mut list: Vec<Block> = blocks.values().cloned().collect();
		sort_by_filling_rate(&mut list);
		list
	}

	pub async fn encoded_block_list(&self) -> Result<Vec<u8>, Error> {
		encode_block_list(&self.block_list().await)
	}

	/// Push the current block table to every block-refresh subscriber
	pub async fn publish_blocks(&self) -> Result<(), Error> {
		let body = self.encoded_block_list().await?;
		for &(group, key) in BLOCK_REFRESH_WATCHES {
			self.server.tri(group, key, &body, &[]).await;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_new_block_ids_increase() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mediator = Mediator::start("127.0.0.1:0", dir.to_path_buf()).await.unwrap();

		let id1 = mediator
			.new_block(1, "localhost:9771", "/data", 64 * 1024 * 1024)
			.await
			.unwrap();
		let id2 = mediator
			.new_block(1, "localhost:9771", "/data", 64 * 1024 * 1024)
			.await
			.unwrap();
		assert_eq!(id1, 1);
		assert_eq!(id2, 2);

		mediator.close().await;
	}

	#[tokio::test]
	async fn test_persist_and_load() {
		let dir = mktemp::Temp::new_dir().unwrap();

		{
			let mediator = Mediator::start("127.0.0.1:0", dir.to_path_buf()).await.unwrap();
			mediator
				.new_block(1, "localhost:9771", "/data", 1024)
				.await
				.unwrap();
			mediator
				.new_block(2, "localhost:9772", "/data", 2048)
				.await
				.unwrap();
			mediator.persist().await.unwrap();
			mediator.close().await;
		}

		let mediator = Mediator::start("127.0.0.1:0", dir.to_path_buf()).await.unwrap();
		mediator.load().await.unwrap();
		assert_eq!(mediator.block_count().await, 2);

		// ids survive the roundtrip, so the next allocation follows on
		let id = mediator
			.new_block(1, "localhost:9771", "/data", 1024)
			.await
			.unwrap();
		assert_eq!(id, 3);

		mediator.close().await;
	}

	#[tokio::test]
	async fn test_load_missing_file_is_not_an_error() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mediator = Mediator::start("127.0.0.1:0", dir.to_path_buf()).await.unwrap();
		mediator.load().await.unwrap();
		assert_eq!(mediator.block_count().await, 0);
		mediator.close().await;
	}
}
