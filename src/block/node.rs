//! Per-node append-only storage over a fixed set of blocks
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, OwnedMutexGuard};

use whisper_index::record::Record;
use whisper_util::data::gen_md5;
use whisper_util::error::{Error, OkOrMessage};
use whisper_util::time::now_msec;

use crate::block::Block;

/// If acquiring a block fails, pause and loop this many times before
/// giving up
pub const GET_BLOCK_MAX_LOOP_TIMES: u32 = 10;
pub const GET_BLOCK_LOCK_PAUSE: Duration = Duration::from_millis(1);

/// A block as held by a storage node: the shared metadata plus the local
/// write position and exclusion state.
///
/// `is_writing` is a cheap advisory flag read without the lock and used
/// only for selection; the real barrier is the mutex held for the
/// duration of the write.
pub struct BlockInServer {
	pub block: Block,
	end: AtomicU64,
	is_writing: AtomicBool,
	lock: Arc<Mutex<()>>,
}

impl BlockInServer {
	pub fn new(block: Block) -> Arc<BlockInServer> {
		let end = block.end;
		Arc::new(BlockInServer {
			block,
			end: AtomicU64::new(end),
			is_writing: AtomicBool::new(false),
			lock: Arc::new(Mutex::new(())),
		})
	}

	pub fn end(&self) -> u64 {
		self.end.load(Ordering::Acquire)
	}

	fn left(&self) -> u64 {
		self.block.size.saturating_sub(self.end())
	}
}

/// Held while a whole block is read out for replication repair; restores
/// the advisory flag on drop
pub struct BlockGuard {
	block: Arc<BlockInServer>,
	_guard: OwnedMutexGuard<()>,
}

impl Drop for BlockGuard {
	fn drop(&mut self) {
		self.block.is_writing.store(false, Ordering::Release);
	}
}

/// Store and read blob bodies on the local disks. The block list is
/// replaced wholesale by the refresh watcher; writers iterate the list
/// reference they loaded.
pub struct Node {
	blocks: ArcSwap<Vec<Arc<BlockInServer>>>,
}

impl Default for Node {
	fn default() -> Self {
		Node::new()
	}
}

impl Node {
	pub fn new() -> Node {
		Node {
			blocks: ArcSwap::from_pointee(Vec::new()),
		}
	}

	/// Replace the whole block list (set by the refresh watcher). The
	/// coordinator's view of the write positions can lag; a block we
	/// already hold keeps its local end so that it never regresses.
	pub fn refresh_blocks(&self, blocks: Vec<Arc<BlockInServer>>) {
		let current = self.blocks.load_full();
		for block in blocks.iter() {
			if let Some(prev) = current
				.iter()
				.find(|p| p.block.block_id == block.block.block_id)
			{
				let prev_end = prev.end();
				if prev_end > block.end() {
					block.end.store(prev_end, Ordering::Release);
				}
			}
		}
		self.blocks.store(Arc::new(blocks));
	}

	pub fn block_count(&self) -> usize {
		self.blocks.load().len()
	}

	fn get_block(&self, block_id: u64) -> Result<Arc<BlockInServer>, Error> {
		self.blocks
			.load()
			.iter()
			.find(|b| b.block.block_id == block_id)
			.cloned()
			.ok_or_message("node error as block not found")
	}

	/// First block with enough free space whose advisory flag is clear.
	/// If every viable block is being written, pause and rescan, up to
	/// [`GET_BLOCK_MAX_LOOP_TIMES`] times.
	async fn get_fit_block(&self, len: u64) -> Option<Arc<BlockInServer>> {
		for attempt in 0..=GET_BLOCK_MAX_LOOP_TIMES {
			let blocks = self.blocks.load_full();
			let mut viable_but_busy = false;
			for block in blocks.iter() {
				if block.left() < len {
					continue;
				}
				if !block.is_writing.load(Ordering::Relaxed) {
					return Some(block.clone());
				}
				viable_but_busy = true;
			}
			if !viable_but_busy {
				return None;
			}
			if attempt < GET_BLOCK_MAX_LOOP_TIMES {
				info!("node find block loop again {}", attempt + 1);
				tokio::time::sleep(GET_BLOCK_LOCK_PAUSE).await;
			}
		}
		None
	}

	/// Append a body into a fit block and return the fresh record for it.
	/// The returned offset is the block's end before the write; the oid and
	/// mime fields are left for the caller to fill in.
	pub async fn save_local(&self, oid: &str, body: &[u8]) -> Result<Record, Error> {
		let len = body.len() as u64;
		let block = self
			.get_fit_block(len)
			.await
			.ok_or_message("node save error as no block space left")?;

		block.is_writing.store(true, Ordering::Release);
		let guard = block.lock.clone().lock_owned().await;
		let res = write_to_block(&block, body).await;
		drop(guard);
		block.is_writing.store(false, Ordering::Release);

		match &res {
			Ok(rec) => debug!(
				"node saved {} to block {} at offset {} md5 {}",
				oid,
				rec.block_id,
				rec.offset,
				hex::encode(&rec.md5)
			),
			Err(e) => error!("node save {} error: {}", oid, e),
		}
		res
	}

	/// Random-offset read of one record's body
	pub async fn get(&self, rec: &Record) -> Result<Vec<u8>, Error> {
		let block = self.get_block(rec.block_id)?;
		let path = block.block.file_path();
		if fs::metadata(&path).await.is_err() {
			return Err(Error::Message(
				"node get error as block file not found".into(),
			));
		}

		let mut file = fs::File::open(&path).await?;
		file.seek(SeekFrom::Start(rec.offset)).await?;
		let mut body = vec![0u8; rec.len as usize];
		file.read_exact(&mut body).await?;
		Ok(body)
	}

	/// Take the block's write exclusion for a bulk whole-block read.
	/// Dropping the guard releases it.
	pub async fn lock_block(&self, block_id: u64) -> Result<BlockGuard, Error> {
		let block = self.get_block(block_id)?;
		block.is_writing.store(true, Ordering::Release);
		let guard = block.lock.clone().lock_owned().await;
		Ok(BlockGuard {
			block,
			_guard: guard,
		})
	}

	/// Read the entire on-disk file of a block
	pub async fn read_full(&self, block_id: u64) -> Result<Vec<u8>, Error> {
		let block = self.get_block(block_id)?;
		let path = block.block.file_path();
		if fs::metadata(&path).await.is_err() {
			return Err(Error::Message(
				"node read full error as block file not found".into(),
			));
		}
		Ok(fs::read(&path).await?)
	}
}

async fn write_to_block(block: &Arc<BlockInServer>, body: &[u8]) -> Result<Record, Error> {
	let path = block.block.file_path();
	let offset = block.end();

	let mut file = OpenOptions::new()
		.write(true)
		.create(true)
		.open(&path)
		.await?;
	file.seek(SeekFrom::Start(offset)).await?;
	file.write_all(body).await?;
	file.sync_all().await?;

	// the end position only advances once the bytes are on disk
	block.end.store(offset + body.len() as u64, Ordering::Release);

	Ok(Record {
		block_id: block.block.block_id,
		md5: gen_md5(body),
		offset,
		len: body.len() as u64,
		created: now_msec() as i64,
		..Default::default()
	})
}
