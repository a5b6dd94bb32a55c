//! Block metadata shared across the cluster
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use whisper_util::data::{split_on, SP};
use whisper_util::encode::{dec, enc};
use whisper_util::error::Error;

pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024 * 1024;
pub const BLOCK_FILE_NAME_PRE: &str = "block_";

/// The unit of on-disk allocation on a storage node. Created by the
/// coordinator, broadcast to agents and clients through the block-refresh
/// watcher keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
	/// Globally unique across the cluster
	pub block_id: u64,
	/// All of this block's records live in one center index
	pub index_id: u32,
	/// Host disk directory
	pub dir: String,
	/// Host net address
	pub addr: String,
	/// Capacity in bytes
	pub size: u64,
	/// High-water mark, bytes written
	pub end: u64,
}

impl Block {
	/// The backing file path is a deterministic function of (dir, blockId)
	pub fn file_path(&self) -> PathBuf {
		PathBuf::from(&self.dir).join(format!("{}{}", BLOCK_FILE_NAME_PRE, self.block_id))
	}
}

/// Order blocks by filling rate (end over size), least full first. This is
/// the order the coordinator publishes, and the order write strategies
/// consume.
pub fn sort_by_filling_rate(blocks: &mut [Block]) {
	blocks.sort_by(|a, b| {
		(a.end as u128 * b.size as u128).cmp(&(b.end as u128 * a.size as u128))
	});
}

/// Encode a block list the way it travels in trigger values: each block
/// encoded, separated by SP
pub fn encode_block_list(blocks: &[Block]) -> Result<Vec<u8>, Error> {
	let mut buf = Vec::new();
	for block in blocks {
		buf.extend_from_slice(&enc(block)?);
		buf.extend_from_slice(SP);
	}
	Ok(buf)
}

pub fn decode_block_list(body: &[u8]) -> Result<Vec<Block>, Error> {
	let mut blocks = Vec::new();
	for fragment in split_on(body, SP) {
		if fragment.is_empty() {
			continue;
		}
		blocks.push(dec::<Block>(fragment)?);
	}
	Ok(blocks)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_block_file_path() {
		let block = Block {
			block_id: 12,
			dir: "/data/disk1".into(),
			..Default::default()
		};
		assert_eq!(block.file_path(), PathBuf::from("/data/disk1/block_12"));
	}

	#[test]
	fn test_sort_by_filling_rate() {
		let mut blocks = vec![
			Block {
				block_id: 1,
				size: 100,
				end: 50,
				..Default::default()
			},
			Block {
				block_id: 2,
				size: 200,
				end: 20,
				..Default::default()
			},
			Block {
				block_id: 3,
				size: 100,
				end: 90,
				..Default::default()
			},
		];
		sort_by_filling_rate(&mut blocks);
		assert_eq!(
			blocks.iter().map(|b| b.block_id).collect::<Vec<_>>(),
			vec![2, 1, 3]
		);
	}

	#[test]
	fn test_block_list_roundtrip() {
		let blocks = vec![
			Block {
				block_id: 1,
				index_id: 1,
				dir: "/data".into(),
				addr: "localhost:9771".into(),
				size: DEFAULT_BLOCK_SIZE,
				end: 0,
			},
			Block {
				block_id: 2,
				index_id: 1,
				dir: "/data".into(),
				addr: "localhost:9772".into(),
				size: DEFAULT_BLOCK_SIZE,
				end: 4096,
			},
		];
		let body = encode_block_list(&blocks).unwrap();
		assert_eq!(decode_block_list(&body).unwrap(), blocks);
	}
}
