//! The set of record indexes hosted by one metadata server
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::fs;
use tokio::sync::Mutex;

use whisper_index::index::Index;
use whisper_index::record::Record;
use whisper_util::error::Error;

pub const INDEX_DIR_PRE: &str = "data_";

/// Provides index read/write service over every `data_<id>` directory
/// under the base directory
pub struct Center {
	indexes: Mutex<Vec<Arc<Index>>>,
}

impl Default for Center {
	fn default() -> Self {
		Center::new()
	}
}

impl Center {
	pub fn new() -> Center {
		Center {
			indexes: Mutex::new(Vec::new()),
		}
	}

	/// Walk the base directory, init and load an index for every
	/// `data_<id>` child
	pub async fn load(dir: &Path) -> Result<Center, Error> {
		info!("center load index data from {}", dir.display());
		let center = Center::new();

		let mut entries = fs::read_dir(dir).await?;
		while let Some(entry) = entries.next_entry().await? {
			if !entry.file_type().await?.is_dir() {
				continue;
			}
			let name = entry.file_name().to_string_lossy().into_owned();
			let id = match parse_index_dir(&name) {
				Some(id) => id,
				None => continue,
			};

			let index = Index::init(id, entry.path()).await?;
			index.load().await?;
			center.indexes.lock().await.push(Arc::new(index));
		}

		center.dump().await;
		Ok(center)
	}

	pub async fn dump(&self) {
		let indexes = self.indexes.lock().await;
		info!("center data list length {}", indexes.len());
		for index in indexes.iter() {
			info!("index info {} {}", index.id, index.len().await);
		}
	}

	async fn index_by_id(&self, index_id: u32) -> Result<Arc<Index>, Error> {
		self.indexes
			.lock()
			.await
			.iter()
			.find(|d| d.id == index_id)
			.cloned()
			.ok_or_else(|| {
				Error::Message(format!("center target index id not found {}", index_id))
			})
	}

	pub async fn set(&self, index_id: u32, rec: Record) -> Result<(), Error> {
		self.index_by_id(index_id).await?.set(rec).await
	}

	pub async fn get(&self, index_id: u32, oid: &str) -> Result<Record, Error> {
		self.index_by_id(index_id).await?.get(oid).await
	}

	/// Create a new index under `dir` with the next free id
	pub async fn new_index(&self, dir: &str) -> Result<u32, Error> {
		let mut indexes = self.indexes.lock().await;
		let id = indexes.iter().map(|d| d.id).max().unwrap_or(0) + 1;
		let index = Index::init(id, dir).await?;
		indexes.push(Arc::new(index));
		Ok(id)
	}

	/// Snapshot every index
	pub async fn persist(&self) -> Result<(), Error> {
		let indexes = self.indexes.lock().await.clone();
		for index in indexes {
			index.persist().await?;
		}
		Ok(())
	}

	/// Per-index record counts
	pub async fn record_counts(&self) -> HashMap<u32, usize> {
		let indexes = self.indexes.lock().await.clone();
		let mut counts = HashMap::new();
		for index in indexes {
			counts.insert(index.id, index.len().await);
		}
		counts
	}

	/// Records of one block, across every index
	pub async fn records_by_block(&self, block_id: u64) -> Result<Vec<Record>, Error> {
		let indexes = self.indexes.lock().await.clone();
		let mut all = Vec::new();
		for index in indexes {
			all.extend(index.records_by_block(block_id).await?);
		}
		Ok(all)
	}
}

fn parse_index_dir(name: &str) -> Option<u32> {
	let digits = name.strip_prefix(INDEX_DIR_PRE)?;
	if digits.is_empty() {
		return None;
	}
	digits.parse().ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_index_dir() {
		assert_eq!(parse_index_dir("data_3"), Some(3));
		assert_eq!(parse_index_dir("data_42"), Some(42));
		assert_eq!(parse_index_dir("data_"), None);
		assert_eq!(parse_index_dir("data_x"), None);
		assert_eq!(parse_index_dir("block_1"), None);
	}
}
