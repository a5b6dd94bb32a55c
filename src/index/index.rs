//! Durable ordered index of records: three in-memory trees, a write-ahead
//! log, and compressed multi-part snapshots.
//!
//! The WAL write is the crash boundary: entries are appended before any
//! tree mutation. `persist` walks the main tree in key order, writes
//! compressed snapshot chunks, then rotates the WAL; a failed snapshot
//! write leaves the WAL in place so recovery still sees every record.
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use whisper_util::compress::{compress, decompress};
use whisper_util::data::{split_on, SP};
use whisper_util::error::{Error, OkOrMessage};
use whisper_util::time::{now_msec, now_unix_secs};

use crate::record::Record;

/// Max number of records in one index
pub const MAX_TREE_LEN: usize = 1_000_000;
/// Snapshot chunk size: a full chunk goes to `index_<id>_part<K>`, the
/// last partial chunk to `index_<id>`
pub const PERSIST_EACH_FILE_RECORD_NUM_LIMIT: usize = 100_000;
pub const INDEX_FILE_PRE: &str = "index_";
pub const INDEX_LOG_FILE_PRE: &str = "index_log_";

/// Oid ordering of the main tree: length first, then bytes. This ordering
/// is part of the on-disk contract, reloaded snapshots are re-inserted
/// under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidKey(pub String);

impl Ord for OidKey {
	fn cmp(&self, other: &Self) -> Ordering {
		self.0
			.len()
			.cmp(&other.0.len())
			.then_with(|| self.0.as_bytes().cmp(other.0.as_bytes()))
	}
}

impl PartialOrd for OidKey {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

#[derive(Default)]
struct Trees {
	// key is oid, value is the record
	index: BTreeMap<OidKey, Record>,
	// key is md5, value is oid
	by_md5: BTreeMap<Vec<u8>, String>,
	// key is created time, value is oid
	by_created: BTreeMap<i64, String>,
}

impl Trees {
	fn insert(&mut self, rec: &Record) {
		self.index
			.insert(OidKey(rec.oid.clone()), rec.clone());
		self.by_md5.insert(rec.md5.clone(), rec.oid.clone());
		self.by_created.insert(rec.created, rec.oid.clone());
	}
}

#[derive(Default)]
struct IndexState {
	// None until the first write or load
	trees: Option<Trees>,
	last_modified_msec: u64,
}

/// One ordered record index, owning one directory on disk
pub struct Index {
	pub id: u32,
	pub dir: PathBuf,
	state: Mutex<IndexState>,
}

impl Index {
	/// Set identity, create an empty WAL file if absent
	pub async fn init(id: u32, dir: impl Into<PathBuf>) -> Result<Index, Error> {
		let dir = dir.into();
		fs::create_dir_all(&dir).await?;
		let index = Index {
			id,
			dir,
			state: Mutex::new(IndexState::default()),
		};
		index.generate_log_file().await?;
		Ok(index)
	}

	fn persist_file(&self) -> PathBuf {
		self.dir.join(format!("{}{}", INDEX_FILE_PRE, self.id))
	}

	fn log_file(&self) -> PathBuf {
		self.dir.join(format!("{}{}", INDEX_LOG_FILE_PRE, self.id))
	}

	async fn generate_log_file(&self) -> Result<(), Error> {
		let fn_ = self.log_file();
		let last_modified = match fs::metadata(&fn_).await {
			Ok(meta) => meta
				.modified()
				.ok()
				.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
				.map(|d| d.as_millis() as u64)
				.unwrap_or_else(now_msec),
			Err(_) => {
				fs::File::create(&fn_).await?;
				now_msec()
			}
		};
		self.state.lock().await.last_modified_msec = last_modified;
		Ok(())
	}

	/// Reconstruct the three trees from the snapshot chunks plus the WAL,
	/// then swap them in
	pub async fn load(&self) -> Result<(), Error> {
		if self.id == 0 {
			return Err(Error::Message("index load error as no id given".into()));
		}

		let mut trees = Trees::default();

		let base = format!("{}{}", INDEX_FILE_PRE, self.id);
		let mut files: Vec<PathBuf> = Vec::new();
		let mut entries = fs::read_dir(&self.dir).await?;
		while let Some(entry) = entries.next_entry().await? {
			let name = entry.file_name().to_string_lossy().into_owned();
			if name == base || is_part_file(&name, &base) {
				files.push(entry.path());
			}
		}
		files.sort();
		info!("index {} load from files {:?}", self.id, files);

		for file in files.iter() {
			let raw = fs::read(file).await?;
			let body = decompress(&raw)?;
			append_records_from(&body, &mut trees)?;
		}

		// read from the log
		let log = self.log_file();
		if fs::metadata(&log).await.is_ok() {
			let body = fs::read(&log).await?;
			append_records_from(&body, &mut trees)?;
		}

		let mut state = self.state.lock().await;
		state.trees = Some(trees);
		Ok(())
	}

	pub async fn set(&self, rec: Record) -> Result<(), Error> {
		self.set_batch(vec![rec]).await
	}

	pub async fn set_with_log(&self, rec: Record, write_log: bool) -> Result<(), Error> {
		self.set_batch_with_log(vec![rec], write_log).await
	}

	pub async fn set_batch(&self, recs: Vec<Record>) -> Result<(), Error> {
		self.set_batch_with_log(recs, true).await
	}

	pub async fn set_batch_with_log(
		&self,
		recs: Vec<Record>,
		write_log: bool,
	) -> Result<(), Error> {
		let mut state = self.state.lock().await;
		state.last_modified_msec = now_msec();
		let trees = state.trees.get_or_insert_with(Trees::default);

		if trees.index.len() >= MAX_TREE_LEN {
			return Err(Error::Message("index error as exceed max length".into()));
		}

		// the WAL append is the crash boundary: all entries of the batch go
		// to disk before any tree mutation
		if write_log {
			let log = self.log_file();
			if fs::metadata(&log).await.is_err() {
				return Err(Error::Message(format!(
					"index log file not exists for index {}",
					self.id
				)));
			}
			let mut buf = Vec::new();
			for rec in recs.iter() {
				buf.extend_from_slice(&rec.encode()?);
				buf.extend_from_slice(SP);
			}
			let mut file = fs::OpenOptions::new().append(true).open(&log).await?;
			file.write_all(&buf).await?;
		}

		for rec in recs.iter() {
			trees.insert(rec);
		}
		Ok(())
	}

	pub async fn get(&self, oid: &str) -> Result<Record, Error> {
		let state = self.state.lock().await;
		let trees = state
			.trees
			.as_ref()
			.ok_or_message(format!("index get but not found {}", oid))?;
		trees
			.index
			.get(&OidKey(oid.to_string()))
			.cloned()
			.ok_or_message(format!("index get but not found {}", oid))
	}

	/// Number of records in the main tree
	pub async fn len(&self) -> usize {
		match self.state.lock().await.trees.as_ref() {
			Some(t) => t.index.len(),
			None => 0,
		}
	}

	pub async fn last_modified_msec(&self) -> u64 {
		self.state.lock().await.last_modified_msec
	}

	/// Write a new snapshot (possibly multi-part), then rotate the WAL
	pub async fn persist(&self) -> Result<(), Error> {
		let mut state = self.state.lock().await;
		let trees = state
			.trees
			.as_ref()
			.ok_or_message("index persist error as index tree not exist")?;

		let mut buf: Vec<u8> = Vec::new();
		let mut file_index = 0;
		let mut written = 0usize;
		for (key, rec) in trees.index.iter() {
			let mut rec = rec.clone();
			rec.oid = key.0.clone();
			buf.extend_from_slice(&rec.encode()?);
			buf.extend_from_slice(SP);
			written += 1;

			if written % PERSIST_EACH_FILE_RECORD_NUM_LIMIT == 0 {
				info!(
					"index {} begin persist part {} at {} records",
					self.id, file_index, written
				);
				self.persist_chunk(&buf, &format!("_part{}", file_index))
					.await?;
				buf.clear();
				file_index += 1;
			}
		}
		if !buf.is_empty() {
			info!("index {} begin persist last chunk", self.id);
			self.persist_chunk(&buf, "").await?;
		}

		// move the log file away as a backup
		let log = self.log_file();
		if fs::metadata(&log).await.is_ok() {
			let bak = self
				.dir
				.join(format!(
					"{}{}_bak_{}",
					INDEX_LOG_FILE_PRE,
					self.id,
					now_unix_secs()
				));
			fs::rename(&log, &bak).await?;
		}
		fs::File::create(&log).await?;
		state.last_modified_msec = now_msec();
		Ok(())
	}

	async fn persist_chunk(&self, buf: &[u8], suffix: &str) -> Result<(), Error> {
		let fn_ = PathBuf::from(format!("{}{}", self.persist_file().display(), suffix));
		let compressed = compress(buf)?;
		fs::write(&fn_, &compressed).await?;
		Ok(())
	}

	/// Records matching the predicate, ordered by (block id, offset)
	pub async fn filter<F>(&self, predicate: F) -> Result<Vec<Record>, Error>
	where
		F: Fn(&Record) -> bool,
	{
		let state = self.state.lock().await;
		let trees = state
			.trees
			.as_ref()
			.ok_or_message("index filter error as index tree not exist")?;

		let mut list = Vec::new();
		for (key, rec) in trees.index.iter() {
			if predicate(rec) {
				let mut rec = rec.clone();
				rec.oid = key.0.clone();
				list.push(rec);
			}
		}
		crate::record::sort_by_position(&mut list);
		Ok(list)
	}

	pub async fn records_by_block(&self, block_id: u64) -> Result<Vec<Record>, Error> {
		self.filter(|rec| rec.block_id == block_id).await
	}

	/// Relocate every record of a block onto another block
	pub async fn change_block(&self, block_id: u64, new_block_id: u64) -> Result<(), Error> {
		if block_id == new_block_id {
			return Ok(());
		}
		let mut list = self.records_by_block(block_id).await?;
		for rec in list.iter_mut() {
			rec.block_id = new_block_id;
		}
		self.set_batch(list).await
	}
}

fn is_part_file(name: &str, base: &str) -> bool {
	match name.strip_prefix(base).and_then(|r| r.strip_prefix("_part")) {
		Some(digits) => !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()),
		None => false,
	}
}

fn append_records_from(body: &[u8], trees: &mut Trees) -> Result<(), Error> {
	let fragments = split_on(body, SP);
	debug!("index load split number {}", fragments.len());
	for fragment in fragments {
		// an empty fragment means it was the last one
		if fragment.is_empty() {
			continue;
		}
		let rec = Record::decode(fragment)?;
		trees.insert(&rec);
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_oid_key_ordering() {
		// length first, then bytes
		let mut keys = vec![
			OidKey("10_1_2_3_0".into()),
			OidKey("2_1_2_3_0".into()),
			OidKey("1_1_2_3_0".into()),
		];
		keys.sort();
		assert_eq!(
			keys.iter().map(|k| k.0.as_str()).collect::<Vec<_>>(),
			vec!["1_1_2_3_0", "2_1_2_3_0", "10_1_2_3_0"]
		);
	}

	#[test]
	fn test_is_part_file() {
		assert!(is_part_file("index_2_part0", "index_2"));
		assert!(is_part_file("index_2_part17", "index_2"));
		assert!(!is_part_file("index_2", "index_2"));
		assert!(!is_part_file("index_2_part", "index_2"));
		assert!(!is_part_file("index_2_partx", "index_2"));
		assert!(!is_part_file("index_log_2", "index_2"));
		assert!(!is_part_file("index_2_bak_123", "index_2"));
	}

	#[tokio::test]
	async fn test_three_trees_stay_consistent() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let index = Index::init(1, dir.to_path_buf()).await.unwrap();

		for i in 0..20u64 {
			let rec = Record {
				oid: format!("1_1_{}_{}_0", i, i),
				block_id: 1,
				md5: i.to_be_bytes().to_vec(),
				offset: i * 10,
				len: 10,
				created: i as i64,
				..Default::default()
			};
			index.set(rec).await.unwrap();
		}

		let state = index.state.lock().await;
		let trees = state.trees.as_ref().unwrap();
		assert_eq!(trees.index.len(), 20);
		for (key, rec) in trees.index.iter() {
			assert_eq!(trees.by_md5.get(&rec.md5), Some(&key.0));
			assert_eq!(trees.by_created.get(&rec.created), Some(&key.0));
		}
	}
}
