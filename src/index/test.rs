use crate::index::*;
use crate::record::Record;

fn record(oid: &str, i: u64) -> Record {
	Record {
		oid: oid.to_string(),
		block_id: 1 + i % 3,
		md5: i.to_be_bytes().to_vec(),
		offset: i * 100,
		len: 100,
		mime: whisper_util::data::MIME_PNG,
		created: i as i64,
		expired: 0,
		status: 0,
	}
}

#[tokio::test]
async fn test_set_get() {
	let dir = mktemp::Temp::new_dir().unwrap();
	let index = Index::init(3, dir.to_path_buf()).await.unwrap();

	index.set(record("3_1_11_22_0", 1)).await.unwrap();
	index.set(record("3_1_11_22_1", 2)).await.unwrap();

	let rec = index.get("3_1_11_22_0").await.unwrap();
	assert_eq!(rec.offset, 100);
	assert_eq!(index.len().await, 2);

	assert!(index.get("3_1_99_99_0").await.is_err());

	// insert-or-replace, not insert-twice
	let mut rec2 = record("3_1_11_22_0", 1);
	rec2.status = whisper_util::data::STATUS_RECORD_DEL;
	index.set(rec2).await.unwrap();
	assert_eq!(index.len().await, 2);
	assert_eq!(
		index.get("3_1_11_22_0").await.unwrap().status,
		whisper_util::data::STATUS_RECORD_DEL
	);
}

#[tokio::test]
async fn test_wal_replay_without_persist() {
	let dir = mktemp::Temp::new_dir().unwrap();

	{
		let index = Index::init(5, dir.to_path_buf()).await.unwrap();
		for i in 0..5u64 {
			index.set(record(&format!("5_1_{}_0_0", i), i)).await.unwrap();
		}
		// no persist: the records only live in the WAL
	}

	let index = Index::init(5, dir.to_path_buf()).await.unwrap();
	index.load().await.unwrap();
	assert_eq!(index.len().await, 5);
	for i in 0..5u64 {
		let rec = index.get(&format!("5_1_{}_0_0", i)).await.unwrap();
		assert_eq!(rec.offset, i * 100);
	}
}

#[tokio::test]
async fn test_persist_then_load() {
	let dir = mktemp::Temp::new_dir().unwrap();

	let index = Index::init(7, dir.to_path_buf()).await.unwrap();
	for i in 0..50u64 {
		index.set(record(&format!("7_1_{}_0_0", i), i)).await.unwrap();
	}
	index.persist().await.unwrap();

	// after persist the WAL is freshly empty, prior entries moved to a bak
	let wal = dir.to_path_buf().join("index_log_7");
	assert_eq!(tokio::fs::read(&wal).await.unwrap().len(), 0);
	let mut bak_found = false;
	let mut entries = tokio::fs::read_dir(dir.to_path_buf()).await.unwrap();
	while let Some(e) = entries.next_entry().await.unwrap() {
		if e.file_name()
			.to_string_lossy()
			.starts_with("index_log_7_bak_")
		{
			bak_found = true;
		}
	}
	assert!(bak_found);

	// records written after the snapshot land in the fresh WAL
	for i in 50..57u64 {
		index.set(record(&format!("7_1_{}_0_0", i), i)).await.unwrap();
	}

	let reloaded = Index::init(7, dir.to_path_buf()).await.unwrap();
	reloaded.load().await.unwrap();
	assert_eq!(reloaded.len().await, 57);
	for i in 0..57u64 {
		let rec = reloaded.get(&format!("7_1_{}_0_0", i)).await.unwrap();
		assert_eq!(rec.created, i as i64);
		assert_eq!(rec.md5, i.to_be_bytes().to_vec());
	}
}

#[tokio::test]
async fn test_snapshot_rotation_boundary() {
	let dir = mktemp::Temp::new_dir().unwrap();
	let index = Index::init(9, dir.to_path_buf()).await.unwrap();

	// exactly one full chunk: one _part0 file and no index_9 file
	let recs: Vec<Record> = (0..PERSIST_EACH_FILE_RECORD_NUM_LIMIT as u64)
		.map(|i| record(&format!("9_1_{}_0_0", i), i))
		.collect();
	index.set_batch_with_log(recs, false).await.unwrap();
	index.persist().await.unwrap();

	assert!(tokio::fs::metadata(dir.to_path_buf().join("index_9_part0"))
		.await
		.is_ok());
	assert!(tokio::fs::metadata(dir.to_path_buf().join("index_9"))
		.await
		.is_err());

	// one more record: the short chunk appears
	index
		.set_with_log(record("9_1_overflow_0_0", 424242), false)
		.await
		.unwrap();
	index.persist().await.unwrap();
	assert!(tokio::fs::metadata(dir.to_path_buf().join("index_9_part0"))
		.await
		.is_ok());
	assert!(tokio::fs::metadata(dir.to_path_buf().join("index_9"))
		.await
		.is_ok());

	let reloaded = Index::init(9, dir.to_path_buf()).await.unwrap();
	reloaded.load().await.unwrap();
	assert_eq!(
		reloaded.len().await,
		PERSIST_EACH_FILE_RECORD_NUM_LIMIT + 1
	);
}

#[tokio::test]
async fn test_filter_and_change_block() {
	let dir = mktemp::Temp::new_dir().unwrap();
	let index = Index::init(11, dir.to_path_buf()).await.unwrap();

	for i in 0..9u64 {
		index.set(record(&format!("11_1_{}_0_0", i), i)).await.unwrap();
	}

	// block ids cycle over 1..=3, offsets must come back ordered
	let on_block_1 = index.records_by_block(1).await.unwrap();
	assert_eq!(on_block_1.len(), 3);
	assert!(on_block_1.windows(2).all(|w| w[0].offset <= w[1].offset));

	index.change_block(1, 4).await.unwrap();
	assert!(index.records_by_block(1).await.unwrap().is_empty());
	assert_eq!(index.records_by_block(4).await.unwrap().len(), 3);
}
