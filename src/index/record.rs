//! Metadata for one stored blob copy
use serde::{Deserialize, Serialize};

use whisper_util::data::STATUS_RECORD_BLOCK_BEGIN;
use whisper_util::encode::{dec, enc};
use whisper_util::error::Error;

use crate::oid::gen_oid;

/// One stored copy: which block, which offset, which length, which digest.
/// Records are only ever mutated through status transitions, they are never
/// removed from the index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
	pub oid: String,
	pub block_id: u64,
	#[serde(with = "serde_bytes")]
	pub md5: Vec<u8>,
	pub offset: u64,
	pub len: u64,
	pub mime: u32,
	pub created: i64,
	pub expired: i64,
	pub status: u32,
}

impl Record {
	/// Marker record written when a block is introduced
	pub fn new_block_begin(index_id: u32, block_id: u64) -> Record {
		Record {
			oid: gen_oid(index_id, 0),
			block_id,
			offset: 0,
			len: 10,
			status: STATUS_RECORD_BLOCK_BEGIN,
			..Default::default()
		}
	}

	pub fn encode(&self) -> Result<Vec<u8>, Error> {
		enc(self)
	}

	pub fn decode(b: &[u8]) -> Result<Record, Error> {
		dec(b)
	}
}

/// Order a record list by position: block id first, then offset
pub fn sort_by_position(records: &mut [Record]) {
	records.sort_by(|a, b| {
		a.block_id
			.cmp(&b.block_id)
			.then_with(|| a.offset.cmp(&b.offset))
	});
}

pub fn filter_by_status(records: &[Record], status: u32) -> Vec<Record> {
	records
		.iter()
		.filter(|r| r.status == status)
		.cloned()
		.collect()
}
