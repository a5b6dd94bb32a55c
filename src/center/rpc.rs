//! RPC protocol of the metadata servers. Clients, agents, and peer centers
//! all speak these messages; putback variants are only ever sent by a
//! primary compensating for its own failed apply.
use serde::{Deserialize, Serialize};

use whisper_index::record::Record;
use whisper_rpc::message::Message;
use whisper_util::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CenterRpc {
	Ok,
	/// Insert-or-replace a record into the index its oid names
	PutRecord(Record),
	/// Fetch the record of an oid
	GetOidMeta(String),
	/// Flip a record's status
	ChangeOidStatus { oid: String, status: u32 },
	/// Compensation: mark the record deleted on a secondary after the
	/// primary failed to apply it
	PutbackPutRecord(Record),
	/// Compensation: restore a record's previous status on a secondary
	/// after the primary failed to apply the change
	PutbackChangeOidStatus { oid: String, prev_status: u32 },
	/// A record, response to GetOidMeta
	Record(Record),
	/// Politely shut the center down
	Close,
}

impl Message for CenterRpc {
	type Response = Result<CenterRpc, Error>;
}

impl CenterRpc {
	/// Whether a master must fan this command out to its secondaries
	/// before applying it
	pub fn needs_slave_sync(&self) -> bool {
		matches!(
			self,
			CenterRpc::PutRecord(_) | CenterRpc::ChangeOidStatus { .. }
		)
	}
}
