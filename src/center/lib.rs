//! Crate containing the Whisper metadata server: the set of record indexes
//! it hosts, the RPC protocol over them, and the master/slave replication
//! state machine with its compensating putback.

#[macro_use]
extern crate tracing;

pub mod center;
pub mod mediate;
pub mod rpc;
pub mod server;
