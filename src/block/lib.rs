//! Crate containing the per-node block storage engine of Whisper:
//! append-only writes into fixed-size on-disk blocks, random-offset reads,
//! per-block write exclusion, and the agent RPC server.

#[macro_use]
extern crate tracing;

pub mod block;
pub mod node;
pub mod server;
