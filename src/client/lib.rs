//! Crate containing the Whisper client: N-way parallel upload with
//! disable-on-partial-failure, sequential multi-copy read fallback, and
//! the bus watchers that keep its view of the cluster fresh.

#[macro_use]
extern crate tracing;

pub mod client;
pub mod conn;
