//! Crate containing the two network layers of Whisper: the coordination bus
//! (long-lived connections carrying keep-alive, host mapping, watcher
//! registration and trigger dispatch) and the point-to-point RPC transport
//! used between clients, agents and centers.

#[macro_use]
extern crate tracing;

pub mod bus_client;
pub mod bus_server;
pub mod client;
pub mod message;
pub mod pack;
pub mod server;
