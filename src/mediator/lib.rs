//! Crate containing the Whisper coordinator: the persistent cluster block
//! table and its publication over the watcher bus.

#[macro_use]
extern crate tracing;

pub mod mediator;
