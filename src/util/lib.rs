//! Crate containing common functions and types used in Whisper

#[macro_use]
extern crate tracing;

pub mod background;
pub mod buffer_writer;
pub mod compress;
pub mod config;
pub mod data;
pub mod encode;
pub mod error;
pub mod time;
