//! Crate containing the metadata model of Whisper: records, the object id
//! grammar, and the durable ordered index (three trees + write-ahead log +
//! multi-part snapshots).

#[macro_use]
extern crate tracing;

pub mod index;
pub mod oid;
pub mod record;

#[cfg(test)]
pub mod test;
