//! Module containing helper functions to manipulate time
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns milliseconds since UNIX epoch
pub fn now_msec() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("The clock is set before 1970")
		.as_millis() as u64
}

/// Returns seconds since UNIX epoch
pub fn now_unix_secs() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("The clock is set before 1970")
		.as_secs() as i64
}
