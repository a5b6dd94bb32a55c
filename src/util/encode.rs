//! Functions related to serialization/deserialization of Whisper wire and
//! disk formats. A single stable binary encoder is used for both RPC
//! payloads and file persistence.
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Encode a value with the shared binary encoder.
///
/// The encoding is done in a way that is idempotent: encoding the same value
/// twice gives the same result, and is self-describing enough to survive
/// field reordering on decode.
pub fn enc<T: Serialize + ?Sized>(val: &T) -> Result<Vec<u8>, Error> {
	let mut wr = Vec::with_capacity(128);
	let mut se = rmp_serde::Serializer::new(&mut wr)
		.with_struct_map()
		.with_string_variants();
	val.serialize(&mut se)?;
	Ok(wr)
}

/// Decode a value encoded by [`enc`]
pub fn dec<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T, Error> {
	Ok(rmp_serde::decode::from_read_ref::<_, T>(bytes)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Debug, PartialEq, Serialize, Deserialize)]
	struct Payload {
		name: String,
		#[serde(with = "serde_bytes")]
		body: Vec<u8>,
		count: u64,
	}

	#[test]
	fn test_encode_roundtrip() {
		let v = Payload {
			name: "one".into(),
			body: vec![0, 1, 2, 0xff],
			count: 42,
		};
		let b = enc(&v).unwrap();
		let v2: Payload = dec(&b).unwrap();
		assert_eq!(v, v2);
	}

	#[test]
	fn test_encode_stable() {
		let v = Payload {
			name: "one".into(),
			body: vec![7; 32],
			count: 1,
		};
		assert_eq!(enc(&v).unwrap(), enc(&v).unwrap());
	}
}
