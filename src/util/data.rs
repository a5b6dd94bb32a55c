//! Delimiters, well-known constants and body digests shared by every role
use md5::{Digest, Md5};

/// Delimiter between concatenated encoded values in a buffer (WAL entries,
/// snapshot chunks, published block lists, operator tunnel bodies).
/// Assumed never to appear inside an encoded value; see the persistence
/// format notes in DESIGN.md.
pub const SP: &[u8] = &[b',', b'.', b'!'];

/// Delimiter between messages on the coordination bus framing layer
pub const CL: &[u8] = &[b'\r', b'\n'];

pub const SERVER_PORT_MEDIATOR: u16 = 9777;
pub const SERVER_PORT_CENTER: u16 = 9770;
pub const SERVER_PORT_AGENT: u16 = 9771;
pub const SERVER_HTTP_PORT_CLIENT: u16 = 8097;

pub const LOCALHOST: &str = "localhost";

/// Every block init creates a record with this status
pub const STATUS_RECORD_BLOCK_BEGIN: u32 = 1;
pub const STATUS_RECORD_DEL: u32 = 10;
pub const STATUS_RECORD_DISABLE: u32 = 20;

pub const MIME_JPG: u32 = 1;
pub const MIME_PNG: u32 = 2;
pub const MIME_GIF: u32 = 3;
pub const MIME_BMP: u32 = 4;

/// Digest identifying a blob body in record metadata
pub fn gen_md5(body: &[u8]) -> Vec<u8> {
	let mut hasher = Md5::new();
	hasher.update(body);
	hasher.finalize().to_vec()
}

pub fn check_md5(body: &[u8], md5: &[u8]) -> bool {
	gen_md5(body) == md5
}

/// Split `buf` on every occurrence of the multi-byte delimiter `delim`,
/// returning the fragments in order. Like the framing readers, callers are
/// expected to skip empty fragments.
pub fn split_on<'a>(buf: &'a [u8], delim: &[u8]) -> Vec<&'a [u8]> {
	let mut parts = Vec::new();
	let mut start = 0;
	let mut i = 0;
	while i + delim.len() <= buf.len() {
		if &buf[i..i + delim.len()] == delim {
			parts.push(&buf[start..i]);
			i += delim.len();
			start = i;
		} else {
			i += 1;
		}
	}
	parts.push(&buf[start..]);
	parts
}

/// Position of the first occurrence of `delim` in `buf`, if any
pub fn find_delim(buf: &[u8], delim: &[u8]) -> Option<usize> {
	if delim.is_empty() || buf.len() < delim.len() {
		return None;
	}
	(0..=buf.len() - delim.len()).find(|&i| &buf[i..i + delim.len()] == delim)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_split_on() {
		let mut buf = Vec::new();
		buf.extend_from_slice(b"first");
		buf.extend_from_slice(SP);
		buf.extend_from_slice(b"second");
		buf.extend_from_slice(SP);

		let parts = split_on(&buf, SP);
		assert_eq!(parts, vec![&b"first"[..], &b"second"[..], &b""[..]]);
	}

	#[test]
	fn test_split_on_no_delim() {
		assert_eq!(split_on(b"abc", SP), vec![&b"abc"[..]]);
		assert_eq!(split_on(b"", SP), vec![&b""[..]]);
	}

	#[test]
	fn test_find_delim() {
		let mut buf = b"pack".to_vec();
		buf.extend_from_slice(CL);
		buf.extend_from_slice(b"rest");
		assert_eq!(find_delim(&buf, CL), Some(4));
		assert_eq!(find_delim(b"pack", CL), None);
	}

	#[test]
	fn test_md5() {
		let body = b"hello world";
		let sum = gen_md5(body);
		assert_eq!(sum.len(), 16);
		assert!(check_md5(body, &sum));
		assert!(!check_md5(b"hello w0rld", &sum));
	}
}
