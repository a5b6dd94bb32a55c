//! Deflate helpers for index snapshot chunks
use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::Error;

pub fn compress(b: &[u8]) -> Result<Vec<u8>, Error> {
	let mut enc = DeflateEncoder::new(Vec::with_capacity(b.len() / 2), Compression::best());
	enc.write_all(b)?;
	Ok(enc.finish()?)
}

pub fn decompress(b: &[u8]) -> Result<Vec<u8>, Error> {
	let mut out = Vec::new();
	DeflateDecoder::new(b).read_to_end(&mut out)?;
	Ok(out)
}
