//! Buffered appender for low-volume audit logs
use std::path::PathBuf;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::Error;

pub const DEFAULT_BUFFER_LINES: usize = 30;

/// Accumulates lines in memory and appends them to a file once every
/// `buffer_lines` lines. Lost lines on crash are acceptable for the logs
/// this is used for (keep-alive audit, compensation audit).
pub struct BufferWriter {
	path: PathBuf,
	buffer_lines: usize,
	inner: Mutex<Buffer>,
}

#[derive(Default)]
struct Buffer {
	bytes: Vec<u8>,
	count: usize,
}

impl BufferWriter {
	pub fn new<P: Into<PathBuf>>(path: P, buffer_lines: usize) -> Self {
		Self {
			path: path.into(),
			buffer_lines,
			inner: Mutex::new(Buffer::default()),
		}
	}

	pub async fn write_line(&self, line: &str) -> Result<(), Error> {
		let mut inner = self.inner.lock().await;
		inner.bytes.extend_from_slice(line.as_bytes());
		inner.bytes.push(b'\n');
		inner.count += 1;
		if inner.count >= self.buffer_lines {
			self.flush_locked(&mut inner).await?;
		}
		Ok(())
	}

	pub async fn flush(&self) -> Result<(), Error> {
		let mut inner = self.inner.lock().await;
		self.flush_locked(&mut inner).await
	}

	async fn flush_locked(&self, inner: &mut Buffer) -> Result<(), Error> {
		if inner.bytes.is_empty() {
			return Ok(());
		}
		let mut file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.path)
			.await?;
		file.write_all(&inner.bytes).await?;
		inner.bytes.clear();
		inner.count = 0;
		Ok(())
	}
}
