//! Async CRLF line reader with a bounded, grow-once buffer.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Initial buffer size; covers the overwhelming majority of IRC lines.
const INITIAL_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum LineReadError {
    /// The stream ended cleanly, before any bytes of a new line arrived.
    #[error("end of stream")]
    Eof,
    /// A line exceeded the read queue cap without a terminator.
    #[error("line exceeded the read queue limit")]
    ReadQExceeded,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reads `\r\n`-delimited lines from a byte stream.
///
/// The internal buffer starts at 1024 bytes and grows exactly once, directly
/// to `cap`, the first time a line outruns it. A line that does not fit in
/// `cap` bytes fails with [`LineReadError::ReadQExceeded`]. Returned lines
/// have the terminator (and any preceding `\r`) stripped.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    /// Start of unconsumed data.
    start: usize,
    /// End of valid data.
    end: usize,
    /// Index up to which we have already searched for a newline.
    scanned: usize,
    cap: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R, cap: usize) -> Self {
        Self {
            inner,
            buf: vec![0; INITIAL_BUFFER_SIZE.min(cap)],
            start: 0,
            end: 0,
            scanned: 0,
            cap,
        }
    }

    /// Read the next line, waiting for more input as needed.
    pub async fn read_line(&mut self) -> Result<Vec<u8>, LineReadError> {
        loop {
            if let Some(pos) = self.buf[self.scanned..self.end].iter().position(|&b| b == b'\n') {
                let newline = self.scanned + pos;
                let mut line = self.buf[self.start..newline].to_vec();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.start = newline + 1;
                self.scanned = self.start;
                return Ok(line);
            }
            self.scanned = self.end;

            if self.end == self.buf.len() {
                if self.start > 0 {
                    // Reclaim consumed space before considering a regrow.
                    self.buf.copy_within(self.start..self.end, 0);
                    self.end -= self.start;
                    self.scanned -= self.start;
                    self.start = 0;
                } else if self.buf.len() < self.cap {
                    // The one permitted regrow, straight to the cap.
                    self.buf.resize(self.cap, 0);
                } else {
                    return Err(LineReadError::ReadQExceeded);
                }
            }

            let n = self.inner.read(&mut self.buf[self.end..]).await?;
            if n == 0 {
                if self.start == self.end {
                    return Err(LineReadError::Eof);
                }
                return Err(LineReadError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended mid-line",
                )));
            }
            self.end += n;
        }
    }
}
