//! Newline-delimited line channel

use std::fmt::Display;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use crate::error::IpcError;
use crate::MAX_LINE_LEN;

/// Split a connected stream into line reader and writer halves
pub fn split(stream: UnixStream) -> (LineReader<OwnedReadHalf>, LineWriter<OwnedWriteHalf>) {
    let (read, write) = stream.into_split();
    (LineReader::new(read), LineWriter::new(write))
}

/// Reads bounded lines. Cancel safe: partial input survives a dropped future.
pub struct LineReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            pending: Vec::with_capacity(MAX_LINE_LEN + 1),
        }
    }

    /// Next line without its terminator, or `None` once the peer closed.
    ///
    /// A final unterminated line before end of stream is still returned.
    pub async fn next_line(&mut self) -> Result<Option<String>, IpcError> {
        // Room for the longest line plus its newline
        let limit = (MAX_LINE_LEN + 1).saturating_sub(self.pending.len()) as u64;
        let read = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut self.pending)
            .await?;

        let terminated = self.pending.last() == Some(&b'\n');
        if !terminated {
            if self.pending.len() > MAX_LINE_LEN {
                self.pending.clear();
                return Err(IpcError::LineTooLong(MAX_LINE_LEN));
            }
            if read == 0 && self.pending.is_empty() {
                return Ok(None);
            }
            // Otherwise the stream ended mid-line; the next call sees EOF
        }
        self.take_line().map(Some)
    }

    fn take_line(&mut self) -> Result<String, IpcError> {
        let mut line = std::mem::take(&mut self.pending);
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        String::from_utf8(line).map_err(|_| IpcError::InvalidUtf8)
    }
}

/// Writes one line per message
pub struct LineWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write `message` followed by a newline and flush.
    ///
    /// `message` must not contain a newline itself.
    pub async fn send<T: Display + ?Sized>(&mut self, message: &T) -> Result<(), IpcError> {
        let mut line = message.to_string();
        debug_assert!(!line.contains('\n'));
        if line.len() > MAX_LINE_LEN {
            return Err(IpcError::LineTooLong(MAX_LINE_LEN));
        }
        line.push('\n');
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Close the write direction; the peer reads end of stream
    pub async fn shutdown(&mut self) -> Result<(), IpcError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
