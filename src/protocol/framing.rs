//! Line-then-payload framing over a byte stream.
//!
//! Text lines and raw payloads share one connection, so the reader keeps a
//! single buffer for both: whatever bytes arrive after a newline stay in the
//! buffer and are handed out by the next `read_line()` or `read_payload()`.

use std::fmt;
use std::marker::Unpin;
use std::str;

use crate::protocol::Message;
use crate::utils::DfsError;

use bytes::{Bytes, BytesMut};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest command line accepted before the peer is considered broken.
const MAX_LINE_LEN: usize = 64 * 1024;

/// Most buffer space reserved ahead of payload bytes actually arriving.
const PAYLOAD_CHUNK: usize = 64 * 1024;

/// One received command line, raw bytes without its terminator.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Line(Bytes);

impl Line {
    /// Parses the line into a message. Lines that are not valid UTF-8 are
    /// refused, never rewritten.
    pub fn parse_msg(&self) -> Result<Message, DfsError> {
        str::from_utf8(&self.0)?.parse()
    }
}

impl From<&str> for Line {
    fn from(text: &str) -> Self {
        Line(Bytes::copy_from_slice(text.as_bytes()))
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match str::from_utf8(&self.0) {
            Ok(text) => write!(f, "{}", text),
            Err(_) => write!(f, "{}", self.0.escape_ascii()),
        }
    }
}

/// Buffered reader half of a protocol connection.
pub struct FrameReader<R> {
    conn_read: R,
    read_buf: BytesMut,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(conn_read: R) -> Self {
        FrameReader {
            conn_read,
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Reads the next newline-terminated line, without its terminator.
    /// Returns:
    ///   - `Ok(Some(line))` if a full line arrived, possibly not UTF-8
    ///   - `Ok(None)` if the peer closed the connection
    ///   - `Err(err)` on I/O error or an overlong line
    ///
    /// CANCELLATION SAFETY: bytes read before a cancellation stay in the
    /// buffer, so this can be used as a `tokio::select!` branch.
    pub async fn read_line(&mut self) -> Result<Option<Line>, DfsError> {
        let mut scanned = 0;
        loop {
            if let Some(pos) =
                self.read_buf[scanned..].iter().position(|&b| b == b'\n')
            {
                let mut line = self.read_buf.split_to(scanned + pos + 1);
                line.truncate(line.len() - 1);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Ok(Some(Line(line.freeze())));
            }
            scanned = self.read_buf.len();

            if scanned > MAX_LINE_LEN {
                return Err(DfsError::msg(format!(
                    "line exceeds {} bytes",
                    MAX_LINE_LEN
                )));
            }
            if self.conn_read.read_buf(&mut self.read_buf).await? == 0 {
                // a half-written last line is dropped along with the peer
                return Ok(None);
            }
        }
    }

    /// Reads exactly `len` raw payload bytes following a command line. The
    /// buffer grows with the bytes received, not with the announced `len`.
    pub async fn read_payload(&mut self, len: usize) -> Result<Bytes, DfsError> {
        while self.read_buf.len() < len {
            self.read_buf
                .reserve((len - self.read_buf.len()).min(PAYLOAD_CHUNK));
            if self.conn_read.read_buf(&mut self.read_buf).await? == 0 {
                return Err(DfsError::msg(format!(
                    "connection closed after {} of {} payload bytes",
                    self.read_buf.len(),
                    len
                )));
            }
        }
        Ok(self.read_buf.split_to(len).freeze())
    }
}

/// Writer half of a protocol connection.
pub struct FrameWriter<W> {
    conn_write: W,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(conn_write: W) -> Self {
        FrameWriter { conn_write }
    }

    /// Writes one message as a newline-terminated line.
    pub async fn send(&mut self, msg: &Message) -> Result<(), DfsError> {
        let mut line = msg.to_string();
        line.push('\n');
        self.conn_write.write_all(line.as_bytes()).await?;
        self.conn_write.flush().await?;
        Ok(())
    }

    /// Writes a raw payload with no framing around it.
    pub async fn send_payload(&mut self, data: &[u8]) -> Result<(), DfsError> {
        self.conn_write.write_all(data).await?;
        self.conn_write.flush().await?;
        Ok(())
    }

    /// Shuts down the write direction, signalling EOF to the peer.
    pub async fn close(&mut self) -> Result<(), DfsError> {
        self.conn_write.shutdown().await?;
        Ok(())
    }
}
