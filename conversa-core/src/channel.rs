//! ConnectionChannel: one duplex byte stream with line/raw framing.
//!
//! Raw mode is entered with an exact byte count and reverts to line mode by
//! itself once that many bytes have been read (or written). Whoever holds the
//! channel value is its only reader; ownership moves between tasks by value.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::protocol::{ControlMessage, Mode, CHUNK_SIZE, MAX_LINE_LEN};
use crate::wire;

/// Channel over a TCP connection.
pub type TcpChannel = ConnectionChannel<OwnedReadHalf, OwnedWriteHalf>;

pub struct ConnectionChannel<R, W> {
    reader: BufReader<R>,
    writer: W,
    mode: Mode,
    /// Payload bytes left in the current raw window.
    raw_remaining: u64,
    /// Partial line kept across cancelled reads.
    line_buf: Vec<u8>,
    label: String,
}

impl TcpChannel {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let label = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let _ = stream.set_nodelay(true);
        let (r, w) = stream.into_split();
        Self::new(r, w, label)
    }
}

impl<R, W> ConnectionChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, label: impl Into<String>) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            mode: Mode::Line,
            raw_remaining: 0,
            line_buf: Vec::new(),
            label: label.into(),
        }
    }

    /// Display label of the remote end (`ip:port` for TCP).
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Bytes left before the channel falls back to line mode.
    pub fn raw_remaining(&self) -> u64 {
        self.raw_remaining
    }

    /// Switch to raw mode for exactly `len` payload bytes. A zero length
    /// leaves the channel in line mode.
    pub fn enter_raw(&mut self, len: u64) -> Result<(), ChannelError> {
        self.expect_mode(Mode::Line)?;
        if !self.line_buf.is_empty() {
            return Err(ChannelError::PartialLine);
        }
        if len > 0 {
            self.mode = Mode::Raw;
            self.raw_remaining = len;
        }
        Ok(())
    }

    /// Abandon the raw window. Returns how many declared bytes were never consumed.
    pub fn leave_raw(&mut self) -> u64 {
        let left = self.raw_remaining;
        self.mode = Mode::Line;
        self.raw_remaining = 0;
        left
    }

    /// Next control line without its terminator; `None` once the peer has closed.
    ///
    /// Cancel safe: bytes of a partially received line stay buffered and are
    /// completed by the next call. A line that is not UTF-8 is consumed whole
    /// and reported as `InvalidUtf8`, leaving the stream aligned.
    pub async fn read_line(&mut self) -> Result<Option<String>, ChannelError> {
        self.expect_mode(Mode::Line)?;
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.line_buf.is_empty() {
                    return Ok(None);
                }
                break;
            }
            let (used, complete) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            };
            self.line_buf.extend_from_slice(&available[..used]);
            self.reader.consume(used);
            if self.line_buf.len() > MAX_LINE_LEN {
                self.line_buf.clear();
                return Err(ChannelError::LineTooLong(MAX_LINE_LEN));
            }
            if complete {
                break;
            }
        }
        let mut bytes = std::mem::take(&mut self.line_buf);
        while matches!(bytes.last(), Some(b'\n') | Some(b'\r')) {
            bytes.pop();
        }
        String::from_utf8(bytes).map(Some).map_err(|e| {
            ChannelError::InvalidUtf8(String::from_utf8_lossy(e.as_bytes()).into_owned())
        })
    }

    /// Read up to `buf.len()` payload bytes, never past the raw window.
    pub async fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        self.expect_mode(Mode::Raw)?;
        let want = buf.len().min(usize::try_from(self.raw_remaining).unwrap_or(usize::MAX));
        if want == 0 {
            return Ok(0);
        }
        let n = self.reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(ChannelError::Closed);
        }
        self.consume_raw(n as u64);
        Ok(n)
    }

    /// Read exactly `n` payload bytes from the raw window.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, ChannelError> {
        self.expect_mode(Mode::Raw)?;
        if n as u64 > self.raw_remaining {
            return Err(ChannelError::PayloadOverrun);
        }
        let mut out = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            filled += self.read_raw(&mut out[filled..]).await?;
        }
        Ok(out)
    }

    /// Read and drop whatever is left of the raw window.
    pub async fn discard_raw(&mut self) -> Result<u64, ChannelError> {
        let mut dropped = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        while self.mode == Mode::Raw {
            dropped += self.read_raw(&mut buf).await? as u64;
        }
        Ok(dropped)
    }

    /// Encode and send one control message. Refused while a payload is in flight.
    pub async fn write_message(&mut self, msg: &ControlMessage) -> Result<(), ChannelError> {
        self.write_line(&wire::encode(msg)).await
    }

    /// Send pre-encoded control text verbatim (newline appended if missing).
    pub async fn write_line(&mut self, text: &str) -> Result<(), ChannelError> {
        self.expect_mode(Mode::Line)?;
        self.writer.write_all(text.as_bytes()).await?;
        if !text.ends_with('\n') {
            self.writer.write_all(b"\n").await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Send payload bytes inside the raw window.
    pub async fn write_raw(&mut self, chunk: &[u8]) -> Result<(), ChannelError> {
        self.expect_mode(Mode::Raw)?;
        if chunk.len() as u64 > self.raw_remaining {
            return Err(ChannelError::PayloadOverrun);
        }
        self.writer.write_all(chunk).await?;
        self.consume_raw(chunk.len() as u64);
        if self.mode == Mode::Line {
            self.writer.flush().await?;
        }
        Ok(())
    }

    /// Flush and close the write side.
    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    fn consume_raw(&mut self, n: u64) {
        self.raw_remaining -= n;
        if self.raw_remaining == 0 {
            self.mode = Mode::Line;
        }
    }

    fn expect_mode(&self, expected: Mode) -> Result<(), ChannelError> {
        if self.mode == expected {
            Ok(())
        } else {
            Err(ChannelError::WrongMode {
                expected,
                actual: self.mode,
            })
        }
    }
}

/// Transport-level failure. The connection should be treated as unusable,
/// except for `WrongMode` which signals a caller bug and `InvalidUtf8`
/// after which the next line can still be read.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed in the middle of a payload")]
    Closed,
    #[error("operation needs {expected:?} mode, channel is in {actual:?} mode")]
    WrongMode { expected: Mode, actual: Mode },
    #[error("cannot enter raw mode with a partial line buffered")]
    PartialLine,
    #[error("write or read past the declared payload length")]
    PayloadOverrun,
    /// Lossy rendering of the offending line.
    #[error("control line is not valid UTF-8: {0:?}")]
    InvalidUtf8(String),
    #[error("control line longer than {0} bytes")]
    LineTooLong(usize),
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::duplex_pair;
    use super::*;

    #[tokio::test]
    async fn line_raw_line_stays_aligned() {
        let (mut a, mut b) = duplex_pair();
        a.write_line("OK").await.unwrap();
        a.enter_raw(5).unwrap();
        a.write_raw(b"ab\ncd").await.unwrap();
        assert_eq!(a.mode(), Mode::Line);
        a.write_line("CHAT_SERVIDOR next").await.unwrap();

        assert_eq!(b.read_line().await.unwrap().as_deref(), Some("OK"));
        b.enter_raw(5).unwrap();
        let payload = b.read_exact(5).await.unwrap();
        assert_eq!(payload, b"ab\ncd");
        assert_eq!(b.mode(), Mode::Line);
        assert_eq!(
            b.read_line().await.unwrap().as_deref(),
            Some("CHAT_SERVIDOR next")
        );
    }

    #[tokio::test]
    async fn raw_reads_stop_at_window() {
        let (mut a, mut b) = duplex_pair();
        a.write_line("x").await.unwrap();
        a.enter_raw(3).unwrap();
        a.write_raw(b"123").await.unwrap();
        a.write_line("after").await.unwrap();

        b.read_line().await.unwrap();
        b.enter_raw(3).unwrap();
        let mut buf = [0u8; 64];
        let mut got = Vec::new();
        while b.mode() == Mode::Raw {
            let n = b.read_raw(&mut buf).await.unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"123");
        assert_eq!(b.read_line().await.unwrap().as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn mode_misuse_is_rejected() {
        let (mut a, mut b) = duplex_pair();
        a.enter_raw(2).unwrap();
        assert!(matches!(
            a.write_line("CHAT_SERVIDOR hi").await,
            Err(ChannelError::WrongMode { .. })
        ));
        assert!(matches!(
            a.write_raw(b"abc").await,
            Err(ChannelError::PayloadOverrun)
        ));
        assert!(matches!(
            b.read_raw(&mut [0u8; 4]).await,
            Err(ChannelError::WrongMode { .. })
        ));
        assert_eq!(a.leave_raw(), 2);
        assert_eq!(a.mode(), Mode::Line);
    }

    #[tokio::test]
    async fn zero_length_raw_is_noop() {
        let (mut a, _b) = duplex_pair();
        a.enter_raw(0).unwrap();
        assert_eq!(a.mode(), Mode::Line);
    }

    #[tokio::test]
    async fn closed_peer_reads_none() {
        let (mut a, mut b) = duplex_pair();
        a.write_line("SAIR").await.unwrap();
        a.shutdown().await.unwrap();
        drop(a);
        assert_eq!(b.read_line().await.unwrap().as_deref(), Some("SAIR"));
        assert!(b.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_mid_payload_is_error() {
        let (mut a, mut b) = duplex_pair();
        a.enter_raw(10).unwrap();
        a.write_raw(b"1234").await.unwrap();
        drop(a);
        b.enter_raw(10).unwrap();
        assert!(matches!(b.read_exact(10).await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn cancelled_read_keeps_partial_line() {
        let (a, mut b) = duplex_pair();
        let (_, mut aw) = (a.reader, a.writer);
        aw.write_all(b"CHAT_SERV").await.unwrap();
        aw.flush().await.unwrap();
        let first = tokio::time::timeout(Duration::from_millis(50), b.read_line()).await;
        assert!(first.is_err());
        aw.write_all(b"IDOR hello\n").await.unwrap();
        aw.flush().await.unwrap();
        assert_eq!(
            b.read_line().await.unwrap().as_deref(),
            Some("CHAT_SERVIDOR hello")
        );
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_skipped_not_fatal() {
        let (mut a, mut b) = duplex_pair();
        super::testing::write_bytes(&mut a, b"CHAT caf\xe9\nSAIR\n").await;
        match b.read_line().await {
            Err(ChannelError::InvalidUtf8(text)) => assert_eq!(text, "CHAT caf\u{FFFD}"),
            other => panic!("expected InvalidUtf8, got {:?}", other),
        }
        assert_eq!(b.read_line().await.unwrap().as_deref(), Some("SAIR"));
    }

    #[tokio::test]
    async fn overlong_line_is_rejected() {
        let (mut a, mut b) = duplex_pair();
        let writer = tokio::spawn(async move {
            let junk = vec![b'x'; MAX_LINE_LEN + 10];
            super::testing::write_bytes(&mut a, &junk).await;
            a
        });
        assert!(matches!(
            b.read_line().await,
            Err(ChannelError::LineTooLong(MAX_LINE_LEN))
        ));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn line_at_limit_is_accepted() {
        let (mut a, mut b) = duplex_pair();
        let text = "y".repeat(MAX_LINE_LEN - 1);
        let sent = text.clone();
        let writer = tokio::spawn(async move {
            a.write_line(&sent).await.unwrap();
            a
        });
        assert_eq!(b.read_line().await.unwrap(), Some(text));
        writer.await.unwrap();
    }
}
