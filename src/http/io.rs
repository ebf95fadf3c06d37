//! Buffered connection I/O.
//!
//! [`Conn`] wraps either side of the proxy (plain TCP, TLS, or an
//! in-memory duplex in tests) behind one buffered reader with the line
//! discipline the HTTP state machine needs: CR only before LF, no
//! control characters other than TAB, bounded line length with
//! flush-to-LF on overflow.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{GantryError, GantryResult};

/// Maximum line length accepted from either peer
pub const MAX_LINE: usize = 4096;

/// Read buffer size, also the body-copy chunk size
pub const BUF_SIZE: usize = 8192;

/// Object-safe stream bound for both sides of the proxy
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Result of reading one line
#[derive(Debug, PartialEq, Eq)]
pub enum ReadLine {
    /// A complete line with the EOL stripped
    Line(String),
    /// Clean end of stream before any byte of a line
    Eof,
}

/// A buffered, timeout-guarded connection
pub struct Conn {
    stream: Box<dyn AsyncStream>,
    buf: Box<[u8; BUF_SIZE]>,
    pos: usize,
    filled: usize,
    timeout: Duration,
}

impl Conn {
    pub fn new<S: AsyncStream + 'static>(stream: S, timeout: Duration) -> Self {
        Conn {
            stream: Box::new(stream),
            buf: Box::new([0u8; BUF_SIZE]),
            pos: 0,
            filled: 0,
            timeout,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Bytes sitting in the read buffer, not yet consumed
    pub fn pending(&self) -> usize {
        self.filled - self.pos
    }

    /// Refill the internal buffer; returns the number of new bytes
    /// (0 on EOF). Assumes the buffer has been fully consumed.
    async fn fill(&mut self) -> GantryResult<usize> {
        self.pos = 0;
        self.filled = 0;
        let n = tokio::time::timeout(self.timeout, self.stream.read(&mut self.buf[..]))
            .await
            .map_err(|_| GantryError::timeout(self.timeout, "socket read"))??;
        self.filled = n;
        Ok(n)
    }

    fn next_byte(&mut self) -> Option<u8> {
        if self.pos < self.filled {
            let b = self.buf[self.pos];
            self.pos += 1;
            Some(b)
        } else {
            None
        }
    }

    async fn read_byte(&mut self) -> GantryResult<Option<u8>> {
        if let Some(b) = self.next_byte() {
            return Ok(Some(b));
        }
        if self.fill().await? == 0 {
            return Ok(None);
        }
        Ok(self.next_byte())
    }

    /// Consume input up to and including the next LF. Used to resync
    /// after an overlong or malformed line before reporting the error.
    async fn flush_to_lf(&mut self) -> GantryResult<()> {
        while let Some(b) = self.read_byte().await? {
            if b == b'\n' {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Read one header/request/chunk line, stripping the EOL.
    ///
    /// Errors on a bare CR, CR not followed by LF, any control
    /// character other than TAB, and on lines longer than [`MAX_LINE`]
    /// (the rest of the line is consumed first so the caller could in
    /// principle keep going).
    pub async fn read_line(&mut self) -> GantryResult<ReadLine> {
        let mut line: Vec<u8> = Vec::new();
        let mut seen_cr = false;

        loop {
            let b = match self.read_byte().await? {
                Some(b) => b,
                None => {
                    if line.is_empty() && !seen_cr {
                        return Ok(ReadLine::Eof);
                    }
                    return Err(GantryError::client("unexpected EOF inside line"));
                }
            };

            if seen_cr {
                if b == b'\n' {
                    return Ok(ReadLine::Line(String::from_utf8_lossy(&line).into_owned()));
                }
                self.flush_to_lf().await?;
                return Err(GantryError::client("CR not followed by LF"));
            }

            match b {
                b'\r' => seen_cr = true,
                b'\n' => {
                    return Ok(ReadLine::Line(String::from_utf8_lossy(&line).into_owned()));
                }
                b'\t' => line.push(b),
                c if c < 0x20 || c == 0x7f => {
                    self.flush_to_lf().await?;
                    return Err(GantryError::client("control character in line"));
                }
                c => line.push(c),
            }

            if line.len() > MAX_LINE {
                self.flush_to_lf().await?;
                return Err(GantryError::client("line too long"));
            }
        }
    }

    /// Read some bytes, draining the internal buffer first
    pub async fn read_some(&mut self, out: &mut [u8]) -> GantryResult<usize> {
        let pending = self.pending();
        if pending > 0 {
            let n = pending.min(out.len());
            out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        let n = tokio::time::timeout(self.timeout, self.stream.read(out))
            .await
            .map_err(|_| GantryError::timeout(self.timeout, "socket read"))??;
        Ok(n)
    }

    pub async fn write_all(&mut self, data: &[u8]) -> GantryResult<()> {
        tokio::time::timeout(self.timeout, self.stream.write_all(data))
            .await
            .map_err(|_| GantryError::timeout(self.timeout, "socket write"))??;
        Ok(())
    }

    pub async fn flush(&mut self) -> GantryResult<()> {
        tokio::time::timeout(self.timeout, self.stream.flush())
            .await
            .map_err(|_| GantryError::timeout(self.timeout, "socket flush"))??;
        Ok(())
    }

    /// Probe an idle pooled connection. A kept-alive backend socket
    /// should have nothing to say between requests; if it is readable
    /// the only possibilities are EOF or stray bytes, and either way it
    /// must not be reused.
    pub async fn is_stale(&mut self) -> bool {
        if self.pending() > 0 {
            return true;
        }
        let mut probe = [0u8; 1];
        match tokio::time::timeout(
            Duration::from_millis(1),
            self.stream.read(&mut probe),
        )
        .await
        {
            Err(_) => false,       // nothing to read within the probe window
            Ok(Ok(0)) => true,     // EOF
            Ok(Ok(_)) => true,     // unexpected data
            Ok(Err(_)) => true,
        }
    }

    /// Gracefully shut down the write side
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("pending", &self.pending())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_from(data: &[u8]) -> Conn {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let data = data.to_vec();
        tokio::spawn(async move {
            b.write_all(&data).await.unwrap();
            // b drops here, signalling EOF
        });
        Conn::new(a, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_read_lines_crlf_and_lf() {
        let mut conn = conn_from(b"GET / HTTP/1.1\r\nHost: a\nX: y\r\n\r\n");
        assert_eq!(
            conn.read_line().await.unwrap(),
            ReadLine::Line("GET / HTTP/1.1".to_string())
        );
        assert_eq!(
            conn.read_line().await.unwrap(),
            ReadLine::Line("Host: a".to_string())
        );
        assert_eq!(
            conn.read_line().await.unwrap(),
            ReadLine::Line("X: y".to_string())
        );
        assert_eq!(conn.read_line().await.unwrap(), ReadLine::Line(String::new()));
        assert_eq!(conn.read_line().await.unwrap(), ReadLine::Eof);
    }

    #[tokio::test]
    async fn test_bare_cr_rejected() {
        let mut conn = conn_from(b"bad\rline\nnext\n");
        assert!(conn.read_line().await.is_err());
        // resynced past the LF
        assert_eq!(
            conn.read_line().await.unwrap(),
            ReadLine::Line("next".to_string())
        );
    }

    #[tokio::test]
    async fn test_control_char_rejected() {
        let mut conn = conn_from(b"a\x01b\nok\n");
        assert!(conn.read_line().await.is_err());
        assert_eq!(
            conn.read_line().await.unwrap(),
            ReadLine::Line("ok".to_string())
        );
    }

    #[tokio::test]
    async fn test_tab_allowed() {
        let mut conn = conn_from(b"X: a\tb\r\n");
        assert_eq!(
            conn.read_line().await.unwrap(),
            ReadLine::Line("X: a\tb".to_string())
        );
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let mut data = vec![b'a'; MAX_LINE + 10];
        data.extend_from_slice(b"\nshort\n");
        let mut conn = conn_from(&data);
        assert!(conn.read_line().await.is_err());
        assert_eq!(
            conn.read_line().await.unwrap(),
            ReadLine::Line("short".to_string())
        );
    }

    #[tokio::test]
    async fn test_read_some_drains_buffer_first() {
        let mut conn = conn_from(b"line\nBODY");
        assert_eq!(
            conn.read_line().await.unwrap(),
            ReadLine::Line("line".to_string())
        );
        let mut out = [0u8; 16];
        let n = conn.read_some(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"BODY");
    }
}
