//! Body copying for the three framing modes.
//!
//! All copies go through a small fixed buffer; the slower side gates
//! throughput because every write completes before the next read is
//! issued.

use tracing::{debug, warn};

use super::io::{Conn, ReadLine, BUF_SIZE};
use crate::error::{GantryError, GantryResult};

/// Copy exactly `len` bytes. With `dst == None` the bytes are read and
/// discarded (used when a terminal backend answers the request but the
/// client still sent a body).
pub async fn copy_fixed(
    src: &mut Conn,
    mut dst: Option<&mut Conn>,
    len: u64,
) -> GantryResult<u64> {
    let mut buf = [0u8; BUF_SIZE];
    let mut left = len;
    while left > 0 {
        let want = left.min(BUF_SIZE as u64) as usize;
        let n = src.read_some(&mut buf[..want]).await?;
        if n == 0 {
            return Err(GantryError::network("unexpected EOF in body"));
        }
        if let Some(out) = dst.as_deref_mut() {
            out.write_all(&buf[..n]).await?;
        }
        left -= n as u64;
    }
    if let Some(out) = dst.as_deref_mut() {
        out.flush().await?;
    }
    Ok(len)
}

/// Parse a chunk-size line: leading hex digits, optional `;extension`
fn parse_chunk_size(line: &str) -> Option<u64> {
    let hex: String = line
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    if hex.is_empty() {
        return None;
    }
    let rest = &line[hex.len()..];
    if !(rest.is_empty() || rest.starts_with(';') || rest.trim().is_empty()) {
        return None;
    }
    u64::from_str_radix(&hex, 16).ok()
}

/// Copy a chunked body: chunk-size lines, chunk data, the final
/// zero-size chunk and any trailing headers up to the empty line.
///
/// `max_size` > 0 bounds the total payload (used for request bodies
/// under a listener size limit).
pub async fn copy_chunked(
    src: &mut Conn,
    mut dst: Option<&mut Conn>,
    max_size: u64,
) -> GantryResult<u64> {
    let mut total: u64 = 0;

    loop {
        let line = match src.read_line().await? {
            ReadLine::Line(l) => l,
            ReadLine::Eof => return Ok(total),
        };
        let size = parse_chunk_size(&line).ok_or_else(|| {
            warn!("bad chunk header: {:?}", line);
            GantryError::client("bad chunk header")
        })?;

        if let Some(out) = dst.as_deref_mut() {
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\r\n").await?;
        }

        total += size;
        if max_size > 0 && total > max_size {
            return Err(GantryError::client("chunked content too large"));
        }

        if size == 0 {
            break;
        }

        copy_fixed(src, dst.as_deref_mut(), size).await?;

        // chunk data is followed by its own CRLF
        match src.read_line().await? {
            ReadLine::Line(l) if l.is_empty() => {}
            ReadLine::Line(l) => {
                debug!("unexpected data after chunk: {:?}", l);
            }
            ReadLine::Eof => return Err(GantryError::client("unexpected EOF after chunk")),
        }
        if let Some(out) = dst.as_deref_mut() {
            out.write_all(b"\r\n").await?;
        }
    }

    // possibly trailing headers
    loop {
        let line = match src.read_line().await? {
            ReadLine::Line(l) => l,
            ReadLine::Eof => break,
        };
        if let Some(out) = dst.as_deref_mut() {
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\r\n").await?;
        }
        if line.is_empty() {
            break;
        }
    }

    if let Some(out) = dst.as_deref_mut() {
        out.flush().await?;
    }
    Ok(total)
}

/// Copy until EOF, with an optional ceiling on the number of bytes
/// (RPC streaming advertises the maximum as its content length).
pub async fn copy_until_eof(
    src: &mut Conn,
    dst: &mut Conn,
    max: u64,
) -> GantryResult<u64> {
    let mut buf = [0u8; BUF_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = src.read_some(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
        if max > 0 && total > max {
            return Err(GantryError::client("stream length exceeded"));
        }
        dst.write_all(&buf[..n]).await?;
        dst.flush().await?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn feed(data: &[u8]) -> Conn {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let data = data.to_vec();
        tokio::spawn(async move {
            b.write_all(&data).await.unwrap();
        });
        Conn::new(a, Duration::from_secs(2))
    }

    fn sink() -> (Conn, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Conn::new(a, Duration::from_secs(2)), b)
    }

    #[test]
    fn test_parse_chunk_size() {
        assert_eq!(parse_chunk_size("0"), Some(0));
        assert_eq!(parse_chunk_size("1a"), Some(26));
        assert_eq!(parse_chunk_size("FF;name=value"), Some(255));
        assert_eq!(parse_chunk_size(""), None);
        assert_eq!(parse_chunk_size("xyz"), None);
    }

    #[tokio::test]
    async fn test_copy_fixed() {
        let mut src = feed(b"hello world tail");
        let (mut dst, mut out) = sink();
        let n = copy_fixed(&mut src, Some(&mut dst), 11).await.unwrap();
        assert_eq!(n, 11);
        let mut got = [0u8; 11];
        out.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello world");
    }

    #[tokio::test]
    async fn test_copy_fixed_discard() {
        let mut src = feed(b"discarded");
        let n = copy_fixed(&mut src, None, 9).await.unwrap();
        assert_eq!(n, 9);
    }

    #[tokio::test]
    async fn test_copy_fixed_short_input() {
        let mut src = feed(b"abc");
        let err = copy_fixed(&mut src, None, 10).await.unwrap_err();
        assert!(matches!(err, GantryError::Network { .. }));
    }

    #[tokio::test]
    async fn test_copy_chunked_roundtrip() {
        let body = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut src = feed(body);
        let (mut dst, mut out) = sink();
        let n = copy_chunked(&mut src, Some(&mut dst), 0).await.unwrap();
        assert_eq!(n, 11);
        drop(dst);
        let mut got = Vec::new();
        out.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, body);
    }

    #[tokio::test]
    async fn test_copy_chunked_with_trailers() {
        let body = b"3\r\nabc\r\n0\r\nX-Check: 1\r\n\r\n";
        let mut src = feed(body);
        let (mut dst, mut out) = sink();
        copy_chunked(&mut src, Some(&mut dst), 0).await.unwrap();
        drop(dst);
        let mut got = Vec::new();
        out.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, body);
    }

    #[tokio::test]
    async fn test_copy_chunked_bad_header() {
        let mut src = feed(b"not-hex\r\n");
        let err = copy_chunked(&mut src, None, 0).await.unwrap_err();
        assert!(matches!(err, GantryError::ClientProtocol { .. }));
    }

    #[tokio::test]
    async fn test_copy_chunked_size_limit() {
        let body = b"5\r\nhello\r\n5\r\nworld\r\n0\r\n\r\n";
        let mut src = feed(body);
        let err = copy_chunked(&mut src, None, 6).await.unwrap_err();
        assert!(matches!(err, GantryError::ClientProtocol { .. }));
    }

    #[tokio::test]
    async fn test_copy_until_eof() {
        let mut src = feed(b"stream until the end");
        let (mut dst, mut out) = sink();
        let n = copy_until_eof(&mut src, &mut dst, 0).await.unwrap();
        assert_eq!(n, 20);
        drop(dst);
        let mut got = Vec::new();
        out.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"stream until the end");
    }

    #[tokio::test]
    async fn test_copy_until_eof_cap() {
        let mut src = feed(b"0123456789");
        let (mut dst, _out) = sink();
        let err = copy_until_eof(&mut src, &mut dst, 5).await.unwrap_err();
        assert!(matches!(err, GantryError::ClientProtocol { .. }));
    }
}
