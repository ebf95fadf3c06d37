//! Bidirectional byte tunneling after a WebSocket upgrade.
//!
//! Once both sides completed the 101 handshake the connection stops
//! being HTTP: bytes are shuttled verbatim in both directions until
//! either side closes or the idle timeout fires. Buffered leftovers
//! from the header phase are flushed first so early frames are not
//! lost.

use std::time::Duration;

use tracing::debug;

use crate::error::GantryResult;
use crate::http::io::{Conn, BUF_SIZE};

/// Outcome counters of a tunnel run
#[derive(Debug, Default, Clone, Copy)]
pub struct TunnelStats {
    /// Bytes moved client -> backend
    pub up: u64,
    /// Bytes moved backend -> client
    pub down: u64,
}

/// Shuttle bytes both ways until EOF on either side or `idle` passes
/// without traffic.
pub async fn run(client: &mut Conn, backend: &mut Conn, idle: Duration) -> GantryResult<TunnelStats> {
    let mut stats = TunnelStats::default();
    let mut up_buf = [0u8; BUF_SIZE];
    let mut down_buf = [0u8; BUF_SIZE];

    // leftovers read together with the upgrade headers
    while client.pending() > 0 {
        let n = client.read_some(&mut up_buf).await?;
        backend.write_all(&up_buf[..n]).await?;
        stats.up += n as u64;
    }
    backend.flush().await?;
    while backend.pending() > 0 {
        let n = backend.read_some(&mut down_buf).await?;
        client.write_all(&down_buf[..n]).await?;
        stats.down += n as u64;
    }
    client.flush().await?;

    loop {
        tokio::select! {
            res = client.read_some(&mut up_buf) => {
                let n = match res {
                    Ok(n) => n,
                    Err(crate::error::GantryError::Timeout { .. }) => break,
                    Err(e) => return Err(e),
                };
                if n == 0 {
                    debug!("tunnel: client closed");
                    break;
                }
                backend.write_all(&up_buf[..n]).await?;
                backend.flush().await?;
                stats.up += n as u64;
            }
            res = backend.read_some(&mut down_buf) => {
                let n = match res {
                    Ok(n) => n,
                    Err(crate::error::GantryError::Timeout { .. }) => break,
                    Err(e) => return Err(e),
                };
                if n == 0 {
                    debug!("tunnel: backend closed");
                    break;
                }
                client.write_all(&down_buf[..n]).await?;
                client.flush().await?;
                stats.down += n as u64;
            }
            _ = tokio::time::sleep(idle) => {
                debug!("tunnel: idle timeout");
                break;
            }
        }
    }
    Ok(stats)
}
