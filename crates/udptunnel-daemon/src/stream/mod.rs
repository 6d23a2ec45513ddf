//! TCP and TLS connectors.
//!
//! Both transports share one implementation; TLS only adds a handshake in
//! front of the framed byte stream. Packets use the `[len][id][payload]`
//! framing from `udptunnel_core::codec`.

mod client;
mod conn;
mod server;

pub use client::{ClientSecurity, StreamClient};
pub use server::{ServerSecurity, StreamServer};

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use udptunnel_core::{Backoff, ConnectorError, WaitOutcome};

/// Capacity of every per-connection outbound queue.
pub const QUEUE_CAPACITY: usize = 16;

/// Bound on establishing a TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on completing a TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind a TCP listener on `addr`, retrying with backoff. `Ok(None)` means
/// shutdown was requested.
pub(crate) async fn bind_with_retry(
    tag: &str,
    addr: SocketAddr,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
) -> Result<Option<TcpListener>, ConnectorError> {
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                backoff.reset();
                return Ok(Some(listener));
            }
            Err(e) => warn!(connector = %tag, error = %e, "Failed to bind"),
        }

        match backoff.wait(tag, cancel).await {
            WaitOutcome::Retry => {}
            WaitOutcome::Cancelled => return Ok(None),
            WaitOutcome::Exhausted => {
                return Err(ConnectorError::RetriesExhausted {
                    connector: tag.to_string(),
                    attempts: backoff.attempt().saturating_sub(1),
                });
            }
        }
    }
}

/// Quick reconnects for tests.
#[cfg(test)]
pub(crate) const fn fast_policy(max_attempts: Option<u32>) -> udptunnel_core::BackoffPolicy {
    udptunnel_core::BackoffPolicy {
        min_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(20),
        max_attempts,
    }
}
