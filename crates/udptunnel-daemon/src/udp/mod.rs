//! UDP connectors.
//!
//! - [`UdpListen`]: in-side portal for `udp/listen` and `udp/event`. Every
//!   datagram becomes a new message with a fresh correlation ID.
//! - [`UdpBroadcast`]: out-side for `udp/broadcast` and `udp/event`. Every
//!   relayed message is sent as one datagram; in request mode the replies
//!   collected within the UDP timeout are routed back.

mod broadcast;
mod listen;

pub use broadcast::UdpBroadcast;
pub use listen::UdpListen;

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use udptunnel_core::{Backoff, ConnectorError, WaitOutcome};

/// Receive buffer size for a single datagram.
pub const DATAGRAM_BUFFER: usize = 2048;

/// Bind `addr`, retrying with backoff. `Ok(None)` means shutdown was requested.
pub(crate) async fn bind_with_retry(
    tag: &str,
    addr: SocketAddr,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
) -> Result<Option<UdpSocket>, ConnectorError> {
    loop {
        match UdpSocket::bind(addr).await {
            Ok(socket) => {
                backoff.reset();
                info!(connector = %tag, addr = %addr, "Listening");
                return Ok(Some(socket));
            }
            Err(e) => warn!(connector = %tag, error = %e, "Failed to bind UDP socket"),
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

/// Wildcard address of the same family as `addr`, for ephemeral sockets.
pub(crate) fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}
