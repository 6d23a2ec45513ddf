//! Connector contract.
//!
//! A connector is one end of a tunnel: a UDP socket, a stream client or
//! server, or an HTTP endpoint. The tunnel runs it, hands it a [`Switch`] to
//! route inbound messages through, and calls [`Connector::send`] with messages
//! relayed from the other side.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::router::Switch;

/// Grace period [`Lifecycle::close`] waits for a run loop to stop.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether inbound messages expect replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Inbound messages are requests; replies are routed back to the sender.
    #[default]
    Request,
    /// Inbound messages are one-way events; no reply handler is registered.
    Event,
}

/// Errors that end a connector's run loop.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("{connector}: gave up after {attempts} retries")]
    RetriesExhausted { connector: String, attempts: u32 },

    #[error("{connector}: {source}")]
    Io {
        connector: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConnectorError {
    pub fn io(connector: &str, source: std::io::Error) -> Self {
        Self::Io {
            connector: connector.to_string(),
            source,
        }
    }

    /// Whether a retry budget was spent.
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}

/// One end of a tunnel.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Short name for logs, e.g. `tls/client:relay.example:54321`.
    fn tag(&self) -> &str;

    /// Run until closed or until a terminal error. Every decoded inbound
    /// message is passed to `switch`.
    async fn run(&self, switch: Switch) -> Result<(), ConnectorError>;

    /// Queue a message for the peer. Never blocks; may drop when there is no
    /// transport ready.
    fn send(&self, id: u32, payload: Vec<u8>);

    /// Signal shutdown and wait, bounded by [`CLOSE_TIMEOUT`], for the run
    /// loop to stop.
    async fn close(&self);
}

/// Shutdown signalling shared by the connector implementations.
///
/// `close` cancels the token and waits for the [`RunGuard`] held by the run
/// loop to drop.
#[derive(Debug)]
pub struct Lifecycle {
    tag: String,
    cancel: CancellationToken,
    stopped: watch::Sender<bool>,
}

impl Lifecycle {
    pub fn new(tag: impl Into<String>) -> Self {
        let (stopped, _) = watch::channel(true);
        Self {
            tag: tag.into(),
            cancel: CancellationToken::new(),
            stopped,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub const fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Mark the run loop as started. The loop counts as stopped when the
    /// returned guard drops.
    pub fn guard(&self) -> RunGuard {
        self.stopped.send_replace(false);
        RunGuard {
            stopped: self.stopped.clone(),
        }
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        let mut stopped = self.stopped.subscribe();
        match tokio::time::timeout(CLOSE_TIMEOUT, stopped.wait_for(|s| *s)).await {
            Ok(_) => debug!(connector = %self.tag, "Closed"),
            Err(_) => warn!(connector = %self.tag, "Close timed out"),
        }
    }
}

/// Held by a running connector loop.
#[derive(Debug)]
pub struct RunGuard {
    stopped: watch::Sender<bool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.stopped.send_replace(true);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_without_run_returns_immediately() {
        let lifecycle = Lifecycle::new("idle");
        tokio::time::timeout(Duration::from_millis(100), lifecycle.close())
            .await
            .unwrap();
        assert!(lifecycle.is_cancelled());
    }

    #[tokio::test]
    async fn close_waits_for_guard() {
        let lifecycle = std::sync::Arc::new(Lifecycle::new("loop"));
        let guard = lifecycle.guard();
        let token = lifecycle.token().clone();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            token.cancelled().await;
            drop(guard);
            let _ = done_tx.send(());
        });

        lifecycle.close().await;
        done_rx.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn close_gives_up_after_timeout() {
        let lifecycle = Lifecycle::new("stuck");
        let _guard = lifecycle.guard();

        let start = tokio::time::Instant::now();
        lifecycle.close().await;
        assert!(start.elapsed() >= CLOSE_TIMEOUT);
    }

    #[test]
    fn exhausted_is_terminal() {
        let err = ConnectorError::RetriesExhausted {
            connector: "tcp/client:x:1".into(),
            attempts: 3,
        };
        assert!(err.is_exhausted());
        assert_eq!(err.to_string(), "tcp/client:x:1: gave up after 3 retries");
    }
}
