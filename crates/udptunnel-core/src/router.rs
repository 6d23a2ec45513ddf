//! Message router.
//!
//! Every inbound message from a connector passes through a [`Switch`]. A
//! message whose ID matches a pending handler is a reply and is delivered to
//! that handler; anything else is a new request and is relayed to the other
//! side of the tunnel, after registering the caller's reply handler if it
//! supplied one.
//!
//! Handler invocations and relays run on their own tasks so a slow consumer
//! never stalls the connector's read loop.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::message::hex_dump;
use crate::pending::{DEFAULT_IDLE_TIMEOUT, PendingTable, ReplyHandler, SWEEP_INTERVAL};
use crate::ratelimit::{DEFAULT_BURST, DEFAULT_RATE, RateLimiter};

const SWEEPER_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Router tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouterConfig {
    /// Idle time after which a pending handler is evicted.
    pub idle_timeout: Duration,
    /// Period of the eviction sweep.
    pub sweep_interval: Duration,
    /// `(messages per second, burst)`; `None` disables rate limiting.
    pub rate_limit: Option<(f64, u32)>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
            rate_limit: Some((DEFAULT_RATE, DEFAULT_BURST)),
        }
    }
}

/// What [`Switch::received`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Dropped by the rate limiter.
    RateLimited,
    /// Dropped because the payload was empty.
    Empty,
    /// Delivered to a pending reply handler.
    Reply,
    /// Relayed to the other side as a new request.
    Relayed,
}

/// Pending handler table, rate limiter and sweep task shared by both sides of
/// a tunnel.
pub struct Router {
    pending: Arc<PendingTable>,
    limiter: Option<RateLimiter>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("idle_timeout", &self.pending.idle_timeout())
            .field("rate_limited", &self.limiter.is_some())
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create a router and start its sweep task.
    pub fn start(config: RouterConfig) -> Arc<Self> {
        let pending = Arc::new(PendingTable::new(config.idle_timeout));
        let cancel = CancellationToken::new();
        let interval = config.sweep_interval.max(MIN_SWEEP_INTERVAL);
        let sweeper = spawn_sweeper(Arc::clone(&pending), interval, cancel.clone());

        let limiter = config
            .rate_limit
            .filter(|(rate, _)| *rate > 0.0)
            .map(|(rate, burst)| RateLimiter::new(rate, burst));

        Arc::new(Self {
            pending,
            limiter,
            cancel,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Stop the sweep task.
    pub async fn close(&self) {
        self.cancel.cancel();
        let Some(handle) = self.sweeper.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(SWEEPER_STOP_TIMEOUT, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Router sweeper failed"),
            Err(_) => warn!("Router sweeper did not stop in time"),
        }
    }

    async fn admit(&self) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.allow().await,
            None => true,
        }
    }
}

fn spawn_sweeper(
    pending: Arc<PendingTable>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    pending.sweep().await;
                }
                () = cancel.cancelled() => {
                    debug!("Router sweeper shutting down");
                    return;
                }
            }
        }
    })
}

type Relay = Arc<dyn Fn(u32, Vec<u8>) + Send + Sync>;

/// A connector's view of the router: shared routing state plus the relay
/// target on the opposite side.
#[derive(Clone)]
pub struct Switch {
    router: Arc<Router>,
    relay: Relay,
}

impl fmt::Debug for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Switch")
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl Switch {
    pub fn new<F>(router: Arc<Router>, relay: F) -> Self
    where
        F: Fn(u32, Vec<u8>) + Send + Sync + 'static,
    {
        Self {
            router,
            relay: Arc::new(relay),
        }
    }

    pub const fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Route one inbound message.
    ///
    /// `reply` is the caller's handler for a future reply to this message, or
    /// `None` when the caller does not expect one.
    pub async fn received(&self, id: u32, payload: Vec<u8>, reply: Option<ReplyHandler>) -> Routed {
        if !self.router.admit().await {
            warn!(id, bytes = payload.len(), "Rate limit exceeded, dropping message");
            return Routed::RateLimited;
        }

        if payload.is_empty() {
            return Routed::Empty;
        }

        debug!(id, bytes = payload.len(), "Received\n{}", hex_dump(&payload));

        if let Some(handler) = self.router.pending.take(id).await {
            debug!(id, "Delivering reply");
            tokio::spawn(handler.invoke(payload));
            return Routed::Reply;
        }

        if let Some(handler) = reply {
            self.router.pending.put(id, handler).await;
        }

        let relay = Arc::clone(&self.relay);
        tokio::spawn(async move { relay(id, payload) });
        Routed::Relayed
    }
}
