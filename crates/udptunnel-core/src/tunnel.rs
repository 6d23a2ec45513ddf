//! Tunnel orchestrator.
//!
//! A tunnel owns two connectors. Messages the in-side relays go to the
//! out-side's `send`, and the other way round. Both run until the shutdown
//! token fires or either side stops; then both are closed and the router's
//! sweep task is stopped.

use std::fmt;
use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::connector::{Connector, ConnectorError};
use crate::router::{Router, Switch};

/// Which end of the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Portal side, facing local UDP peers.
    In,
    /// Pipe side, facing the remote peer.
    Out,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => f.write_str("in"),
            Self::Out => f.write_str("out"),
        }
    }
}

/// Reasons a tunnel run ends other than a requested shutdown.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("{side}-side connector failed: {source}")]
    Connector {
        side: Side,
        #[source]
        source: ConnectorError,
    },

    #[error("{side}-side connector stopped unexpectedly")]
    Stopped { side: Side },

    #[error("{side}-side connector task aborted: {source}")]
    Aborted {
        side: Side,
        #[source]
        source: JoinError,
    },
}

impl TunnelError {
    pub const fn side(&self) -> Side {
        match self {
            Self::Connector { side, .. } | Self::Stopped { side } | Self::Aborted { side, .. } => *side,
        }
    }
}

/// Two connectors wired back to back through a shared [`Router`].
pub struct Tunnel {
    inside: Arc<dyn Connector>,
    outside: Arc<dyn Connector>,
    router: Arc<Router>,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("in", &self.inside.tag())
            .field("out", &self.outside.tag())
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    pub fn new(inside: Arc<dyn Connector>, outside: Arc<dyn Connector>, router: Arc<Router>) -> Self {
        Self {
            inside,
            outside,
            router,
        }
    }

    /// Run both connectors until `shutdown` fires or one of them stops.
    ///
    /// Returns `Ok(())` for a requested shutdown and the first connector
    /// failure otherwise. Both connectors are closed either way.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), TunnelError> {
        info!(inside = %self.inside.tag(), outside = %self.outside.tag(), "Starting tunnel");

        let mut in_task = spawn_side(&self.inside, &self.outside, &self.router);
        let mut out_task = spawn_side(&self.outside, &self.inside, &self.router);

        let outcome = tokio::select! {
            () = shutdown.cancelled() => {
                info!("Tunnel shutting down");
                Ok(())
            }
            res = &mut in_task => side_finished(Side::In, res),
            res = &mut out_task => side_finished(Side::Out, res),
        };

        if let Err(e) = &outcome {
            error!(error = %e, side = %e.side(), "Tunnel failed");
        }

        tokio::join!(self.inside.close(), self.outside.close(), self.router.close());
        in_task.abort();
        out_task.abort();

        info!("Tunnel stopped");
        outcome
    }
}

fn spawn_side(
    this: &Arc<dyn Connector>,
    other: &Arc<dyn Connector>,
    router: &Arc<Router>,
) -> JoinHandle<Result<(), ConnectorError>> {
    let target = Arc::clone(other);
    let switch = Switch::new(Arc::clone(router), move |id, payload| target.send(id, payload));
    let connector = Arc::clone(this);
    tokio::spawn(async move { connector.run(switch).await })
}

fn side_finished(
    side: Side,
    res: Result<Result<(), ConnectorError>, JoinError>,
) -> Result<(), TunnelError> {
    match res {
        Ok(Ok(())) => Err(TunnelError::Stopped { side }),
        Ok(Err(source)) => Err(TunnelError::Connector { side, source }),
        Err(source) => Err(TunnelError::Aborted { side, source }),
    }
}
