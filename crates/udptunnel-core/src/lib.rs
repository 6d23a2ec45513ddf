//! udptunnel Core Library
//!
//! Shared functionality for relaying ID-tagged packets between two connectors:
//! - Wire framing for stream transports
//! - Reconnect backoff
//! - Pending reply handlers and the message router
//! - Rate limiting of inbound messages
//! - The connector contract and the tunnel orchestrator
//! - Configuration file model and common error types

pub mod backoff;
pub mod codec;
pub mod config;
pub mod connector;
pub mod error;
pub mod message;
pub mod pending;
pub mod ratelimit;
pub mod router;
pub mod tracing_init;
pub mod tunnel;

pub use backoff::{Backoff, BackoffPolicy, WaitOutcome};
pub use codec::{CodecError, PacketCodec};
pub use config::{Settings, TunnelSettings};
pub use connector::{Connector, ConnectorError, Lifecycle, Mode, RunGuard};
pub use error::{Error, Result};
pub use message::{Message, next_id};
pub use pending::{PendingTable, ReplyHandler};
pub use ratelimit::RateLimiter;
pub use router::{Routed, Router, RouterConfig, Switch};
pub use tunnel::{Side, Tunnel, TunnelError};
