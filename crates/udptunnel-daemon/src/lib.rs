//! udptunnel Daemon Library
//!
//! Concrete connectors and the glue that builds a tunnel from settings:
//! - Endpoint specification parsing (`udp/listen:0.0.0.0:60000`, ...)
//! - UDP listen, broadcast and event connectors
//! - TCP and TLS stream clients and servers
//! - HTTP request endpoint
//! - TLS material loading

pub mod endpoint;
pub mod factory;
pub mod http;
pub mod stream;
pub mod tls;
pub mod udp;
