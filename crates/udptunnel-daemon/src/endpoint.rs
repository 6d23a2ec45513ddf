//! Connector endpoint specifications.
//!
//! Endpoints are written `<transport>/<role>:<address>`, e.g.
//! `udp/listen:0.0.0.0:60000` or `tls/client:relay.example.com:54321`. The
//! HTTP connector has no role: `http/0.0.0.0:8080`.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use udptunnel_core::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listen,
    Broadcast,
    Event,
    Client,
    Server,
}

/// A parsed endpoint specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub transport: Transport,
    pub role: Role,
    pub address: String,
}

/// Endpoint specification errors.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Invalid connector '{0}': expected <transport>/<role>:<address>")]
    Syntax(String),

    #[error("Unknown connector type '{0}'")]
    Unknown(String),

    #[error("Invalid address '{address}': {reason}")]
    Address { address: String, reason: String },

    #[error("'{endpoint}' cannot be used as the {side}-side connector")]
    WrongSide { endpoint: String, side: Side },
}

impl Endpoint {
    /// Whether this is a `udp/event` endpoint.
    pub fn is_event(&self) -> bool {
        self.transport == Transport::Udp && self.role == Role::Event
    }

    /// Check the endpoint is allowed on `side` and that its address is usable
    /// there.
    pub fn validate(&self, side: Side) -> Result<(), EndpointError> {
        let allowed = match (self.transport, self.role) {
            (Transport::Udp, Role::Event) | (Transport::Tcp | Transport::Tls, _) => true,
            (Transport::Udp, Role::Listen) | (Transport::Http, _) => side == Side::In,
            (Transport::Udp, Role::Broadcast) => side == Side::Out,
            _ => false,
        };
        if !allowed {
            return Err(EndpointError::WrongSide {
                endpoint: self.to_string(),
                side,
            });
        }

        if self.binds(side) {
            let addr = self.socket_addr()?;
            if addr.port() == 0 {
                return Err(self.address_error("a listening port is required"));
            }
        } else {
            let (_, port) = self.host_port()?;
            if port == 0 {
                return Err(self.address_error("a destination port is required"));
            }
        }
        Ok(())
    }

    /// Whether the endpoint binds its address locally rather than sending to it.
    fn binds(&self, side: Side) -> bool {
        match self.role {
            Role::Listen | Role::Server => true,
            Role::Event => side == Side::In,
            Role::Broadcast | Role::Client => false,
        }
    }

    /// The address as a literal socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, EndpointError> {
        self.address
            .parse()
            .map_err(|e: std::net::AddrParseError| self.address_error(&e.to_string()))
    }

    /// Split the address into host and port. The host may be a name.
    pub fn host_port(&self) -> Result<(&str, u16), EndpointError> {
        let (host, port) = self
            .address
            .rsplit_once(':')
            .ok_or_else(|| self.address_error("missing port"))?;
        let port = port
            .parse()
            .map_err(|_| self.address_error("invalid port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(self.address_error("missing host"));
        }
        Ok((host, port))
    }

    fn address_error(&self, reason: &str) -> EndpointError {
        EndpointError::Address {
            address: self.address.clone(),
            reason: reason.to_string(),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (transport, rest) = s
            .split_once('/')
            .ok_or_else(|| EndpointError::Syntax(s.to_string()))?;

        if transport == "http" {
            if rest.is_empty() {
                return Err(EndpointError::Syntax(s.to_string()));
            }
            return Ok(Self {
                transport: Transport::Http,
                role: Role::Server,
                address: rest.to_string(),
            });
        }

        let (role, address) = rest
            .split_once(':')
            .ok_or_else(|| EndpointError::Syntax(s.to_string()))?;
        if address.is_empty() {
            return Err(EndpointError::Syntax(s.to_string()));
        }

        let transport = match transport {
            "udp" => Transport::Udp,
            "tcp" => Transport::Tcp,
            "tls" => Transport::Tls,
            _ => return Err(EndpointError::Unknown(format!("{transport}/{role}"))),
        };
        let role = match (transport, role) {
            (Transport::Udp, "listen") => Role::Listen,
            (Transport::Udp, "broadcast") => Role::Broadcast,
            (Transport::Udp, "event") => Role::Event,
            (Transport::Tcp | Transport::Tls, "client") => Role::Client,
            (Transport::Tcp | Transport::Tls, "server") => Role::Server,
            _ => return Err(EndpointError::Unknown(format!("{}/{role}", scheme(transport)))),
        };

        Ok(Self {
            transport,
            role,
            address: address.to_string(),
        })
    }
}

const fn scheme(transport: Transport) -> &'static str {
    match transport {
        Transport::Udp => "udp",
        Transport::Tcp => "tcp",
        Transport::Tls => "tls",
        Transport::Http => "http",
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            Role::Listen => "listen",
            Role::Broadcast => "broadcast",
            Role::Event => "event",
            Role::Client => "client",
            Role::Server => "server",
        };
        match self.transport {
            Transport::Http => write!(f, "http/{}", self.address),
            t => write!(f, "{}/{role}:{}", scheme(t), self.address),
        }
    }
}
