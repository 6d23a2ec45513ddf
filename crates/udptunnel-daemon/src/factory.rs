//! Builds connectors and tunnels from endpoint specifications.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};
use udptunnel_core::{Connector, Mode, Router, Settings, Side, Tunnel};

use crate::endpoint::{Endpoint, EndpointError, Role, Transport};
use crate::http::HttpConnector;
use crate::stream::{ClientSecurity, ServerSecurity, StreamClient, StreamServer};
use crate::tls::{self, TlsConfigError};
use crate::udp::{UdpBroadcast, UdpListen};

/// Errors building a tunnel from its settings. All of them are configuration
/// problems reported before any connector runs.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] TlsConfigError),

    #[error("Failed to resolve '{address}': {source}")]
    Resolve {
        address: String,
        #[source]
        source: io::Error,
    },
}

/// Parse, validate and build both sides, wired through a router started from
/// `settings`.
pub async fn build_tunnel(settings: &Settings) -> Result<Tunnel, BuildError> {
    let inside: Endpoint = settings.inside.parse()?;
    let outside: Endpoint = settings.outside.parse()?;
    inside.validate(Side::In)?;
    outside.validate(Side::Out)?;

    let in_connector = build_connector(&inside, Side::In, outside.is_event(), settings).await?;
    let out_connector = build_connector(&outside, Side::Out, inside.is_event(), settings).await?;

    let router = Router::start(settings.router_config());
    Ok(Tunnel::new(in_connector, out_connector, router))
}

/// Build the connector for `endpoint` on `side`.
///
/// `other_is_event` is set when the opposite side is `udp/event`, in which
/// case stream connectors route inbound messages as one-way events.
pub async fn build_connector(
    endpoint: &Endpoint,
    side: Side,
    other_is_event: bool,
    settings: &Settings,
) -> Result<Arc<dyn Connector>, BuildError> {
    let policy = settings.backoff_policy();
    let mode = if other_is_event { Mode::Event } else { Mode::Request };
    debug!(endpoint = %endpoint, side = %side, mode = ?mode, "Building connector");

    let connector: Arc<dyn Connector> = match (endpoint.transport, endpoint.role) {
        (Transport::Udp, Role::Listen) => Arc::new(UdpListen::new(endpoint.socket_addr()?, policy)),
        (Transport::Udp, Role::Event) if side == Side::In => {
            Arc::new(UdpListen::events(endpoint.socket_addr()?, policy))
        }
        (Transport::Udp, Role::Event) => Arc::new(UdpBroadcast::events(resolve(endpoint).await?)),
        (Transport::Udp, Role::Broadcast) => {
            Arc::new(UdpBroadcast::new(resolve(endpoint).await?, settings.udp_timeout))
        }
        (Transport::Tcp, Role::Client) => Arc::new(StreamClient::new(
            endpoint.address.clone(),
            ClientSecurity::Plain,
            policy,
            mode,
        )),
        (Transport::Tls, Role::Client) => Arc::new(StreamClient::new(
            endpoint.address.clone(),
            client_security(endpoint, settings)?,
            policy,
            mode,
        )),
        (Transport::Tcp, Role::Server) => Arc::new(StreamServer::new(
            endpoint.socket_addr()?,
            ServerSecurity::Plain,
            policy,
            mode,
        )),
        (Transport::Tls, Role::Server) => Arc::new(StreamServer::new(
            endpoint.socket_addr()?,
            server_security(settings)?,
            policy,
            mode,
        )),
        (Transport::Http, _) => Arc::new(HttpConnector::new(
            endpoint.socket_addr()?,
            policy,
            settings.udp_timeout,
        )),
        _ => {
            return Err(EndpointError::WrongSide {
                endpoint: endpoint.to_string(),
                side,
            }
            .into());
        }
    };

    info!(connector = %connector.tag(), side = %side, "Connector ready");
    Ok(connector)
}

async fn resolve(endpoint: &Endpoint) -> Result<SocketAddr, BuildError> {
    let resolve_error = |source| BuildError::Resolve {
        address: endpoint.address.clone(),
        source,
    };
    tokio::net::lookup_host(endpoint.address.as_str())
        .await
        .map_err(resolve_error)?
        .next()
        .ok_or_else(|| resolve_error(io::Error::new(io::ErrorKind::NotFound, "no addresses")))
}

fn client_security(endpoint: &Endpoint, settings: &Settings) -> Result<ClientSecurity, BuildError> {
    let (host, _) = endpoint.host_port()?;
    let identity = client_identity(settings);
    let config = tls::client_config(
        &settings.ca_cert,
        identity.as_ref().map(|(cert, key)| (cert.as_path(), key.as_path())),
    )?;
    Ok(ClientSecurity::Tls {
        connector: TlsConnector::from(config),
        server_name: tls::server_name(host)?,
    })
}

/// `--cert`/`--key` when both are given, otherwise the default client
/// certificate if it exists.
fn client_identity(settings: &Settings) -> Option<(PathBuf, PathBuf)> {
    match (&settings.cert, &settings.key) {
        (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
        _ => {
            let cert = Path::new(tls::DEFAULT_CLIENT_CERT);
            let key = Path::new(tls::DEFAULT_CLIENT_KEY);
            (cert.exists() && key.exists()).then(|| (cert.to_path_buf(), key.to_path_buf()))
        }
    }
}

fn server_security(settings: &Settings) -> Result<ServerSecurity, BuildError> {
    let cert = settings
        .cert
        .clone()
        .unwrap_or_else(|| PathBuf::from(tls::DEFAULT_SERVER_CERT));
    let key = settings
        .key
        .clone()
        .unwrap_or_else(|| PathBuf::from(tls::DEFAULT_SERVER_KEY));
    let config = tls::server_config(&settings.ca_cert, &cert, &key, settings.client_auth)?;
    Ok(ServerSecurity::Tls(TlsAcceptor::from(config)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use udptunnel_core::TunnelSettings;

    fn settings(inside: &str, outside: &str) -> Settings {
        Settings::try_from(TunnelSettings {
            inside: Some(inside.to_string()),
            outside: Some(outside.to_string()),
            ..TunnelSettings::default()
        })
        .unwrap()
    }

    async fn build(endpoint: &str, side: Side, settings: &Settings) -> Result<Arc<dyn Connector>, BuildError> {
        let endpoint: Endpoint = endpoint.parse().unwrap();
        build_connector(&endpoint, side, false, settings).await
    }

    #[tokio::test]
    async fn builds_plain_connectors() {
        let s = settings("udp/listen:127.0.0.1:60000", "tcp/client:127.0.0.1:54321");
        let tags = [
            ("udp/listen:127.0.0.1:60000", Side::In),
            ("udp/event:127.0.0.1:60001", Side::In),
            ("udp/event:127.0.0.1:60001", Side::Out),
            ("udp/broadcast:127.0.0.1:60000", Side::Out),
            ("tcp/client:127.0.0.1:54321", Side::Out),
            ("tcp/server:127.0.0.1:54321", Side::In),
            ("http/127.0.0.1:8080", Side::In),
        ];
        for (endpoint, side) in tags {
            let connector = build(endpoint, side, &s).await.unwrap();
            assert_eq!(connector.tag(), endpoint, "{endpoint} on {side}");
        }
    }

    #[tokio::test]
    async fn missing_tls_material_is_a_build_error() {
        let mut s = settings("tls/server:127.0.0.1:54321", "udp/broadcast:127.0.0.1:60000");
        s.ca_cert = PathBuf::from("/nonexistent/ca.cert");
        s.cert = Some(PathBuf::from("/nonexistent/server.cert"));
        s.key = Some(PathBuf::from("/nonexistent/server.key"));

        let err = build("tls/server:127.0.0.1:54321", Side::In, &s).await.err().unwrap();
        assert!(matches!(err, BuildError::Tls(_)), "{err}");
        let err = build("tls/client:localhost:54321", Side::Out, &s).await.err().unwrap();
        assert!(matches!(err, BuildError::Tls(_)), "{err}");
    }

    #[tokio::test]
    async fn tunnel_rejects_connector_on_wrong_side() {
        let s = settings("udp/broadcast:127.0.0.1:60000", "udp/listen:127.0.0.1:60000");
        let err = build_tunnel(&s).await.unwrap_err();
        assert!(matches!(err, BuildError::Endpoint(EndpointError::WrongSide { .. })), "{err}");
    }

    #[tokio::test]
    async fn tunnel_rejects_listen_without_port() {
        let s = settings("udp/listen:0.0.0.0:0", "tcp/client:127.0.0.1:54321");
        let err = build_tunnel(&s).await.unwrap_err();
        assert!(matches!(err, BuildError::Endpoint(EndpointError::Address { .. })), "{err}");
    }

    #[tokio::test]
    async fn tunnel_builds_from_valid_settings() {
        let s = settings("udp/listen:127.0.0.1:60000", "tcp/client:127.0.0.1:54321");
        let tunnel = build_tunnel(&s).await.unwrap();
        let debug = format!("{tunnel:?}");
        assert!(debug.contains("udp/listen:127.0.0.1:60000"));
        assert!(debug.contains("tcp/client:127.0.0.1:54321"));
    }
}
