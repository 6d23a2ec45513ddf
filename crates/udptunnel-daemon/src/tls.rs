//! TLS material loading for the stream connectors.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::{CryptoProvider, ring};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::info;

/// Default server certificate file.
pub const DEFAULT_SERVER_CERT: &str = "server.cert";
/// Default server key file.
pub const DEFAULT_SERVER_KEY: &str = "server.key";
/// Default client certificate file.
pub const DEFAULT_CLIENT_CERT: &str = "client.cert";
/// Default client key file.
pub const DEFAULT_CLIENT_KEY: &str = "client.key";

/// TLS configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("File read error: {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("No private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("Invalid server name '{0}'")]
    ServerName(String),

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Client verifier error: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

fn open(path: &Path) -> Result<BufReader<File>, TlsConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })
}

/// Read every PEM certificate in `path`.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsConfigError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Read the first PEM private key in `path`.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| TlsConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsConfigError::NoPrivateKey(path.to_path_buf()))
}

fn root_store(ca: &Path) -> Result<RootCertStore, TlsConfigError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Server configuration. With `client_auth`, clients must present a
/// certificate signed by `ca`.
pub fn server_config(
    ca: &Path,
    cert: &Path,
    key: &Path,
    client_auth: bool,
) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let certs = load_certs(cert)?;
    let key_der = load_private_key(key)?;
    let builder = ServerConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;

    let config = if client_auth {
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(ca)?), provider()).build()?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    }
    .with_single_cert(certs, key_der)?;

    info!(cert = %cert.display(), client_auth, "TLS server configured");
    Ok(Arc::new(config))
}

/// Client configuration trusting `ca`, presenting `identity` when given.
pub fn client_config(
    ca: &Path,
    identity: Option<(&Path, &Path)>,
) -> Result<Arc<ClientConfig>, TlsConfigError> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_store(ca)?);

    let config = match identity {
        Some((cert, key)) => {
            let config = builder.with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)?;
            info!(cert = %cert.display(), "TLS client configured with client certificate");
            config
        }
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Server name to verify for a `host` taken from a client address.
pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsConfigError> {
    ServerName::try_from(host.to_string()).map_err(|_| TlsConfigError::ServerName(host.to_string()))
}
