//! udptunnel
//!
//! Relays UDP request/reply traffic between two connectors, e.g. a local UDP
//! portal and a TLS link to a remote udptunnel.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use udptunnel_core::config::{load_settings, split_config_arg};
use udptunnel_core::tracing_init::init_tracing;
use udptunnel_core::{Settings, TunnelSettings};
use udptunnel_daemon::factory::build_tunnel;

#[derive(Parser, Debug)]
#[command(name = "udptunnel")]
#[command(version, about = "udptunnel - relays UDP requests over TCP, TLS and HTTP")]
struct Args {
    /// TOML configuration file, optionally with a section: `tunnel.toml#lab`
    #[arg(long, env = "UDPTUNNEL_CONFIG")]
    config: Option<String>,

    /// In-side connector, e.g. `udp/listen:0.0.0.0:60000`
    #[arg(long = "in", env = "UDPTUNNEL_IN")]
    inside: Option<String>,

    /// Out-side connector, e.g. `tls/client:relay.example.com:54321`
    #[arg(long = "out", env = "UDPTUNNEL_OUT")]
    outside: Option<String>,

    /// Retry limit for binding and connecting (-1 = unlimited) [default: -1]
    #[arg(long, allow_negative_numbers = true)]
    max_retries: Option<i64>,

    /// Upper bound on the retry delay [default: 5m]
    #[arg(long)]
    max_retry_delay: Option<String>,

    /// How long to wait for UDP replies [default: 5s]
    #[arg(long)]
    udp_timeout: Option<String>,

    /// CA certificate (PEM) [default: ca.cert]
    #[arg(long, env = "UDPTUNNEL_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Certificate (PEM) presented by TLS connectors
    #[arg(long, env = "UDPTUNNEL_CERT")]
    cert: Option<PathBuf>,

    /// Private key (PEM) for `--cert`
    #[arg(long, env = "UDPTUNNEL_KEY")]
    key: Option<PathBuf>,

    /// Require TLS clients to present a certificate signed by the CA
    #[arg(long)]
    client_auth: bool,

    /// Inbound messages per second (0 disables rate limiting) [default: 1]
    #[arg(long)]
    rate_limit: Option<f64>,

    /// Inbound message burst size [default: 120]
    #[arg(long)]
    burst_limit: Option<u32>,

    /// Idle time after which an unanswered request is forgotten [default: 15s]
    #[arg(long)]
    idle_timeout: Option<String>,

    /// Log level filter (e.g. "info", "debug", "warn") [default: info]
    #[arg(long, env = "UDPTUNNEL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Shorthand for `--log-level debug`
    #[arg(long)]
    debug: bool,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "UDPTUNNEL_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// The command line layer of the settings. Flags that were not given stay
    /// unset so file values show through.
    fn overlay(&self) -> TunnelSettings {
        TunnelSettings {
            inside: self.inside.clone(),
            outside: self.outside.clone(),
            max_retries: self.max_retries,
            max_retry_delay: self.max_retry_delay.clone(),
            udp_timeout: self.udp_timeout.clone(),
            ca_cert: self.ca_cert.clone(),
            cert: self.cert.clone(),
            key: self.key.clone(),
            client_auth: self.client_auth.then_some(true),
            rate_limit: self.rate_limit,
            burst_limit: self.burst_limit,
            idle_timeout: self.idle_timeout.clone(),
            log_level: if self.debug {
                Some("debug".to_string())
            } else {
                self.log_level.clone()
            },
        }
    }

    fn settings(&self) -> anyhow::Result<Settings> {
        let file = match &self.config {
            Some(arg) => {
                let (path, section) = split_config_arg(arg);
                load_settings(Path::new(path), section)?
            }
            None => TunnelSettings::default(),
        };
        Ok(Settings::try_from(file.merge(self.overlay()))?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = args.settings().context("Invalid configuration")?;

    init_tracing(&settings.log_level, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        inside = %settings.inside,
        outside = %settings.outside,
        "Starting udptunnel"
    );

    let tunnel = build_tunnel(&settings).await.context("Invalid configuration")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    if let Err(e) = tunnel.run(shutdown).await {
        error!(error = %e, "udptunnel stopped");
        return Err(e.into());
    }

    info!("udptunnel stopped");
    Ok(())
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                None
            }
        };

    #[cfg(unix)]
    let sigterm_future = async {
        match sigterm.as_mut() {
            Some(signal) => signal.recv().await,
            None => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }
    shutdown.cancel();
}
