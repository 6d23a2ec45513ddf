//! Tracing subscriber initialisation for the udptunnel binary.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the filter for a configured log level.
///
/// `RUST_LOG` wins when set. Otherwise `level` applies to the udptunnel
/// crates and everything else is held at `warn`.
pub fn env_filter(level: &str) -> EnvFilter {
    std::env::var("RUST_LOG").map_or_else(
        |_| EnvFilter::new(format!("warn,udptunnel_core={level},udptunnel_daemon={level},udptunnel={level}")),
        EnvFilter::new,
    )
}

/// Initialise the global tracing subscriber.
///
/// * `level` -- log level for the udptunnel crates when `RUST_LOG` is not set.
/// * `log_json` -- emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(level: &str, log_json: bool) {
    let env_filter = env_filter(level);
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
