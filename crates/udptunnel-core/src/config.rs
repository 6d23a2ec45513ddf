//! Tunnel configuration.
//!
//! Settings are resolved in layers, lowest priority first:
//! 1. Built-in defaults
//! 2. The `[defaults]` table of the TOML configuration file
//! 3. The tunnel's own section of that file (`--config tunnel.toml#section`)
//! 4. Command line arguments
//!
//! Layers 2 to 4 are [`TunnelSettings`] values where every field is optional;
//! [`Settings`] is the fully resolved result.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{BackoffPolicy, DEFAULT_MAX_RETRY_DELAY};
use crate::error::{Error, Result};
use crate::pending::{DEFAULT_IDLE_TIMEOUT, SWEEP_INTERVAL};
use crate::ratelimit::{DEFAULT_BURST, DEFAULT_RATE};
use crate::router::RouterConfig;

/// Default bound on waiting for UDP replies.
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default CA certificate file.
pub const DEFAULT_CA_CERT: &str = "ca.cert";

const DEFAULTS_SECTION: &str = "defaults";

/// One layer of tunnel settings. Keys match the command line flag names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TunnelSettings {
    #[serde(rename = "in")]
    pub inside: Option<String>,
    #[serde(rename = "out")]
    pub outside: Option<String>,
    pub max_retries: Option<i64>,
    pub max_retry_delay: Option<String>,
    pub udp_timeout: Option<String>,
    pub ca_cert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub client_auth: Option<bool>,
    pub rate_limit: Option<f64>,
    pub burst_limit: Option<u32>,
    pub idle_timeout: Option<String>,
    pub log_level: Option<String>,
}

impl TunnelSettings {
    /// Apply `overlay` on top of `self`; fields set in `overlay` win.
    #[must_use]
    pub fn merge(self, overlay: Self) -> Self {
        Self {
            inside: overlay.inside.or(self.inside),
            outside: overlay.outside.or(self.outside),
            max_retries: overlay.max_retries.or(self.max_retries),
            max_retry_delay: overlay.max_retry_delay.or(self.max_retry_delay),
            udp_timeout: overlay.udp_timeout.or(self.udp_timeout),
            ca_cert: overlay.ca_cert.or(self.ca_cert),
            cert: overlay.cert.or(self.cert),
            key: overlay.key.or(self.key),
            client_auth: overlay.client_auth.or(self.client_auth),
            rate_limit: overlay.rate_limit.or(self.rate_limit),
            burst_limit: overlay.burst_limit.or(self.burst_limit),
            idle_timeout: overlay.idle_timeout.or(self.idle_timeout),
            log_level: overlay.log_level.or(self.log_level),
        }
    }
}

/// Split a `--config` argument into file path and optional section.
///
/// Accepts `file`, `file#section` and `file::section`.
pub fn split_config_arg(arg: &str) -> (&str, Option<&str>) {
    let split = arg
        .find('#')
        .map(|i| (i, 1))
        .into_iter()
        .chain(arg.find("::").map(|i| (i, 2)))
        .min_by_key(|(i, _)| *i);

    match split {
        Some((i, sep)) => {
            let section = &arg[i + sep..];
            (&arg[..i], (!section.is_empty()).then_some(section))
        }
        None => (arg, None),
    }
}

/// Load settings from a TOML file, merging `[defaults]` with `section`.
pub fn load_settings(path: &Path, section: Option<&str>) -> Result<TunnelSettings> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    parse_settings(&content, section).map_err(|e| match e {
        Error::Toml(e) => Error::Config(format!("Failed to parse config file {}: {}", path.display(), e)),
        other => other,
    })
}

/// Parse settings from TOML text. See [`load_settings`].
pub fn parse_settings(content: &str, section: Option<&str>) -> Result<TunnelSettings> {
    let mut doc: toml::Table = toml::from_str(content)?;

    let mut merged = take_table(&mut doc, DEFAULTS_SECTION)?.unwrap_or_default();
    if let Some(name) = section {
        let table = take_table(&mut doc, name)?
            .ok_or_else(|| Error::Config(format!("No [{name}] section in config file")))?;
        merged.extend(table);
    }

    Ok(toml::Value::Table(merged).try_into()?)
}

fn take_table(doc: &mut toml::Table, name: &str) -> Result<Option<toml::Table>> {
    match doc.remove(name) {
        None => Ok(None),
        Some(toml::Value::Table(table)) => Ok(Some(table)),
        Some(_) => Err(Error::Config(format!("[{name}] is not a table"))),
    }
}

/// Parse a duration such as `250ms`, `5s`, `5m` or `1h`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| Error::Config(format!("Duration '{s}' has no unit")))?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| Error::Config(format!("Invalid duration '{s}'")))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => minutes(value, 1).ok_or_else(|| too_long(s)),
        "h" => minutes(value, 60).ok_or_else(|| too_long(s)),
        _ => Err(Error::Config(format!("Unknown duration unit in '{s}'"))),
    }
}

fn minutes(value: u64, per_unit: u64) -> Option<Duration> {
    value
        .checked_mul(per_unit)
        .and_then(|m| m.checked_mul(60))
        .map(Duration::from_secs)
}

fn too_long(s: &str) -> Error {
    Error::Config(format!("Duration '{s}' is too long"))
}

/// Fully resolved tunnel settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub inside: String,
    pub outside: String,
    pub max_retries: i64,
    pub max_retry_delay: Duration,
    pub udp_timeout: Duration,
    pub ca_cert: PathBuf,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub client_auth: bool,
    pub rate_limit: f64,
    pub burst_limit: u32,
    pub idle_timeout: Duration,
    pub log_level: String,
}

impl TryFrom<TunnelSettings> for Settings {
    type Error = Error;

    fn try_from(layer: TunnelSettings) -> Result<Self> {
        let inside = layer
            .inside
            .ok_or_else(|| Error::Config("Missing 'in' connector".into()))?;
        let outside = layer
            .outside
            .ok_or_else(|| Error::Config("Missing 'out' connector".into()))?;

        let duration = |value: Option<String>, default: Duration| {
            value.as_deref().map_or(Ok(default), parse_duration)
        };

        let rate_limit = layer.rate_limit.unwrap_or(DEFAULT_RATE);
        if !rate_limit.is_finite() || rate_limit < 0.0 {
            return Err(Error::Config(format!("Invalid rate limit {rate_limit}")));
        }

        let idle_timeout = duration(layer.idle_timeout, DEFAULT_IDLE_TIMEOUT)?;
        if idle_timeout.is_zero() {
            return Err(Error::Config("Idle timeout must be greater than zero".into()));
        }

        Ok(Self {
            inside,
            outside,
            max_retries: layer.max_retries.unwrap_or(-1),
            max_retry_delay: duration(layer.max_retry_delay, DEFAULT_MAX_RETRY_DELAY)?,
            udp_timeout: duration(layer.udp_timeout, DEFAULT_UDP_TIMEOUT)?,
            ca_cert: layer.ca_cert.unwrap_or_else(|| PathBuf::from(DEFAULT_CA_CERT)),
            cert: layer.cert,
            key: layer.key,
            client_auth: layer.client_auth.unwrap_or(false),
            rate_limit,
            burst_limit: layer.burst_limit.unwrap_or(DEFAULT_BURST),
            idle_timeout,
            log_level: layer.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }
}

impl Settings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::from_max_retries(self.max_retries, self.max_retry_delay)
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            idle_timeout: self.idle_timeout,
            sweep_interval: SWEEP_INTERVAL.min(self.idle_timeout),
            rate_limit: (self.rate_limit > 0.0).then_some((self.rate_limit, self.burst_limit)),
        }
    }
}
