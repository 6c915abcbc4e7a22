use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::pool::{normalize_host, TCP_PORT};

/// Login used to answer a host's credential challenge
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub passphrase: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            passphrase: passphrase.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

/// Keepalive settings applied to every (re)connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Seconds between keepalive probes (0 disables keepalive)
    #[serde(default = "default_keepalive_interval")]
    pub interval: u64,

    /// Unanswered probes tolerated before the link is declared dead
    #[serde(default = "default_keepalive_count")]
    pub count: u32,
}

fn default_keepalive_interval() -> u64 {
    5
}

fn default_keepalive_count() -> u32 {
    5
}

impl KeepaliveConfig {
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: default_keepalive_interval(),
            count: default_keepalive_count(),
        }
    }
}

/// Host reachability probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Management port probed when the host names none
    #[serde(default = "default_probe_port")]
    pub port: u16,

    /// Probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub timeout: u64,
}

fn default_probe_port() -> u16 {
    TCP_PORT
}

fn default_probe_timeout() -> u64 {
    5
}

impl ProbeConfig {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            port: default_probe_port(),
            timeout: default_probe_timeout(),
        }
    }
}

/// TCP transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Length of one event dispatch step in milliseconds
    #[serde(default = "default_event_tick_ms")]
    pub event_tick_ms: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_event_tick_ms() -> u64 {
    200
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            event_tick_ms: default_event_tick_ms(),
        }
    }
}

/// Credentials offered when a host rejects an unauthenticated open
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Used for every host without its own entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Credentials>,

    /// Per-host credentials, keyed by host name
    #[serde(default)]
    pub hosts: HashMap<String, Credentials>,
}

impl CredentialsConfig {
    /// Credentials for `host`, falling back to the default entry
    pub fn for_host(&self, host: &str) -> Option<&Credentials> {
        let host = normalize_host(host);
        self.hosts
            .iter()
            .find(|(name, _)| normalize_host(name) == host)
            .map(|(_, creds)| creds)
            .or(self.default.as_ref())
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub credentials: CredentialsConfig,
}

impl Config {
    /// Reject settings the pool cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.probe.timeout == 0 {
            anyhow::bail!("probe.timeout must be greater than zero");
        }
        if self.transport.event_tick_ms == 0 {
            anyhow::bail!("transport.event_tick_ms must be greater than zero");
        }
        if self.transport.connect_timeout == 0 {
            anyhow::bail!("transport.connect_timeout must be greater than zero");
        }
        Ok(())
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// Every variable is optional; unset or unparsable values keep the default.
/// - VIRTPOOL_KEEPALIVE_INTERVAL / LIBVIRT_KEEPALIVE_INTERVAL
/// - VIRTPOOL_KEEPALIVE_COUNT / LIBVIRT_KEEPALIVE_COUNT
/// - VIRTPOOL_PROBE_TIMEOUT
/// - VIRTPOOL_CONNECT_TIMEOUT
/// - VIRTPOOL_USERNAME and VIRTPOOL_PASSPHRASE (default credentials)
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::default();

    if let Some(interval) = env_parse("VIRTPOOL_KEEPALIVE_INTERVAL")
        .or_else(|| env_parse("LIBVIRT_KEEPALIVE_INTERVAL"))
    {
        config.keepalive.interval = interval;
    }

    if let Some(count) = env_parse("VIRTPOOL_KEEPALIVE_COUNT")
        .or_else(|| env_parse("LIBVIRT_KEEPALIVE_COUNT"))
    {
        config.keepalive.count = count;
    }

    if let Some(timeout) = env_parse("VIRTPOOL_PROBE_TIMEOUT") {
        config.probe.timeout = timeout;
    }

    if let Some(timeout) = env_parse("VIRTPOOL_CONNECT_TIMEOUT") {
        config.transport.connect_timeout = timeout;
    }

    if let (Ok(username), Ok(passphrase)) = (
        std::env::var("VIRTPOOL_USERNAME"),
        std::env::var("VIRTPOOL_PASSPHRASE"),
    ) {
        config.credentials.default = Some(Credentials::new(username, passphrase));
    }

    Ok(config)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

/// Load configuration from a YAML file when given, otherwise from the environment
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    let config = match config_path {
        Some(path) => load_from_yaml(path)?,
        None => load_from_env()?,
    };

    config.validate().context("Invalid configuration")?;
    Ok(config)
}
