// src/config.rs

//! Client configuration: loading from TOML, defaults, and validation.

use crate::core::protocol::DEFAULT_MAX_FRAME_SIZE;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// What a call does when it is issued while the connection is being
/// (re)established.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReconnectingPolicy {
    /// Wait for the connection to come up, bounded by the call's own deadline.
    #[default]
    Queue,
    /// Fail immediately with `NotConnected`.
    FailFast,
}

/// Automatic reconnection with capped exponential backoff.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_enabled")]
    pub enabled: bool,
    /// Delay before the first reconnection attempt.
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,
    /// Upper bound of the exponential backoff.
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
    /// Random extra delay added to each attempt, up to this value.
    #[serde(with = "humantime_serde", default = "default_jitter")]
    pub jitter: Duration,
}

fn default_reconnect_enabled() -> bool {
    true
}
fn default_initial_delay() -> Duration {
    Duration::from_millis(100)
}
fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}
fn default_jitter() -> Duration {
    Duration::from_millis(50)
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconnect_enabled(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

impl ReconnectConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// The validated client configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Authenticate as this user after the greeting. No auth when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Bound on one physical connect attempt including the handshake.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Default per-request timeout. Requests without an explicit timeout
    /// never time out when this is absent.
    #[serde(with = "humantime_serde", default)]
    pub request_timeout: Option<Duration>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub on_reconnecting: ReconnectingPolicy,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Period of the background timeout sweep.
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3301
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: None,
            password: None,
            connect_timeout: default_connect_timeout(),
            request_timeout: None,
            reconnect: ReconnectConfig::default(),
            on_reconnecting: ReconnectingPolicy::default(),
            max_frame_size: default_max_frame_size(),
            sweep_interval: default_sweep_interval(),
            log_level: default_log_level(),
        }
    }
}

impl ClientConfig {
    /// A default configuration pointing at `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Reads and validates a TOML configuration file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config in '{path}'"))
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: ClientConfig =
            toml::from_str(contents).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// The `host:port` string used to open the transport.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validates the configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(anyhow!("password is set but username is missing"));
        }
        if self.reconnect.initial_delay > self.reconnect.max_delay {
            return Err(anyhow!(
                "reconnect.initial_delay ({:?}) exceeds reconnect.max_delay ({:?})",
                self.reconnect.initial_delay,
                self.reconnect.max_delay
            ));
        }
        if self.max_frame_size < 64 {
            return Err(anyhow!("max_frame_size must be at least 64 bytes"));
        }
        if self.sweep_interval.is_zero() {
            return Err(anyhow!("sweep_interval cannot be 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("connect_timeout cannot be 0"));
        }
        Ok(())
    }
}
