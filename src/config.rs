// src/config.rs

//! Manages server configuration: loading from TOML, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9100
}

/// The main configuration structure for the server binary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Optional local-domain socket to listen on in addition to TCP.
    #[serde(default)]
    pub unix_socket: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Size of the buffer used for each read from a connection.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,
    /// Readiness events fetched per wait.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Upper bound for writing one response on a congested socket.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Reactor faults within `fault_window_ms` before the fault is escalated.
    #[serde(default = "default_fault_escalation_threshold")]
    pub fault_escalation_threshold: u64,
    #[serde(default = "default_fault_window_ms")]
    pub fault_window_ms: u64,
    /// Largest PARAMS stream one request may send.
    #[serde(default = "default_max_params_bytes")]
    pub max_params_bytes: usize,
    /// Largest request body buffered from STDIN.
    #[serde(default = "default_max_stdin_bytes")]
    pub max_stdin_bytes: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_read_buffer_size() -> usize {
    8192
}
fn default_listen_backlog() -> i32 {
    500
}
fn default_max_events() -> usize {
    1024
}
fn default_write_timeout_ms() -> u64 {
    30_000
}
fn default_fault_escalation_threshold() -> u64 {
    16
}
fn default_fault_window_ms() -> u64 {
    60_000
}
fn default_max_params_bytes() -> usize {
    1024 * 1024
}
fn default_max_stdin_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_max_connections() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            unix_socket: None,
            log_level: default_log_level(),
            read_buffer_size: default_read_buffer_size(),
            listen_backlog: default_listen_backlog(),
            max_events: default_max_events(),
            write_timeout_ms: default_write_timeout_ms(),
            fault_escalation_threshold: default_fault_escalation_threshold(),
            fault_window_ms: default_fault_window_ms(),
            max_params_bytes: default_max_params_bytes(),
            max_stdin_bytes: default_max_stdin_bytes(),
            max_connections: default_max_connections(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Loads and validates the configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Invalid configuration in '{path}'"))?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 && self.unix_socket.is_none() {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.read_buffer_size < 8 {
            return Err(anyhow!(
                "read_buffer_size must hold at least one record header (8 bytes)"
            ));
        }
        if self.listen_backlog <= 0 {
            return Err(anyhow!("listen_backlog must be greater than 0"));
        }
        if self.max_events == 0 {
            return Err(anyhow!("max_events cannot be 0"));
        }
        if self.fault_escalation_threshold == 0 {
            return Err(anyhow!("fault_escalation_threshold cannot be 0"));
        }
        if self.fault_window_ms == 0 {
            return Err(anyhow!("fault_window_ms cannot be 0"));
        }
        if self.max_params_bytes == 0 || self.max_stdin_bytes == 0 {
            return Err(anyhow!("max_params_bytes and max_stdin_bytes cannot be 0"));
        }
        if self.max_connections == 0 {
            return Err(anyhow!("max_connections cannot be 0"));
        }
        if self.metrics.enabled && self.metrics.port == self.port {
            return Err(anyhow!("metrics.port must differ from port"));
        }
        if self.write_timeout_ms == 0 {
            warn!("write_timeout_ms is 0: responses to congested connections fail immediately.");
        }
        Ok(())
    }
}

/// The settings the server core consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub read_buffer_size: usize,
    pub listen_backlog: i32,
    pub max_events: usize,
    pub write_timeout: Duration,
    pub fault_escalation_threshold: u64,
    pub fault_window: Duration,
    pub max_connections: usize,
    pub max_params_bytes: usize,
    pub max_stdin_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions::from(&Config::default())
    }
}

impl From<&Config> for ServerOptions {
    fn from(config: &Config) -> Self {
        Self {
            read_buffer_size: config.read_buffer_size,
            listen_backlog: config.listen_backlog,
            max_events: config.max_events,
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            fault_escalation_threshold: config.fault_escalation_threshold,
            fault_window: Duration::from_millis(config.fault_window_ms),
            max_connections: config.max_connections,
            max_params_bytes: config.max_params_bytes,
            max_stdin_bytes: config.max_stdin_bytes,
        }
    }
}
