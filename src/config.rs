//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `WSRELAY_LISTEN`, `WSRELAY_AGENT_NAME`,
//!    `WSRELAY_TARGETS` (comma separated)
//! 2. **Config file**: path via `--config <path>`, or `wsrelay.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [gateway]
//! listen = "127.0.0.1:8080"
//! register_path = "/register"
//! destination = "url"           # or "header" (X-PROXY-DESTINATION)
//! default_pool_size = 10        # used when the greeting carries no size
//! max_pool_size = 100
//! dispatch_deadline_ms = 1000
//! retry_interval_ms = 10
//! frame_timeout_secs = 60
//!
//! [agent]
//! name = "edge-01"              # random UUID when unset
//! targets = ["ws://127.0.0.1:8080/register"]
//! pool_idle_size = 10
//! pool_max_size = 100
//! ping_interval_secs = 30
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default config file looked up in the working directory.
const DEFAULT_CONFIG_FILE: &str = "wsrelay.toml";

/// Errors raised while loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the agent finds the URL it must call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationMode {
    /// The record's own `URL` field.
    #[default]
    Url,
    /// The reserved `X-PROXY-DESTINATION` header.
    Header,
}

/// Gateway (inbound-facing) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Socket address to bind (default `127.0.0.1:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Path agents upgrade on to register tunnel connections (default `/register`).
    #[serde(default = "default_register_path")]
    pub register_path: String,
    /// How the destination URL travels to the agent (default `url`).
    #[serde(default)]
    pub destination: DestinationMode,
    /// Pool capacity when an agent greets with its bare name (default 10).
    #[serde(default = "default_pool_size")]
    pub default_pool_size: usize,
    /// Upper bound on any capacity announced in a greeting (default 100).
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    /// Time budget for acquiring a tunnel connection per request (default 1000 ms).
    #[serde(default = "default_dispatch_deadline_ms")]
    pub dispatch_deadline_ms: u64,
    /// Pause between unsuccessful acquisition attempts (default 10 ms).
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Bound on each frame write and each awaited response frame (default 60 s).
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_secs: u64,
    /// Seconds a fresh registration may take to send its greeting (default 10).
    #[serde(default = "default_greeting_timeout")]
    pub greeting_timeout_secs: u64,
    /// Seconds between sweeps of closed connections and empty pools (default 30).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Maximum request body tunneled in one frame (default 10 MB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Maximum in-flight client requests (default 1024).
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

/// Agent (outbound-dialing) settings. Immutable after startup.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Identity announced in the greeting. Override with `WSRELAY_AGENT_NAME`.
    #[serde(default = "default_agent_name")]
    pub name: String,
    /// Gateway registration URLs to dial. Override with `WSRELAY_TARGETS`.
    #[serde(default = "default_targets")]
    pub targets: Vec<String>,
    /// Idle connections kept open per target (default 10).
    #[serde(default = "default_pool_size")]
    pub pool_idle_size: usize,
    /// Hard cap on connections per target (default 100).
    #[serde(default = "default_max_pool_size")]
    pub pool_max_size: usize,
    /// Period of the pool maintenance loop (default 1000 ms).
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
    /// Initial backoff for the first connection to a target (default 1 s).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Max backoff for the first connection to a target (default 30 s).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Seconds between WebSocket pings on each connection (default 30).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Bound on each frame write and each awaited body frame (default 60 s).
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_secs: u64,
    /// How the destination URL is read from incoming requests (default `url`).
    #[serde(default)]
    pub destination: DestinationMode,
    /// Maximum origin response body tunneled in one frame (default 10 MB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_register_path() -> String {
    "/register".to_string()
}
fn default_pool_size() -> usize {
    10
}
fn default_max_pool_size() -> usize {
    100
}
fn default_dispatch_deadline_ms() -> u64 {
    1000
}
fn default_retry_interval_ms() -> u64 {
    10
}
fn default_frame_timeout() -> u64 {
    60
}
fn default_greeting_timeout() -> u64 {
    10
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024 // 10 MB
}
fn default_max_concurrent_requests() -> usize {
    1024
}
fn default_agent_name() -> String {
    uuid::Uuid::new_v4().to_string()
}
fn default_targets() -> Vec<String> {
    vec!["ws://127.0.0.1:8080/register".to_string()]
}
fn default_maintenance_interval_ms() -> u64 {
    1000
}
fn default_reconnect_delay() -> u64 {
    1
}
fn default_reconnect_max_delay() -> u64 {
    30
}
fn default_ping_interval() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            register_path: default_register_path(),
            destination: DestinationMode::default(),
            default_pool_size: default_pool_size(),
            max_pool_size: default_max_pool_size(),
            dispatch_deadline_ms: default_dispatch_deadline_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            frame_timeout_secs: default_frame_timeout(),
            greeting_timeout_secs: default_greeting_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            max_body_bytes: default_max_body_bytes(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            targets: default_targets(),
            pool_idle_size: default_pool_size(),
            pool_max_size: default_max_pool_size(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            ping_interval_secs: default_ping_interval(),
            frame_timeout_secs: default_frame_timeout(),
            destination: DestinationMode::default(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl GatewayConfig {
    pub fn dispatch_deadline(&self) -> Duration {
        Duration::from_millis(self.dispatch_deadline_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs(self.frame_timeout_secs)
    }

    pub fn greeting_timeout(&self) -> Duration {
        Duration::from_secs(self.greeting_timeout_secs)
    }
}

impl AgentConfig {
    /// The greeting sent as the first message of every tunnel connection.
    pub fn greeting(&self) -> String {
        crate::record::Greeting::new(&self.name, self.pool_idle_size).to_string()
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs(self.frame_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for `wsrelay.toml`
    /// in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Config::default(),
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("WSRELAY_LISTEN") {
            config.gateway.listen = listen;
        }
        if let Ok(name) = std::env::var("WSRELAY_AGENT_NAME") {
            config.agent.name = name;
        }
        if let Ok(targets) = std::env::var("WSRELAY_TARGETS") {
            config.agent.targets = parse_targets(&targets);
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}

fn parse_targets(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::default();
        assert_eq!(config.gateway.listen, "127.0.0.1:8080");
        assert_eq!(config.gateway.register_path, "/register");
        assert_eq!(config.gateway.dispatch_deadline(), Duration::from_secs(1));
        assert_eq!(config.gateway.retry_interval(), Duration::from_millis(10));
        assert_eq!(config.agent.pool_idle_size, 10);
        assert_eq!(config.agent.pool_max_size, 100);
        assert!(!config.agent.name.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [gateway]
            listen = "0.0.0.0:9000"
            destination = "header"

            [agent]
            name = "edge-01"
            targets = ["ws://a/register", "ws://b/register"]
            pool_idle_size = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.listen, "0.0.0.0:9000");
        assert_eq!(config.gateway.destination, DestinationMode::Header);
        assert_eq!(config.gateway.default_pool_size, 10);
        assert_eq!(config.agent.name, "edge-01");
        assert_eq!(config.agent.targets.len(), 2);
        assert_eq!(config.agent.pool_idle_size, 3);
        assert_eq!(config.agent.destination, DestinationMode::Url);
        assert_eq!(config.agent.greeting(), "edge-01_3");
    }

    #[test]
    fn test_unknown_destination_mode_rejected() {
        let parsed: Result<Config, _> = toml::from_str("[gateway]\ndestination = \"cookie\"\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_parse_targets_env_list() {
        assert_eq!(
            parse_targets(" ws://a/register, ,ws://b/register "),
            vec!["ws://a/register", "ws://b/register"]
        );
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = Config::load(Some("/nonexistent/wsrelay.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
