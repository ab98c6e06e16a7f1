use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

/// How the engine treats paths that are not explicitly mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GatewayMode {
    /// Only explicitly mounted handlers are served; `serve` answers `not_found`.
    #[default]
    Whitelist,
    /// Every path is routed through the route table.
    ProxyAll,
}

impl std::str::FromStr for GatewayMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "whitelist" | "" => Ok(GatewayMode::Whitelist),
            "proxy_all" | "proxy-all" => Ok(GatewayMode::ProxyAll),
            other => Err(GatewayError::Config(format!(
                "Invalid gateway mode: {}. Must be one of: whitelist, proxy_all",
                other
            ))),
        }
    }
}

impl std::fmt::Display for GatewayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayMode::Whitelist => write!(f, "whitelist"),
            GatewayMode::ProxyAll => write!(f, "proxy_all"),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8088))
}

fn default_upstream_timeout() -> u64 {
    10
}

fn default_upstream_retries() -> u32 {
    1
}

fn default_health_interval() -> u64 {
    10
}

fn default_circuit_window() -> u64 {
    30
}

fn default_circuit_threshold() -> f64 {
    0.5
}

fn default_circuit_cooldown() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    32
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default)]
    pub mode: GatewayMode,
    /// YAML routing document; required in `proxy_all` mode.
    #[serde(default)]
    pub routes_file: Option<PathBuf>,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,
    #[serde(default = "default_upstream_retries")]
    pub upstream_retries: u32,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default = "default_circuit_window")]
    pub circuit_window_secs: u64,
    #[serde(default = "default_circuit_threshold")]
    pub circuit_threshold: f64,
    #[serde(default = "default_circuit_cooldown")]
    pub circuit_cooldown_secs: u64,
    // Upstream connection pool
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Largest request body buffered for forwarding.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            mode: GatewayMode::Whitelist,
            routes_file: None,
            upstream_timeout_secs: default_upstream_timeout(),
            upstream_retries: default_upstream_retries(),
            health_interval_secs: default_health_interval(),
            jwt_secret: None,
            circuit_window_secs: default_circuit_window(),
            circuit_threshold: default_circuit_threshold(),
            circuit_cooldown_secs: default_circuit_cooldown(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_body_bytes: default_max_body_bytes(),
            private_key: None,
            certificate: None,
            logging: None,
        }
    }
}

impl GatewayConfig {
    pub fn from_file(path: &str) -> Result<Self, GatewayError> {
        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), GatewayError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn circuit_window(&self) -> Duration {
        Duration::from_secs(self.circuit_window_secs)
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_secs)
    }

    pub fn jwt_secret(&self) -> Option<&str> {
        self.jwt_secret.as_deref().filter(|s| !s.is_empty())
    }
}
