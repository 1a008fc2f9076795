//! Configuration loading and types for the gateway.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: the listener, logging, the credential store, backend calls
//! and metrics.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Platform credential store settings.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Backend gateway settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Region incoming signatures must be scoped to.
    #[serde(default = "default_region")]
    pub region: String,

    /// Domain for virtual-host bucket addressing (`{bucket}.{endpoint}`).
    /// Empty disables it.
    #[serde(default)]
    pub endpoint: String,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Maximum request body in bytes (default 5 GiB).
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            region: default_region(),
            endpoint: String::new(),
            shutdown_timeout: default_shutdown_timeout(),
            max_object_size: default_max_object_size(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Credential store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_credentials_path")]
    pub path: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            path: default_credentials_path(),
        }
    }
}

/// Backend call configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Deadline for one backend call, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Verbose adapter logging.
    #[serde(default)]
    pub debug: bool,

    /// COS service endpoint used for ListBuckets.
    #[serde(default = "default_cos_service_url")]
    pub cos_service_url: String,

    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    #[serde(default)]
    pub s3_endpoint: Option<String>,
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            debug: false,
            cos_service_url: default_cos_service_url(),
            s3_endpoint: None,
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9091
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_object_size() -> u64 {
    5_368_709_120 // 5 GiB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_credentials_path() -> String {
    "./data/s3adapter.db".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

fn default_cos_service_url() -> String {
    "http://service.cos.myqcloud.com".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}
