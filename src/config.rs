//! Configuration management for the NetBackup exporter.
//!
//! Supports loading configuration from:
//! - TOML configuration files
//! - Environment variables (with `NBU_EXPORTER__` prefix, `__` as separator)
//! - Command-line arguments

use crate::error::{NbuError, Result};
use crate::retry::RetryPolicy;
use crate::version::SUPPORTED_API_VERSIONS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Largest page size the jobs endpoint accepts.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// NetBackup primary server connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct NbuConfig {
    /// URL scheme, `http` or `https`
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Primary server host name
    pub host: String,

    /// API port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path prefix of the REST API
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// API key sent in the Authorization header
    #[serde(default)]
    pub api_key: String,

    /// Pin the API version instead of negotiating it (e.g. "13.0")
    #[serde(default)]
    pub api_version: Option<String>,

    /// Verify TLS certificates (set to false for self-signed certs)
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Only jobs that ended within this many seconds are collected
    #[serde(default = "default_scrape_window")]
    pub scrape_window_seconds: u64,

    /// How long a storage snapshot is reused, in seconds (0 = default)
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,

    /// Jobs requested per page
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,

    /// Hard budget for one collection cycle, in seconds
    #[serde(default = "default_collect_timeout")]
    pub collect_timeout_seconds: u64,

    /// How long close() waits for in-flight requests, in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,

    /// Idle pooled connections kept per host
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle pooled connections are closed after this many seconds
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_seconds: u64,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl std::fmt::Debug for NbuConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NbuConfig")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("base_path", &self.base_path)
            .field("api_key", &"***REDACTED***")
            .field("api_version", &self.api_version)
            .field("verify_tls", &self.verify_tls)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("scrape_window_seconds", &self.scrape_window_seconds)
            .field("cache_ttl_seconds", &self.cache_ttl_seconds)
            .field("page_limit", &self.page_limit)
            .field("collect_timeout_seconds", &self.collect_timeout_seconds)
            .field("shutdown_timeout_seconds", &self.shutdown_timeout_seconds)
            .field("pool_max_idle_per_host", &self.pool_max_idle_per_host)
            .field("pool_idle_timeout_seconds", &self.pool_idle_timeout_seconds)
            .field("retry", &self.retry)
            .finish()
    }
}

impl NbuConfig {
    /// Minimal configuration for `host` with every other field at its default.
    pub fn new(host: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            scheme: default_scheme(),
            host: host.into(),
            port: default_port(),
            base_path: default_base_path(),
            api_key: api_key.into(),
            api_version: None,
            verify_tls: default_verify_tls(),
            timeout_seconds: default_timeout(),
            scrape_window_seconds: default_scrape_window(),
            cache_ttl_seconds: default_cache_ttl(),
            page_limit: default_page_limit(),
            collect_timeout_seconds: default_collect_timeout(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_seconds: default_pool_idle_timeout(),
            retry: RetryPolicy::default(),
        }
    }

    /// Base URL of the REST API, e.g. `https://nbu.example.com:1556/netbackup`.
    pub fn base_url(&self) -> String {
        let path = self.base_path.trim_end_matches('/');
        let path = if path.is_empty() || path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, path)
    }

    pub fn scrape_window(&self) -> Duration {
        Duration::from_secs(self.scrape_window_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn collect_timeout(&self) -> Duration {
        Duration::from_secs(self.collect_timeout_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    /// Validate connection settings.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(config_error("NetBackup host cannot be empty"));
        }

        if self.api_key.is_empty() {
            return Err(config_error("NetBackup API key is required"));
        }

        if self.scheme != "http" && self.scheme != "https" {
            return Err(config_error(format!(
                "unsupported scheme {:?}, expected http or https",
                self.scheme
            )));
        }

        if self.page_limit == 0 || self.page_limit > MAX_PAGE_LIMIT {
            return Err(config_error(format!(
                "page_limit must be between 1 and {}",
                MAX_PAGE_LIMIT
            )));
        }

        if let Some(version) = &self.api_version {
            if !SUPPORTED_API_VERSIONS.contains(&version.as_str()) {
                return Err(config_error(format!(
                    "api_version {} is not supported (supported: {})",
                    version,
                    SUPPORTED_API_VERSIONS.join(", ")
                )));
            }
        }

        Ok(())
    }
}

/// Exporter specific settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExporterConfig {
    /// Address to listen on for metrics endpoint
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (text, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Main configuration structure for the NetBackup exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// NetBackup server configuration
    pub nbu: NbuConfig,

    /// Exporter server configuration
    #[serde(default)]
    pub exporter: ExporterConfig,
}

fn config_error(message: impl Into<String>) -> NbuError {
    NbuError::Config(config::ConfigError::Message(message.into()))
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_port() -> u16 {
    1556
}

fn default_base_path() -> String {
    "/netbackup".to_string()
}

fn default_verify_tls() -> bool {
    false
}

fn default_timeout() -> u64 {
    30
}

fn default_scrape_window() -> u64 {
    3600
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_page_limit() -> u32 {
    MAX_PAGE_LIMIT
}

fn default_collect_timeout() -> u64 {
    120
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_listen_address() -> String {
    "0.0.0.0:2112".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Settings {
    /// Load configuration from a file and environment variables.
    ///
    /// # Arguments
    ///
    /// * `config_path` - Optional path to configuration file
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use nbu_exporter::config::Settings;
    ///
    /// let settings = Settings::load(Some("config/default.toml")).unwrap();
    /// ```
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(config::File::with_name(path));
            }
        }

        // NBU_EXPORTER__NBU__HOST, NBU_EXPORTER__EXPORTER__LOG_LEVEL, ...
        builder = builder.add_source(
            config::Environment::with_prefix("NBU_EXPORTER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let settings: Settings = config.try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration settings.
    fn validate(&self) -> Result<()> {
        self.nbu.validate()?;

        if self.exporter.log_format != "text" && self.exporter.log_format != "json" {
            return Err(config_error(format!(
                "unsupported log_format {:?}, expected text or json",
                self.exporter.log_format
            )));
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            nbu: NbuConfig::new("localhost", ""),
            exporter: ExporterConfig::default(),
        }
    }
}
