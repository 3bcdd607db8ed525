//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub media: MediaConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public host of this node (e.g., "social.example.com")
    pub domain: String,
    /// Domain used in account handles, when it differs from `domain`
    /// (e.g. handles `@alice@example.com` served from `social.example.com`)
    #[serde(default)]
    pub account_domain: Option<String>,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// Account domain, falling back to the host
    pub fn account_domain(&self) -> &str {
        self.account_domain
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(&self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federation and dereferencing policy
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// A remote account fetched within this many seconds is fresh
    pub account_refresh_interval_seconds: u64,
    /// A remote instance fetched within this many seconds is fresh
    pub instance_refresh_interval_seconds: u64,
    /// Maximum number of ancestors walked when resolving a reply chain
    pub max_thread_depth: usize,
    /// Timeout applied to every outgoing federation request
    pub fetch_timeout_seconds: u64,
    /// User-Agent for outgoing federation requests
    pub user_agent: String,
    /// Largest response body read from a remote server
    pub max_body_bytes: usize,
}

impl FederationConfig {
    pub fn account_refresh_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.account_refresh_interval_seconds as i64)
    }

    pub fn instance_refresh_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.instance_refresh_interval_seconds as i64)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            account_refresh_interval_seconds: 7_200,
            instance_refresh_interval_seconds: 86_400,
            max_thread_depth: 100,
            fetch_timeout_seconds: 30,
            user_agent: "rustfed/0.1.0".to_string(),
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Remote media storage
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Directory fetched remote media is written to
    pub directory: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (RUSTFED__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/rustfed.db")?
            .set_default("federation.account_refresh_interval_seconds", 7_200)?
            .set_default("federation.instance_refresh_interval_seconds", 86_400)?
            .set_default("federation.max_thread_depth", 100)?
            .set_default("federation.fetch_timeout_seconds", 30)?
            .set_default("federation.user_agent", "rustfed/0.1.0")?
            .set_default("federation.max_body_bytes", 8 * 1024 * 1024)?
            .set_default("media.directory", "data/media")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("RUSTFED")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.server.domain.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "server.domain must not be empty".to_string(),
            ));
        }

        if self.federation.max_thread_depth == 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_thread_depth must be greater than 0".to_string(),
            ));
        }

        if self.federation.max_body_bytes == 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_body_bytes must be greater than 0".to_string(),
            ));
        }

        if self.federation.account_refresh_interval_seconds == 0
            || self.federation.instance_refresh_interval_seconds == 0
        {
            return Err(crate::error::AppError::Config(
                "federation refresh intervals must be greater than 0".to_string(),
            ));
        }

        if is_local_server_domain(&self.server.domain) {
            if !self.server.protocol.eq_ignore_ascii_case("https") {
                tracing::warn!(
                    host = %normalized_server_host(&self.server.domain),
                    protocol = %self.server.protocol,
                    "Federating over plain http for local development"
                );
            }
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
