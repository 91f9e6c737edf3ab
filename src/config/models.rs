//! Configuration data structures for Keel.
//!
//! These types map directly to YAML (also JSON / TOML / INI) configuration files. Every
//! field has a default so that minimal configs remain concise. Builders and enums here are
//! part of the public API for embedding.
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub tls: Option<TlsConfig>,
    pub shutdown: ShutdownConfig,
    pub payload: PayloadLimits,
    pub trailing_slash: TrailingSlashMode,
    pub logging: LoggingConfig,
    pub routers: Vec<RouterConfig>,
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            tls: None,
            shutdown: ShutdownConfig::default(),
            payload: PayloadLimits::default(),
            trailing_slash: TrailingSlashMode::default(),
            logging: LoggingConfig::default(),
            routers: Vec::new(),
        }
    }
}

/// Builder for ServerConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ServerConfigBuilder {
    listen_addr: Option<String>,
    tls: Option<TlsConfig>,
    shutdown: Option<ShutdownConfig>,
    payload: Option<PayloadLimits>,
    trailing_slash: Option<TrailingSlashMode>,
    logging: Option<LoggingConfig>,
    routers: Vec<RouterConfig>,
}

impl ServerConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Serve over TLS with a PEM certificate chain and private key
    pub fn tls(mut self, cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        self.tls = Some(TlsConfig {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        });
        self
    }

    /// Set both shutdown phase timeouts
    pub fn shutdown(mut self, request_grace_period: Duration, socket_close_timeout: Duration) -> Self {
        self.shutdown = Some(ShutdownConfig {
            request_grace_period: humantime::format_duration(request_grace_period).to_string(),
            socket_close_timeout: humantime::format_duration(socket_close_timeout).to_string(),
        });
        self
    }

    /// Set server-wide payload limits
    pub fn payload(mut self, limits: PayloadLimits) -> Self {
        self.payload = Some(limits);
        self
    }

    pub fn trailing_slash(mut self, mode: TrailingSlashMode) -> Self {
        self.trailing_slash = Some(mode);
        self
    }

    pub fn logging(mut self, config: LoggingConfig) -> Self {
        self.logging = Some(config);
        self
    }

    /// Add a router definition
    pub fn router(mut self, router: RouterConfig) -> Self {
        self.routers.push(router);
        self
    }

    /// Build the final ServerConfig
    pub fn build(self) -> Result<ServerConfig, String> {
        let listen_addr = self
            .listen_addr
            .ok_or_else(|| "listen_addr is required".to_string())?;

        let mut names: Vec<&str> = self.routers.iter().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(format!("Router name '{}' is used more than once", pair[0]));
        }

        Ok(ServerConfig {
            listen_addr,
            tls: self.tls,
            shutdown: self.shutdown.unwrap_or_default(),
            payload: self.payload.unwrap_or_default(),
            trailing_slash: self.trailing_slash.unwrap_or_default(),
            logging: self.logging.unwrap_or_default(),
            routers: self.routers,
        })
    }
}

/// Pre-configured certificate material.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TlsConfig {
    /// Path to PEM encoded certificate chain
    pub cert_path: String,
    /// Path to PEM encoded private key
    pub key_path: String,
}

/// Bounded waits used by the shutdown sequence.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long to wait for in-flight requests to finish, e.g. "10s"
    pub request_grace_period: String,
    /// How long to wait for sockets to close before destroying them, e.g. "5s"
    pub socket_close_timeout: String,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            request_grace_period: "10s".to_string(),
            socket_close_timeout: "5s".to_string(),
        }
    }
}

impl ShutdownConfig {
    pub fn request_grace_period(&self) -> Result<Duration, humantime::DurationError> {
        humantime::parse_duration(&self.request_grace_period)
    }

    pub fn socket_close_timeout(&self) -> Result<Duration, humantime::DurationError> {
        humantime::parse_duration(&self.socket_close_timeout)
    }
}

/// Server-wide body parsing budgets. Routes may tighten or relax each one.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct PayloadLimits {
    /// Total request body bytes
    pub max_bytes: usize,
    /// Multipart parts (fields + files)
    pub max_parts: usize,
    pub max_fields: usize,
    pub max_files: usize,
    pub max_field_name_bytes: usize,
    pub max_field_value_bytes: usize,
    pub max_file_bytes: usize,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            max_parts: 100,
            max_fields: 100,
            max_files: 10,
            max_field_name_bytes: 100,
            max_field_value_bytes: 1024 * 1024,
            max_file_bytes: 1024 * 1024,
        }
    }
}

/// What to do with a request path that ends in `/`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrailingSlashMode {
    /// Answer 308 pointing at the path without the slash
    #[default]
    Redirect,
    /// Route as if the slash were absent
    Rewrite,
    /// Route the path as given
    Ignore,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

/// A router whose routes are discovered from manifest directories.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RouterConfig {
    pub name: String,
    /// Mount prefix, e.g. "/api". Empty mounts at the root.
    pub base_path: String,
    /// Directories scanned for route manifests
    pub directories: Vec<String>,
    /// Answer 404 for unmatched paths under `base_path`
    pub not_found_fallback: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new("", "")
    }
}

impl RouterConfig {
    pub fn new(name: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_path: base_path.into(),
            directories: Vec::new(),
            not_found_fallback: true,
        }
    }

    pub fn directory(mut self, dir: impl Into<String>) -> Self {
        self.directories.push(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.trailing_slash, TrailingSlashMode::Redirect);
        assert_eq!(
            config.shutdown.request_grace_period().unwrap(),
            Duration::from_secs(10)
        );
        assert_eq!(
            config.shutdown.socket_close_timeout().unwrap(),
            Duration::from_secs(5)
        );
        assert_eq!(config.payload.max_bytes, 1024 * 1024);
    }

    #[test]
    fn test_builder_rejects_duplicate_router_names() {
        let result = ServerConfig::builder()
            .listen_addr("127.0.0.1:0")
            .router(RouterConfig::new("api", "/api"))
            .router(RouterConfig::new("api", "/v2"))
            .build();
        assert!(result.unwrap_err().contains("api"));
    }

    #[test]
    fn test_builder_formats_durations() {
        let config = ServerConfig::builder()
            .listen_addr("127.0.0.1:0")
            .shutdown(Duration::from_millis(250), Duration::from_secs(2))
            .build()
            .unwrap();
        assert_eq!(
            config.shutdown.request_grace_period().unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(config.shutdown.socket_close_timeout, "2s");
    }
}
