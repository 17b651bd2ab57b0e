//! Configuration management for the Ferry daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ferry/daemon.toml`.
//!
//! Values are layered: built-in defaults, then the file, then `FERRY_*`
//! environment variables, then command-line flags (applied by `main`).

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::throttle::bytes_per_second_from_mbps;
use protocol::transfer::DEFAULT_CHUNK_SIZE;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First port of the IANA dynamic range, used when no port is configured.
pub const DYNAMIC_PORT_START: u16 = 49152;

/// Smallest accepted transfer chunk (4 KiB).
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// Largest accepted transfer chunk (1 MiB).
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("mbps_limit must be a finite number >= 0, got {0}")]
    InvalidMbpsLimit(f64),

    #[error("chunk_size must be between 4096 and 1048576 bytes, got {0}")]
    InvalidChunkSize(usize),

    #[error("host must be an IP address, got {0}")]
    InvalidHost(String),

    #[error("tls cert_path and key_path must be set together")]
    IncompleteTls,

    #[error("root is not a directory: {0}")]
    InvalidRoot(PathBuf),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
/// Environment variable overriding `daemon.log_level`.
pub const LOG_LEVEL_ENV: &str = "FERRY_LOG_LEVEL";

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Ferry daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Listener configuration.
    pub server: ServerConfig,

    /// File transfer configuration.
    pub transfer: TransferConfig,

    /// Optional TLS certificate material.
    pub tls: TlsConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind. `0.0.0.0` listens on every interface.
    pub host: String,

    /// Port to bind. 0 picks a random port in the dynamic range.
    pub port: u16,

    /// Directory served to clients. Defaults to the working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

/// File transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Bandwidth cap per transfer direction in megabits/second (0 = unlimited).
    pub mbps_limit: f64,

    /// Bytes per binary message.
    pub chunk_size: usize,
}

/// TLS settings. Both paths must be set to enable TLS.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<PathBuf>,

    /// PEM private key (PKCS#8, PKCS#1 or SEC1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            root: None,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            mbps_limit: 0.0,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl TlsConfig {
    /// Returns the certificate and key paths when TLS is configured.
    pub fn paths(&self) -> Option<(&Path, &Path)> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ferry")
        .join("daemon.toml")
}

impl Config {
    /// Level to start logging at, before overrides are applied and logged.
    ///
    /// `verbose` beats `FERRY_LOG_LEVEL`, which beats the file.
    pub fn startup_log_level(&self, verbose: bool) -> String {
        if verbose {
            return "debug".to_string();
        }
        non_empty_var(LOG_LEVEL_ENV)
            .unwrap_or_else(|| self.daemon.log_level.clone())
            .to_lowercase()
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - FERRY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - FERRY_ROOT: Override the served directory
    /// - FERRY_PORT: Override the listen port
    /// - FERRY_MBPS: Override the bandwidth cap in megabits/second
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = non_empty_var(LOG_LEVEL_ENV) {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(root) = non_empty_var("FERRY_ROOT") {
            tracing::info!("Overriding root from environment: {}", root);
            self.server.root = Some(PathBuf::from(root));
        }

        if let Some(port) = non_empty_var("FERRY_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!("Ignoring invalid FERRY_PORT: {}", port),
            }
        }

        if let Some(mbps) = non_empty_var("FERRY_MBPS") {
            match mbps.parse() {
                Ok(mbps) => self.transfer.mbps_limit = mbps,
                Err(_) => tracing::warn!("Ignoring invalid FERRY_MBPS: {}", mbps),
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mbps = self.transfer.mbps_limit;
        if !mbps.is_finite() || mbps < 0.0 {
            return Err(ConfigError::InvalidMbpsLimit(mbps));
        }

        let chunk = self.transfer.chunk_size;
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk) {
            return Err(ConfigError::InvalidChunkSize(chunk));
        }

        if self.server.host.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidHost(self.server.host.clone()));
        }

        if self.tls.cert_path.is_some() != self.tls.key_path.is_some() {
            return Err(ConfigError::IncompleteTls);
        }

        if let Some(root) = &self.server.root {
            if !root.is_dir() {
                return Err(ConfigError::InvalidRoot(root.clone()));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// The bandwidth cap in bytes per second (0 = unlimited).
    pub fn bytes_per_second_limit(&self) -> u64 {
        bytes_per_second_from_mbps(self.transfer.mbps_limit)
    }

    /// The address to bind, choosing a random dynamic port when unset.
    ///
    /// Call [`validate`](Self::validate) first; an unparsable host falls back
    /// to all interfaces.
    pub fn listen_addr(&self) -> SocketAddr {
        let ip = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let port = match self.server.port {
            0 => rand::thread_rng().gen_range(DYNAMIC_PORT_START..=u16::MAX),
            port => port,
        };
        SocketAddr::new(ip, port)
    }

    /// The directory to serve: the configured root or the working directory.
    pub fn root_dir(&self) -> Result<PathBuf> {
        match &self.server.root {
            Some(root) => Ok(root.clone()),
            None => std::env::current_dir().context("Failed to determine working directory"),
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const ENV_VARS: &[&str] = &["FERRY_LOG_LEVEL", "FERRY_ROOT", "FERRY_PORT", "FERRY_MBPS"];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 0);
        assert!(config.server.root.is_none());
        assert_eq!(config.transfer.mbps_limit, 0.0);
        assert_eq!(config.transfer.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.tls.paths().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[transfer]
mbps_limit = 80.0

[server]
port = 50000
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.transfer.mbps_limit, 80.0);
        assert_eq!(config.server.port, 50000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.daemon.log_level, "info");
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "trace"

[server]
host = "127.0.0.1"
port = 50123
root = "/srv/files"

[transfer]
mbps_limit = 12.5
chunk_size = 65536

[tls]
cert_path = "/etc/ferry/cert.pem"
key_path = "/etc/ferry/key.pem"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 50123);
        assert_eq!(config.server.root, Some(PathBuf::from("/srv/files")));
        assert_eq!(config.transfer.mbps_limit, 12.5);
        assert_eq!(config.transfer.chunk_size, 65536);
        assert_eq!(
            config.tls.paths(),
            Some((
                Path::new("/etc/ferry/cert.pem"),
                Path::new("/etc/ferry/key.pem")
            ))
        );
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[server\nport = 1");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[server]
port = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.server.root = Some(PathBuf::from("/data"));
        original.transfer.mbps_limit = 100.0;

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[transfer]"));
        assert_eq!(Config::from_toml(&toml).unwrap(), original);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/daemon.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("daemon.toml");

        let mut original = Config::default();
        original.transfer.chunk_size = 32 * 1024;
        original.save(&config_path).unwrap();

        assert_eq!(Config::load(&config_path).unwrap(), original);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("daemon.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("ferry"));
        assert!(path.to_string_lossy().ends_with("daemon.toml"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.transfer.mbps_limit = -1.0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMbpsLimit(-1.0)));

        let mut config = Config::default();
        config.transfer.chunk_size = 16;
        assert_eq!(config.validate(), Err(ConfigError::InvalidChunkSize(16)));

        let mut config = Config::default();
        config.server.host = "+".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidHost("+".to_string()))
        );

        let mut config = Config::default();
        config.tls.cert_path = Some(PathBuf::from("cert.pem"));
        assert_eq!(config.validate(), Err(ConfigError::IncompleteTls));

        let mut config = Config::default();
        config.server.root = Some(PathBuf::from("/nonexistent/ferry/root"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRoot(_))
        ));

        let mut config = Config::default();
        config.daemon.log_level = "loud".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );
    }

    #[test]
    fn test_bytes_per_second_limit() {
        let mut config = Config::default();
        assert_eq!(config.bytes_per_second_limit(), 0);
        config.transfer.mbps_limit = 8.0;
        assert_eq!(config.bytes_per_second_limit(), 1_000_000);
    }

    #[test]
    fn test_listen_addr_picks_dynamic_port() {
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();

        let addr = config.listen_addr();
        assert!(addr.ip().is_loopback());
        assert!(addr.port() >= DYNAMIC_PORT_START);

        config.server.port = 8080;
        assert_eq!(config.listen_addr().port(), 8080);
    }

    #[test]
    #[serial]
    fn test_startup_log_level_precedence() {
        clear_env();
        let mut config = Config::default();
        config.daemon.log_level = "WARN".to_string();
        assert_eq!(config.startup_log_level(false), "warn");

        std::env::set_var("FERRY_LOG_LEVEL", "trace");
        assert_eq!(config.startup_log_level(false), "trace");
        assert_eq!(config.startup_log_level(true), "debug");

        std::env::set_var("FERRY_LOG_LEVEL", "");
        assert_eq!(config.startup_log_level(false), "warn");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("FERRY_LOG_LEVEL", "debug");
        std::env::set_var("FERRY_ROOT", "/tmp");
        std::env::set_var("FERRY_PORT", "50001");
        std::env::set_var("FERRY_MBPS", "2.5");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.server.root, Some(PathBuf::from("/tmp")));
        assert_eq!(config.server.port, 50001);
        assert_eq!(config.transfer.mbps_limit, 2.5);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_or_invalid_is_ignored() {
        clear_env();
        std::env::set_var("FERRY_LOG_LEVEL", "");
        std::env::set_var("FERRY_MBPS", "fast");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config, Config::default());

        clear_env();
    }
}
