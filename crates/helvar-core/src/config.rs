/*!
 * Configuration management for the HelvarNet client.
 *
 * Settings are layered: built-in defaults, then an optional configuration
 * file, then environment variables carrying a prefix (for example
 * `HELVAR__ROUTER__HOST=10.254.1.1`).
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Default HelvarNet TCP port
pub const DEFAULT_PORT: u16 = 50000;

/// Protocol version sent with every outbound command unless overridden
pub const DEFAULT_PROTOCOL_VERSION: &str = "2";

/// Top-level configuration for a HelvarNet router session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelvarConfig {
    /// Router connection settings
    #[serde(default)]
    pub router: RouterConfig,

    /// Session timing settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Router connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Host name or IP address of the router
    #[serde(default)]
    pub host: Option<String>,

    /// TCP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Cluster id of the router (0-253)
    #[serde(default = "default_cluster_id")]
    pub cluster_id: u8,

    /// Router id within the cluster (1-254)
    #[serde(default = "default_router_id")]
    pub router_id: u8,

    /// Protocol version literal sent as the `V` parameter
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

/// Session timing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds between keepalive queries
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Seconds to wait for any inbound line after a keepalive before reconnecting
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,

    /// Seconds to wait before retrying a failed connect
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Upper bound for a single connect attempt
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Pause between consecutive writes (0 disables throttling)
    #[serde(default)]
    pub send_delay_ms: u64,

    /// How long teardown waits for an in-flight write before aborting the sender
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

/// Discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// A running scan is stopped automatically after this many seconds (0 disables)
    #[serde(default = "default_discovery_timeout")]
    pub timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            cluster_id: default_cluster_id(),
            router_id: default_router_id(),
            protocol_version: default_protocol_version(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
            connect_timeout_secs: default_connect_timeout(),
            send_delay_ms: 0,
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_discovery_timeout(),
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

impl RouterConfig {
    /// The configured host, or a configuration error when it is missing or blank
    pub fn require_host(&self) -> Result<&str> {
        match self.host.as_deref().map(str::trim) {
            Some(host) if !host.is_empty() => Ok(host),
            _ => Err(Error::config("Router host is not configured")),
        }
    }
}

impl SessionConfig {
    /// Keepalive period
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Liveness window armed by each keepalive
    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    /// Delay before a connect retry
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Connect attempt bound
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Sender throttle, if any
    pub fn send_delay(&self) -> Option<Duration> {
        (self.send_delay_ms > 0).then(|| Duration::from_millis(self.send_delay_ms))
    }

    /// Teardown grace period
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl DiscoveryConfig {
    /// Scan timeout, if enabled
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_cluster_id() -> u8 {
    1
}

fn default_router_id() -> u8 {
    1
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

fn default_keepalive_interval() -> u64 {
    300
}

fn default_keepalive_timeout() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    500
}

fn default_discovery_timeout() -> u64 {
    120
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<HelvarConfig>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: HelvarConfig) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<HelvarConfig> {
        if let Some(config) = self.override_with {
            return Ok(config);
        }

        let mut config_builder = ConfigLib::builder();

        let default_config = HelvarConfig::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: HelvarConfig = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<HelvarConfig>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: HelvarConfig) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &HelvarConfig {
        &self.0
    }
}

impl From<HelvarConfig> for SharedConfig {
    fn from(config: HelvarConfig) -> Self {
        Self::new(config)
    }
}

impl AsRef<HelvarConfig> for SharedConfig {
    fn as_ref(&self) -> &HelvarConfig {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = HelvarConfig::default();
        assert_eq!(config.router.port, 50000);
        assert_eq!(config.router.cluster_id, 1);
        assert_eq!(config.router.router_id, 1);
        assert_eq!(config.router.protocol_version, "2");
        assert_eq!(config.session.keepalive_interval_secs, 300);
        assert_eq!(config.session.keepalive_timeout_secs, 10);
        assert_eq!(config.session.reconnect_delay_secs, 5);
        assert!(config.session.send_delay().is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_require_host() {
        let mut router = RouterConfig::default();
        assert!(matches!(router.require_host(), Err(Error::Config(_))));

        router.host = Some("   ".to_string());
        assert!(router.require_host().is_err());

        router.host = Some("10.254.1.1".to_string());
        assert_eq!(router.require_host().unwrap(), "10.254.1.1");
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert!(config.router.host.is_none());
        assert_eq!(config.router.port, DEFAULT_PORT);
        assert_eq!(config.discovery.timeout_secs, 120);
    }

    #[test_log::test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir().map_err(|e| Error::other(e.to_string()))?;
        let file_path = dir.path().join("helvar.toml");

        {
            let mut file = File::create(&file_path).map_err(|e| Error::other(e.to_string()))?;
            file.write_all(br#"
                [router]
                host = "192.168.1.20"
                router_id = 3
                protocol_version = "1"

                [session]
                send_delay_ms = 25

                [logging]
                level = "debug"
            "#)
            .map_err(|e| Error::other(e.to_string()))?;
        }

        let config = ConfigBuilder::new().with_config_file(file_path).build()?;

        assert_eq!(config.router.host.as_deref(), Some("192.168.1.20"));
        assert_eq!(config.router.router_id, 3);
        assert_eq!(config.router.cluster_id, 1);
        assert_eq!(config.router.protocol_version, "1");
        assert_eq!(config.session.send_delay(), Some(Duration::from_millis(25)));
        assert_eq!(config.logging.level, "debug");

        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("HELVARTEST__ROUTER__HOST", "10.0.0.7");
        env::set_var("HELVARTEST__SESSION__KEEPALIVE_INTERVAL_SECS", "60");

        let config = ConfigBuilder::new()
            .with_environment_prefix("helvartest")
            .build()?;

        assert_eq!(config.router.host.as_deref(), Some("10.0.0.7"));
        assert_eq!(config.session.keepalive_interval(), Duration::from_secs(60));

        env::remove_var("HELVARTEST__ROUTER__HOST");
        env::remove_var("HELVARTEST__SESSION__KEEPALIVE_INTERVAL_SECS");

        Ok(())
    }

    #[test]
    fn test_override_with() -> Result<()> {
        let mut custom = HelvarConfig::default();
        custom.router.host = Some("router.local".to_string());

        let config = ConfigBuilder::new().override_with(custom).build()?;
        assert_eq!(config.router.host.as_deref(), Some("router.local"));

        let shared = SharedConfig::from(config);
        assert_eq!(shared.get().router.port, 50000);
        Ok(())
    }
}
