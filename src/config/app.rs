//! Application configuration structures.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatorConfig;
use crate::collector::{MIN_INTERVAL, SchedulerConfig};
use crate::discovery::{DiscoveryConfig, ProbeConfig};
use crate::engine::EngineConfig;
use crate::plugin::PluginConfig;
use crate::storage::db::DEFAULT_MAX_CONNECTIONS;

use super::validation::{ConfigError, expand_env_vars, invalid};

/// Default database location.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:data/netwatch.db";

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

// =============================================================================
// Server Configuration
// =============================================================================

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 8080).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL, e.g. `sqlite:data/netwatch.db` or `sqlite::memory:`.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Connection pool size (default: 5).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Collection plugin executable.
    #[serde(default)]
    pub plugin: PluginConfig,
    /// Reachability probing.
    #[serde(default)]
    pub probe: ProbeConfig,
    /// Timer reconciliation.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Metric batching.
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// `${VAR}` and `${VAR:-default}` references are expanded before parsing.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(&expand_env_vars(content))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            invalid(format!(
                "invalid server bind address: '{}'",
                self.server.bind
            ))
        })?;
        if self.server.port == 0 {
            return Err(invalid("server port must be non-zero"));
        }

        if !self.database.url.starts_with("sqlite:") {
            return Err(invalid(format!(
                "database url must be a sqlite: url, got '{}'",
                self.database.url
            )));
        }
        if self.database.max_connections == 0 {
            return Err(invalid("database max_connections must be positive"));
        }

        if self.plugin.path.as_os_str().is_empty() {
            return Err(invalid("plugin path must not be empty"));
        }
        positive(self.plugin.timeout, "plugin timeout")?;
        positive(self.plugin.read_timeout, "plugin read_timeout")?;
        if self.plugin.workers == 0 {
            return Err(invalid("plugin workers must be positive"));
        }
        if self.plugin.queue_capacity == 0 {
            return Err(invalid("plugin queue_capacity must be positive"));
        }

        positive(self.probe.ping_timeout, "probe ping_timeout")?;
        positive(self.probe.port_timeout, "probe port_timeout")?;
        if self.probe.concurrency == 0 {
            return Err(invalid("probe concurrency must be positive"));
        }

        if self.scheduler.refresh_interval < MIN_INTERVAL {
            return Err(invalid(format!(
                "scheduler refresh_interval must be at least {}",
                humantime::format_duration(MIN_INTERVAL)
            )));
        }

        if self.aggregator.batch_size == 0 {
            return Err(invalid("aggregator batch_size must be positive"));
        }
        positive(self.aggregator.flush_interval, "aggregator flush_interval")?;
        if self.aggregator.channel_capacity == 0 {
            return Err(invalid("aggregator channel_capacity must be positive"));
        }

        if self.discovery.max_hosts == 0 {
            return Err(invalid("discovery max_hosts must be positive"));
        }

        Ok(())
    }

    /// Engine settings carried by this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            plugin: self.plugin.clone(),
            probe: self.probe.clone(),
            scheduler: self.scheduler.clone(),
            aggregator: self.aggregator.clone(),
            discovery: self.discovery.clone(),
        }
    }
}

fn positive(value: Duration, field: &str) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(invalid(format!("{field} must be positive")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = AppConfig::from_yaml("{}").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.url, DEFAULT_DATABASE_URL);
        assert_eq!(config.plugin.timeout, Duration::from_secs(120));
        assert_eq!(config.plugin.workers, 8);
        assert_eq!(config.plugin.read_timeout, Duration::from_secs(600));
        assert_eq!(config.plugin.queue_capacity, 256);
        assert!(config.plugin.args.is_empty());
        assert_eq!(config.scheduler.refresh_interval, Duration::from_secs(10));
        assert_eq!(config.aggregator.batch_size, 50);
        assert_eq!(config.aggregator.flush_interval, Duration::from_secs(15));
        assert_eq!(config.discovery.max_hosts, 65_536);
    }

    #[test]
    fn test_load_full_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
server:
  bind: "127.0.0.1"
  port: 9000
database:
  url: "${{NETWATCH_TEST_UNSET_URL:-sqlite::memory:}}"
plugin:
  path: /opt/netwatch/collector
  args: ["--json"]
  timeout: 30s
  read_timeout: 20m
  workers: 2
  queue_capacity: 32
probe:
  ping_timeout: 500ms
  port_timeout: 2s
scheduler:
  refresh_interval: 5s
aggregator:
  batch_size: 10
  flush_interval: 1s
discovery:
  max_hosts: 1024
"#
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.plugin.args, vec!["--json"]);
        assert_eq!(config.plugin.timeout, Duration::from_secs(30));
        assert_eq!(config.plugin.read_timeout, Duration::from_secs(1200));
        assert_eq!(config.plugin.queue_capacity, 32);
        assert_eq!(config.probe.ping_timeout, Duration::from_millis(500));
        assert_eq!(config.probe.ping_retries, 1);
        assert_eq!(config.aggregator.batch_size, 10);

        let engine = config.engine_config();
        assert_eq!(engine.plugin.workers, 2);
        assert_eq!(engine.discovery.max_hosts, 1024);
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::load("/nonexistent/netwatch.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }

    #[test]
    fn test_invalid_bind_address() {
        let err = AppConfig::from_yaml("server: { bind: not-an-ip }").unwrap_err();
        assert!(err.to_string().contains("invalid server bind address"));
    }

    #[test]
    fn test_rejects_zero_values() {
        for doc in [
            "server: { port: 0 }",
            "plugin: { workers: 0 }",
            "plugin: { timeout: 0s }",
            "plugin: { read_timeout: 0s }",
            "plugin: { queue_capacity: 0 }",
            "probe: { concurrency: 0 }",
            "scheduler: { refresh_interval: 100ms }",
            "aggregator: { batch_size: 0 }",
            "discovery: { max_hosts: 0 }",
            "database: { url: 'postgres://localhost/db' }",
        ] {
            let err = AppConfig::from_yaml(doc).unwrap_err();
            assert!(
                matches!(err, ConfigError::ValidationError(_)),
                "{doc} should fail validation"
            );
        }
    }

    #[test]
    fn test_bad_duration_is_parse_error() {
        let err = AppConfig::from_yaml("plugin: { timeout: soon }").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
