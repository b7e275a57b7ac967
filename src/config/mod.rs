/// Configuration management for the cluster pool

use crate::core::{ConnectionDefaults, NodeInput, NodeSpec, PortValue};
pub use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Pool configuration
    pub pool: PoolConfig,
    /// Defaults applied to every node connection
    #[serde(default)]
    pub connection: ConnectionDefaults,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Startup nodes handed to the first reconciliation
    pub nodes: Vec<NodeSpec>,
    /// How long to wait for every node to settle, in milliseconds
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

fn default_ready_timeout_ms() -> u64 {
    5_000
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig {
                nodes: vec![NodeSpec::Address("127.0.0.1:7000".to_string())],
                ready_timeout_ms: default_ready_timeout_ms(),
            },
            connection: ConnectionDefaults::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate pool config
        if self.pool.nodes.is_empty() {
            return Err(ConfigError::ValidationError(
                "pool.nodes cannot be empty".to_string(),
            ));
        }

        for node in &self.pool.nodes {
            node.resolve()
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }

        if self.pool.ready_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "ready_timeout_ms must be greater than 0".to_string(),
            ));
        }

        // Validate connection defaults
        if self.connection.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            pool: PoolConfig {
                nodes: vec![
                    NodeSpec::Address("10.0.1.20:6379".to_string()),
                    NodeSpec::Address("redis://10.0.1.21:6379".to_string()),
                    NodeSpec::Options(NodeInput {
                        host: Some("10.0.1.22".to_string()),
                        port: Some(PortValue::Number(6379)),
                        read_only: Some(true),
                        ..Default::default()
                    }),
                ],
                ready_timeout_ms: default_ready_timeout_ms(),
            },
            connection: ConnectionDefaults {
                name: Some("cluster-pool".to_string()),
                ..Default::default()
            },
            logging: LoggingConfig::default(),
        };

        config.save_to_file(path)
    }
}
