//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;

pub use messaging::{AmqpConfig, MessagingConfig, TopologyConfig};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "orderflow.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ORDERFLOW_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ORDERFLOW";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ORDERFLOW_LOG";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Order generator settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Orders per second. Zero is rejected.
    pub rate: u32,
    /// Seed for the random source; drawn from entropy when absent.
    pub seed: Option<u64>,
    /// Capacity of the generator-to-dispatcher channel.
    pub buffer: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            rate: 1,
            seed: None,
            buffer: 1,
        }
    }
}

/// Consumer pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Number of workers competing on the queues.
    pub workers: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { workers: 3 }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection.
    pub messaging: MessagingConfig,
    /// Exchange and queue layout.
    pub topology: TopologyConfig,
    /// Producer-side generation.
    pub generator: GeneratorConfig,
    /// Consumer-side worker pool.
    pub consumer: ConsumerConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `orderflow.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generator.rate == 0 {
            return Err(ConfigError::Invalid(
                "generator.rate must be at least 1 order per second".to_string(),
            ));
        }
        if self.generator.buffer == 0 {
            return Err(ConfigError::Invalid(
                "generator.buffer must be at least 1".to_string(),
            ));
        }
        if self.consumer.workers == 0 {
            return Err(ConfigError::Invalid(
                "consumer.workers must be at least 1".to_string(),
            ));
        }

        let topology = &self.topology;
        for (field, value) in [
            ("topology.exchange", &topology.exchange),
            ("topology.log_queue", &topology.log_queue),
            ("topology.buyer_queue", &topology.buyer_queue),
            ("topology.seller_queue", &topology.seller_queue),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} must not be empty", field)));
            }
        }

        Ok(())
    }
}
