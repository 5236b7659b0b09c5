//! Application configuration.
//!
//! Aggregates node identity, peer descriptors, retry policy and limits into
//! a single Config struct that can be loaded from YAML files or environment
//! variables.

mod limits;
mod server;

pub use limits::{
    ResourceLimits, DEFAULT_CALL_TIMEOUT_MS, DEFAULT_EVENT_CHANNEL_CAPACITY, DEFAULT_MAX_FRAME_BYTES,
};
pub use server::{NodeConfig, RetryConfig, ServerDescriptor, DEFAULT_RETRY_INTERVAL_MS};

use std::collections::BTreeMap;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "peerlink.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PEERLINK_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PEERLINK";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "PEERLINK_LOG";
/// Environment variable naming the server id to serve.
pub const SERVE_ENV_VAR: &str = "PEERLINK_SERVE";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity of the current process.
    pub node: NodeConfig,
    /// Retry policy for deferred connections.
    pub retry: RetryConfig,
    /// Frame and channel limits.
    pub limits: ResourceLimits,
    /// Peer descriptors keyed by server id.
    pub servers: BTreeMap<String, ServerDescriptor>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `peerlink.yaml` in current directory (if exists)
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

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.finish()
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.finish()
    }

    /// Look up the descriptor for a configured peer.
    pub fn server(&self, server_id: &str) -> Option<&ServerDescriptor> {
        self.servers.get(server_id)
    }

    /// Ids of every configured peer, in stable order.
    pub fn server_ids(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    /// Add or replace a peer descriptor (for programmatic setup and tests).
    pub fn with_server(mut self, descriptor: ServerDescriptor) -> Self {
        self.servers.insert(descriptor.id.clone(), descriptor);
        self
    }

    /// Create config for testing: fast retries, no peers.
    pub fn for_test() -> Self {
        Self {
            retry: RetryConfig {
                interval_ms: 20,
                ..RetryConfig::default()
            },
            ..Self::default()
        }
    }

    /// Fill descriptor ids from their map keys and validate.
    fn finish(mut self) -> Result<Self, ConfigError> {
        for (id, descriptor) in self.servers.iter_mut() {
            descriptor.id = id.clone();
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(id) = &self.node.id {
            if id.trim().is_empty() {
                return Err(ConfigError::Invalid("node.id must not be empty".to_string()));
            }
        }
        if self.retry.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry.interval_ms must be greater than zero".to_string(),
            ));
        }
        for descriptor in self.servers.values() {
            if descriptor.modules.iter().any(|m| m.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "server '{}' lists an empty module name",
                    descriptor.id
                )));
            }
        }
        Ok(())
    }
}
