//! Node identity, peer descriptor and retry configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::transport::TransportOptions;

/// Default interval between deferred connection attempts.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1000;

/// Identity of the current process.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Server id of this process. When unset, a web-role id derived from the
    /// process id is used until `serve` adopts a configured id.
    pub id: Option<String>,
}

impl NodeConfig {
    /// Resolve the effective server id.
    pub fn resolve_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("web-server-{}", std::process::id()))
    }
}

/// Static descriptor of one peer, keyed by its server id.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerDescriptor {
    /// Server id (filled from the map key when loaded from config).
    pub id: String,
    /// Addressing and authentication.
    pub transport: TransportOptions,
    /// Service modules served by this peer.
    pub modules: Vec<String>,
}

impl ServerDescriptor {
    /// Create a descriptor for programmatic setup.
    pub fn new(id: impl Into<String>, transport: TransportOptions) -> Self {
        Self {
            id: id.into(),
            transport,
            modules: Vec::new(),
        }
    }

    /// Add a service module.
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.modules.push(module.into());
        self
    }

    /// Whether this peer is configured to serve `module`.
    pub fn provides(&self, module: &str) -> bool {
        self.modules.iter().any(|m| m == module)
    }
}

/// Retry policy for deferred connections.
///
/// Defaults reproduce a fixed 1 s interval with no cap. Setting
/// `max_interval_ms` above `interval_ms` doubles the delay after every failed
/// attempt up to that ceiling; `max_attempts` stops retrying after that many
/// scheduled attempts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub interval_ms: u64,
    pub max_interval_ms: Option<u64>,
    pub max_attempts: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            max_interval_ms: None,
            max_attempts: None,
        }
    }
}

impl RetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Ceiling for exponential growth, if growth is enabled.
    pub fn max_interval(&self) -> Option<Duration> {
        self.max_interval_ms
            .filter(|max| *max > self.interval_ms)
            .map(Duration::from_millis)
    }
}
