//! Service modules.
//!
//! A service module is a named unit of functionality that can be invoked
//! locally or, once bound over a connection, by a peer process. Modules that
//! run background work also implement [`Singleton`] so arbitration can stop
//! the local copy when a peer takes over.
//!
//! - `ModuleTable`: static table of local modules resolved at startup
//! - `binder`: binds configured modules over connections
//! - `echo` / `heartbeat`: built-in modules

pub mod binder;
pub mod echo;
pub mod heartbeat;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::transport::TransportError;

pub use binder::{BindingError, RemoteModule, ServiceBinder};
pub use echo::EchoModule;
pub use heartbeat::HeartbeatModule;

/// Errors raised by module invocation.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Unknown module '{0}'")]
    UnknownModule(String),

    #[error("Module '{module}' has no method '{method}'")]
    UnknownMethod { module: String, method: String },

    #[error("{0}")]
    Failed(String),

    #[error("Payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A named module that can be invoked by method name.
#[async_trait]
pub trait ServiceModule: Send + Sync {
    /// Module name, unique within a process.
    fn name(&self) -> &str;

    /// Invoke `method` with an opaque payload.
    async fn invoke(&self, method: &str, payload: Bytes) -> Result<Bytes, ServiceError>;

    /// Background-service view of this module, if it runs as a singleton.
    fn as_singleton(&self) -> Option<&dyn Singleton> {
        None
    }
}

/// A background service that must run in at most one process.
#[async_trait]
pub trait Singleton: Send + Sync {
    fn is_running(&self) -> bool;

    /// Stop the service. Stopping a service that is not running is a no-op.
    async fn stop(&self, graceful: bool) -> Result<(), ServiceError>;
}

/// Local modules known to this process, keyed by name.
#[derive(Clone, Default)]
pub struct ModuleTable {
    modules: HashMap<String, Arc<dyn ServiceModule>>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module, replacing any module with the same name.
    pub fn with(mut self, module: Arc<dyn ServiceModule>) -> Self {
        self.insert(module);
        self
    }

    pub fn insert(&mut self, module: Arc<dyn ServiceModule>) {
        self.modules.insert(module.name().to_string(), module);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceModule>> {
        self.modules.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Module names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
