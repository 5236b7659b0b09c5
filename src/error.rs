//! Crate-level error type for registry operations.
//!
//! Each subsystem keeps its own error enum (`ConfigError`, `TransportError`,
//! `ServiceError`, `RegistryError`); this module folds them into the error
//! kinds surfaced by [`ProcessContext`](crate::context::ProcessContext).

use crate::arbitration::ArbitrationError;
use crate::registry::RegistryError;
use crate::services::{BindingError, ServiceError};
use crate::transport::TransportError;

/// Result type for process context operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by `serve`, `connect` and `connect_all`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested server id is not present in static configuration.
    /// Never retried, regardless of `defer`.
    #[error("Server '{0}' is not configured")]
    Configuration(String),

    /// Transport-level failure while connecting to a peer.
    #[error("Connection to '{server_id}' failed: {source}")]
    Connection {
        server_id: String,
        #[source]
        source: TransportError,
    },

    /// A module failed to bind on an otherwise successful connection.
    /// The connection itself stays registered.
    #[error("Binding module '{module}' for '{server_id}' failed: {reason}")]
    Binding {
        server_id: String,
        module: String,
        reason: String,
    },

    /// Stopping a local singleton failed. Reported through
    /// [`LifecycleHooks::arbitration_failed`](crate::lifecycle::LifecycleHooks::arbitration_failed),
    /// never returned from `connect`.
    #[error("Stopping local singleton '{module}' failed: {source}")]
    Arbitration {
        module: String,
        #[source]
        source: ServiceError,
    },

    /// One or more peers failed during `connect_all`.
    #[error("{} peer connection(s) failed: {}", .0.len(), describe_failures(.0))]
    ConnectAll(Vec<(String, Error)>),

    /// The RPC server could not be started.
    #[error("Serving '{server_id}' failed: {source}")]
    Serve {
        server_id: String,
        #[source]
        source: TransportError,
    },

    /// Registry table invariant violated.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Remote or local module invocation failed.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl Error {
    /// Server ids of the failed peers when this is a `ConnectAll` error.
    pub fn failed_peers(&self) -> Vec<&str> {
        match self {
            Error::ConnectAll(failures) => failures.iter().map(|(id, _)| id.as_str()).collect(),
            Error::Connection { server_id, .. } | Error::Binding { server_id, .. } => {
                vec![server_id.as_str()]
            }
            _ => Vec::new(),
        }
    }
}

impl From<BindingError> for Error {
    fn from(e: BindingError) -> Self {
        Error::Binding {
            server_id: e.server_id().to_string(),
            module: e.module().to_string(),
            reason: e.to_string(),
        }
    }
}

impl From<ArbitrationError> for Error {
    fn from(e: ArbitrationError) -> Self {
        Error::Arbitration {
            module: e.module,
            source: e.source,
        }
    }
}

fn describe_failures(failures: &[(String, Error)]) -> String {
    failures
        .iter()
        .map(|(id, e)| format!("[{}] {}", id, e))
        .collect::<Vec<_>>()
        .join("; ")
}
