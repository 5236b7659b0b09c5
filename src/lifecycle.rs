//! Life-cycle hooks.
//!
//! Applications observe the registry through these callbacks. Every method
//! has a no-op default, so implementors override only what they need.

use async_trait::async_trait;

use crate::error::Error;

#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// The process started serving as `server_id`.
    async fn startup(&self, _server_id: &str) {}

    /// A connection to `server_id` completed with `modules` bound.
    async fn peer_connected(&self, _server_id: &str, _modules: &[String]) {}

    /// Stopping a local singleton in favour of `server_id` failed. The
    /// connection is kept; `error` is an [`Error::Arbitration`].
    async fn arbitration_failed(&self, _server_id: &str, _error: &Error) {}

    /// The connection to `server_id` dropped. `released` lists the local
    /// singletons that peer had suspended; they are not restarted.
    async fn peer_disconnected(&self, _server_id: &str, _released: &[String]) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl LifecycleHooks for NoopHooks {}
