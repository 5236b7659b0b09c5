//! Local/remote arbitration of singleton services.
//!
//! When this process connects to a peer that serves a module we also run
//! locally as a singleton, the local copy is stopped and the module is
//! recorded as suspended by that peer. Each module is stopped at most once,
//! whichever peer claims it first. Nothing is restarted automatically; on
//! disconnect the records are released and reported.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::services::{ModuleTable, ServiceError};

/// Stopping a local singleton failed.
#[derive(Debug, thiserror::Error)]
#[error("Stopping local singleton '{module}' failed: {source}")]
pub struct ArbitrationError {
    pub module: String,
    #[source]
    pub source: ServiceError,
}

/// Result of arbitrating one connection.
#[derive(Debug, Default)]
pub struct ArbitrationOutcome {
    /// Modules newly suspended in favour of the peer.
    pub suspended: Vec<String>,
    pub errors: Vec<ArbitrationError>,
}

#[derive(Clone)]
pub struct Arbiter {
    modules: ModuleTable,
    /// module -> peer that suspended it
    suspended: Arc<Mutex<HashMap<String, String>>>,
}

impl Arbiter {
    pub fn new(modules: ModuleTable) -> Self {
        Self {
            modules,
            suspended: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Suspend local singletons among `bound` in favour of `peer_id`.
    ///
    /// Self-connections never arbitrate.
    pub async fn arbitrate(
        &self,
        peer_id: &str,
        local_id: &str,
        bound: &[String],
    ) -> ArbitrationOutcome {
        let mut outcome = ArbitrationOutcome::default();
        if peer_id == local_id {
            debug!(peer_id = %peer_id, "Skipping arbitration for self-connection");
            return outcome;
        }

        for module_name in bound {
            let Some(module) = self.modules.get(module_name) else {
                continue;
            };
            let Some(singleton) = module.as_singleton() else {
                continue;
            };

            {
                let mut suspended = self.suspended.lock().await;
                if let Some(owner) = suspended.get(module_name) {
                    debug!(module = %module_name, owner = %owner, "Already suspended");
                    continue;
                }
                suspended.insert(module_name.clone(), peer_id.to_string());
            }
            outcome.suspended.push(module_name.clone());

            if !singleton.is_running() {
                debug!(module = %module_name, peer_id = %peer_id, "Local singleton not running");
                continue;
            }

            match singleton.stop(true).await {
                Ok(()) => info!(
                    module = %module_name,
                    peer_id = %peer_id,
                    "Stopped local singleton in favour of peer"
                ),
                Err(source) => {
                    let error = ArbitrationError {
                        module: module_name.clone(),
                        source,
                    };
                    warn!(peer_id = %peer_id, error = %error, "Arbitration failed");
                    outcome.errors.push(error);
                }
            }
        }

        outcome
    }

    /// Drop every suspension owned by `peer_id`, returning the modules.
    pub async fn release(&self, peer_id: &str) -> Vec<String> {
        let mut suspended = self.suspended.lock().await;
        let mut released: Vec<String> = suspended
            .iter()
            .filter(|(_, owner)| owner.as_str() == peer_id)
            .map(|(module, _)| module.clone())
            .collect();
        released.sort();
        for module in &released {
            suspended.remove(module);
        }
        if !released.is_empty() {
            info!(peer_id = %peer_id, modules = ?released, "Released suspended singletons");
        }
        released
    }

    /// Peer currently holding `module`, if suspended.
    pub async fn suspended_by(&self, module: &str) -> Option<String> {
        self.suspended.lock().await.get(module).cloned()
    }
}
