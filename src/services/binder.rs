//! Service binder.
//!
//! On a client connection, each configured module becomes a [`RemoteModule`]
//! proxy scoped to that connection. On the serving side, local modules are
//! registered with the [`RpcServer`] so peers can invoke them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ModuleTable, ServiceError};
use crate::transport::{ConnectionHandle, RpcServer};

/// A module could not be bound.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BindingError {
    #[error("Peer '{server_id}' does not serve module '{module}'")]
    NotAnnounced { server_id: String, module: String },

    #[error("No local module named '{module}' to serve as '{server_id}'")]
    UnknownLocal { server_id: String, module: String },
}

impl BindingError {
    pub fn server_id(&self) -> &str {
        match self {
            BindingError::NotAnnounced { server_id, .. }
            | BindingError::UnknownLocal { server_id, .. } => server_id,
        }
    }

    pub fn module(&self) -> &str {
        match self {
            BindingError::NotAnnounced { module, .. }
            | BindingError::UnknownLocal { module, .. } => module,
        }
    }
}

/// Proxy for a module served by a connected peer.
#[derive(Clone, Debug)]
pub struct RemoteModule {
    module: String,
    connection: ConnectionHandle,
}

impl RemoteModule {
    pub fn name(&self) -> &str {
        &self.module
    }

    pub fn peer_id(&self) -> &str {
        self.connection.peer_id()
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection.id()
    }

    pub async fn call(&self, method: &str, payload: Bytes) -> Result<Bytes, ServiceError> {
        Ok(self.connection.call(&self.module, method, payload).await?)
    }

    /// Call with JSON request and response bodies.
    pub async fn call_json<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
    ) -> Result<Resp, ServiceError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = Bytes::from(serde_json::to_vec(request)?);
        let reply = self.call(method, payload).await?;
        Ok(serde_json::from_slice(&reply)?)
    }
}

struct Bindings {
    peer_id: String,
    modules: BTreeMap<String, RemoteModule>,
}

/// Tracks remote module proxies per connection.
#[derive(Clone, Default)]
pub struct ServiceBinder {
    connections: Arc<RwLock<HashMap<Uuid, Bindings>>>,
}

impl ServiceBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind each of `modules` over a client connection.
    ///
    /// Modules the peer announced are bound even if others fail; the first
    /// failure is returned. Rebinding the same module is a no-op.
    pub async fn bind_remote(
        &self,
        connection: &ConnectionHandle,
        modules: &[String],
    ) -> Result<Vec<String>, BindingError> {
        let mut bound = Vec::new();
        let mut first_error = None;

        let mut connections = self.connections.write().await;
        let entry = connections.entry(connection.id()).or_insert_with(|| Bindings {
            peer_id: connection.peer_id().to_string(),
            modules: BTreeMap::new(),
        });

        for module in modules {
            if !connection.announces(module) {
                first_error.get_or_insert(BindingError::NotAnnounced {
                    server_id: connection.peer_id().to_string(),
                    module: module.clone(),
                });
                continue;
            }
            entry.modules.entry(module.clone()).or_insert_with(|| {
                debug!(peer_id = %connection.peer_id(), module = %module, "Bound remote module");
                RemoteModule {
                    module: module.clone(),
                    connection: connection.clone(),
                }
            });
            bound.push(module.clone());
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(bound),
        }
    }

    /// Serve `modules` from `table` on `server`.
    pub async fn bind_local(
        &self,
        server: &RpcServer,
        table: &ModuleTable,
        modules: &[String],
    ) -> Result<(), BindingError> {
        for name in modules {
            let module = table.get(name).ok_or_else(|| BindingError::UnknownLocal {
                server_id: server.server_id().to_string(),
                module: name.clone(),
            })?;
            if server.register(module).await {
                info!(server_id = %server.server_id(), module = %name, "Serving module");
            }
        }
        Ok(())
    }

    /// Remote proxies for `module` on live connections, ordered by peer id.
    pub async fn providers(&self, module: &str) -> Vec<RemoteModule> {
        let connections = self.connections.read().await;
        let mut providers: Vec<RemoteModule> = connections
            .values()
            .filter_map(|b| b.modules.get(module))
            .filter(|m| !m.connection.is_closed())
            .cloned()
            .collect();
        providers.sort_by(|a, b| a.peer_id().cmp(b.peer_id()));
        providers
    }

    /// Names bound over one connection.
    pub async fn bound_modules(&self, connection_id: Uuid) -> Vec<String> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|b| b.modules.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget every binding of a connection.
    pub async fn unbind(&self, connection_id: Uuid) -> Vec<String> {
        match self.connections.write().await.remove(&connection_id) {
            Some(bindings) => {
                debug!(
                    peer_id = %bindings.peer_id,
                    modules = bindings.modules.len(),
                    "Unbound connection"
                );
                bindings.modules.into_keys().collect()
            }
            None => Vec::new(),
        }
    }
}
