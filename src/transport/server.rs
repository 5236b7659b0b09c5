//! RPC server: the listening side of peer connections.
//!
//! Accepts pipes from a [`Listener`], runs the listener half of the
//! handshake, and serves `Call` frames from the registered modules.
//! Accepted handles are reported on a channel so the process context can
//! link their events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{CallDispatcher, ConnectionHandle, PeerInfo};
use super::{FramePipe, Transport, TransportError, TransportOptions};
use crate::config::ResourceLimits;
use crate::proto::{frame, Frame};
use crate::services::{ServiceError, ServiceModule};

type ModuleMap = Arc<RwLock<HashMap<String, Arc<dyn ServiceModule>>>>;
type ConnectionMap = Arc<RwLock<HashMap<Uuid, ConnectionHandle>>>;

/// Modules served to peers.
#[derive(Clone, Default)]
struct ServedModules {
    modules: ModuleMap,
}

impl ServedModules {
    async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl CallDispatcher for ServedModules {
    async fn dispatch(
        &self,
        module: &str,
        method: &str,
        payload: Bytes,
    ) -> Result<Bytes, ServiceError> {
        let target = self.modules.read().await.get(module).cloned();
        match target {
            Some(target) => target.invoke(method, payload).await,
            None => Err(ServiceError::UnknownModule(module.to_string())),
        }
    }
}

/// Settings shared by every accepted connection.
#[derive(Clone)]
struct AcceptContext {
    server_id: String,
    secret: Option<String>,
    limits: ResourceLimits,
    served: ServedModules,
    connections: ConnectionMap,
    accepted: mpsc::UnboundedSender<ConnectionHandle>,
}

pub struct RpcServer {
    server_id: String,
    dsn: String,
    served: ServedModules,
    connections: ConnectionMap,
    accept_task: JoinHandle<()>,
}

impl RpcServer {
    /// Bind a listener for `server_id` and start accepting.
    pub async fn start(
        transport: &dyn Transport,
        server_id: &str,
        options: &TransportOptions,
        limits: &ResourceLimits,
        accepted: mpsc::UnboundedSender<ConnectionHandle>,
    ) -> Result<Self, TransportError> {
        let mut listener = transport.bind(options).await?;
        let dsn = listener.dsn.clone();

        let served = ServedModules::default();
        let connections: ConnectionMap = Arc::new(RwLock::new(HashMap::new()));
        let ctx = AcceptContext {
            server_id: server_id.to_string(),
            secret: options.secret.clone(),
            limits: limits.clone(),
            served: served.clone(),
            connections: connections.clone(),
            accepted,
        };

        let handshake_timeout = options.connect_timeout();
        let accept_task = tokio::spawn(async move {
            while let Some(pipe) = listener.incoming.recv().await {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let remote = pipe.remote.clone();
                    match tokio::time::timeout(handshake_timeout, accept(pipe, &ctx)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(remote = %remote, error = %e, "Rejected peer"),
                        Err(_) => warn!(remote = %remote, "Handshake timed out"),
                    }
                });
            }
            debug!("Listener closed");
        });

        info!(
            server_id = %server_id,
            dsn = %dsn,
            transport = transport.name(),
            "RPC server started"
        );

        Ok(Self {
            server_id: server_id.to_string(),
            dsn,
            served,
            connections,
            accept_task,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Address peers dial, e.g. `tcp://127.0.0.1:7001`.
    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    /// Serve `module` to peers. Returns false if it was already registered.
    pub async fn register(&self, module: Arc<dyn ServiceModule>) -> bool {
        let name = module.name().to_string();
        let mut modules = self.served.modules.write().await;
        if modules.contains_key(&name) {
            return false;
        }
        modules.insert(name.clone(), module);
        debug!(server_id = %self.server_id, module = %name, "Module registered");
        true
    }

    /// Names of the served modules, sorted.
    pub async fn modules(&self) -> Vec<String> {
        self.served.names().await
    }

    /// Handles of currently accepted connections.
    pub async fn connections(&self) -> Vec<ConnectionHandle> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Stop accepting and close every accepted connection.
    pub async fn stop(&self) {
        self.accept_task.abort();
        let connections: Vec<ConnectionHandle> =
            self.connections.write().await.drain().map(|(_, c)| c).collect();
        for connection in &connections {
            connection.close();
        }
        info!(
            server_id = %self.server_id,
            closed = connections.len(),
            "RPC server stopped"
        );
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Listener half of the handshake.
async fn accept(mut pipe: FramePipe, ctx: &AcceptContext) -> Result<(), TransportError> {
    let first = pipe
        .rx
        .recv()
        .await
        .ok_or_else(|| TransportError::Handshake("peer closed before hello".to_string()))?;

    let kind_name = first.kind_name();
    let hello = match first.kind {
        Some(frame::Kind::Hello(hello)) => hello,
        _ => {
            return Err(TransportError::Handshake(format!(
                "expected hello, got {}",
                kind_name
            )))
        }
    };

    if let Some(secret) = &ctx.secret {
        if &hello.secret != secret {
            let _ = pipe.tx.send(Frame::refused("invalid secret")).await;
            return Err(TransportError::Refused {
                server_id: hello.self_id,
                reason: "invalid secret".to_string(),
            });
        }
    }

    let modules = ctx.served.names().await;
    pipe.tx
        .send(Frame::welcome(ctx.server_id.clone(), modules))
        .await
        .map_err(|_| TransportError::Handshake("peer closed before welcome".to_string()))?;

    let peer = PeerInfo {
        peer_id: hello.self_id,
        local_id: ctx.server_id.clone(),
        modules: Vec::new(),
    };
    let dispatcher: Arc<dyn CallDispatcher> = Arc::new(ctx.served.clone());
    let handle = ConnectionHandle::establish(pipe, peer, &ctx.limits, Some(dispatcher));

    info!(
        server_id = %ctx.server_id,
        peer_id = %handle.peer_id(),
        connection_id = %handle.id(),
        "Peer accepted"
    );
    ctx.connections.write().await.insert(handle.id(), handle.clone());

    let connections = ctx.connections.clone();
    let watched = handle.clone();
    tokio::spawn(async move {
        watched.closed().await;
        connections.write().await.remove(&watched.id());
    });

    // The context may already be gone during shutdown.
    let _ = ctx.accepted.send(handle);
    Ok(())
}
