//! Process context.
//!
//! [`ProcessContext`] is the single entry point for a process taking part in
//! a deployment: it serves an RPC server under a configured server id,
//! connects to peers, binds their modules, arbitrates singletons and routes
//! events. All state lives in the context value; there is no global
//! registry.
//!
//! The connection supervisor (`connect`, `connect_all`, `has_connect`, drop
//! handling) lives in [`connect`].

mod connect;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::arbitration::Arbiter;
use crate::bus::{BusError, EventEmitter, EventHandler, EventRouter};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lifecycle::{LifecycleHooks, NoopHooks};
use crate::registry::Registry;
use crate::schedule::{RetryScheduler, RetryTask};
use crate::services::{ModuleTable, ServiceBinder, ServiceError, ServiceModule};
use crate::transport::{ConnectionHandle, RpcServer, TcpTransport, Transport, TransportError};

/// Builder for [`ProcessContext`].
pub struct ProcessContextBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    modules: ModuleTable,
    hooks: Arc<dyn LifecycleHooks>,
    emitter: Option<EventEmitter>,
}

impl ProcessContextBuilder {
    /// Transport used to serve and dial. Defaults to TCP.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Add a local module.
    pub fn module(mut self, module: Arc<dyn ServiceModule>) -> Self {
        self.modules.insert(module);
        self
    }

    /// Replace the local module table.
    pub fn modules(mut self, modules: ModuleTable) -> Self {
        self.modules = modules;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Share an existing emitter, e.g. one already handed to local modules.
    pub fn emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn build(self) -> ProcessContext {
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TcpTransport::new(self.config.limits.max_frame_bytes)));
        let emitter = self
            .emitter
            .unwrap_or_else(|| EventEmitter::new(self.config.limits.event_channel_capacity));
        let server_id = self.config.node.resolve_id();

        info!(
            server_id = %server_id,
            transport = transport.name(),
            modules = ?self.modules.names(),
            peers = self.config.servers.len(),
            "Process context created"
        );

        ProcessContext {
            inner: Arc::new(Inner {
                server_id: StdRwLock::new(server_id),
                registry: Registry::new(),
                scheduler: RetryScheduler::new(),
                binder: ServiceBinder::new(),
                arbiter: Arbiter::new(self.modules.clone()),
                router: EventRouter::new(emitter.clone()),
                emitter,
                server: Mutex::new(None),
                accept_task: StdMutex::new(None),
                retries: Mutex::new(HashMap::new()),
                gates: StdMutex::new(HashMap::new()),
                modules: self.modules,
                hooks: self.hooks,
                transport,
                config: self.config,
            }),
        }
    }
}

struct Inner {
    config: Config,
    transport: Arc<dyn Transport>,
    modules: ModuleTable,
    hooks: Arc<dyn LifecycleHooks>,
    server_id: StdRwLock<String>,
    registry: Registry,
    scheduler: RetryScheduler,
    binder: ServiceBinder,
    arbiter: Arbiter,
    emitter: EventEmitter,
    router: EventRouter,
    server: Mutex<Option<RpcServer>>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
    /// One retry task per server id.
    retries: Mutex<HashMap<String, RetryTask>>,
    /// Serializes connection attempts per server id.
    gates: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Registry, supervisor and event router of one process.
#[derive(Clone)]
pub struct ProcessContext {
    inner: Arc<Inner>,
}

impl ProcessContext {
    pub fn builder(config: Config) -> ProcessContextBuilder {
        ProcessContextBuilder {
            config,
            transport: None,
            modules: ModuleTable::new(),
            hooks: Arc::new(NoopHooks),
            emitter: None,
        }
    }

    /// Current server id: the served id once `serve` succeeded.
    pub fn server_id(&self) -> String {
        self.inner
            .server_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Start the RPC server for `server_id` and connect to it.
    ///
    /// The process adopts `server_id` as its identity, serves the modules
    /// its descriptor lists, and registers itself through a self-connection
    /// so it is addressable like any peer. The self-connection never
    /// arbitrates and is never linked for events.
    pub async fn serve(&self, server_id: &str) -> Result<()> {
        let descriptor = self
            .inner
            .config
            .server(server_id)
            .cloned()
            .ok_or_else(|| Error::Configuration(server_id.to_string()))?;

        {
            let mut slot = self.inner.server.lock().await;
            if let Some(existing) = slot.as_ref() {
                if existing.server_id() == server_id {
                    return Ok(());
                }
                return Err(Error::Serve {
                    server_id: server_id.to_string(),
                    source: TransportError::AddressInUse(existing.dsn().to_string()),
                });
            }

            let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
            let server = RpcServer::start(
                self.inner.transport.as_ref(),
                server_id,
                &descriptor.transport,
                &self.inner.config.limits,
                accepted_tx,
            )
            .await
            .map_err(|source| Error::Serve {
                server_id: server_id.to_string(),
                source,
            })?;

            if let Err(e) = self
                .inner
                .binder
                .bind_local(&server, &self.inner.modules, &descriptor.modules)
                .await
            {
                server.stop().await;
                return Err(e.into());
            }

            *self
                .inner
                .server_id
                .write()
                .unwrap_or_else(|e| e.into_inner()) = server_id.to_string();

            info!("RPC server [{}] started at {}.", server_id, server.dsn());
            *slot = Some(server);
            self.spawn_accept_loop(accepted_rx);
        }

        self.inner.hooks.startup(server_id).await;
        self.connect(server_id, false).await
    }

    /// Link events of connections accepted by the RPC server.
    fn spawn_accept_loop(&self, mut accepted: mpsc::UnboundedReceiver<ConnectionHandle>) {
        let router = self.inner.router.clone();
        let task = tokio::spawn(async move {
            while let Some(connection) = accepted.recv().await {
                router.link(&connection).await;
            }
        });
        if let Some(previous) = self
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task)
        {
            previous.abort();
        }
    }

    /// DSN of the RPC server, if serving.
    pub async fn dsn(&self) -> Option<String> {
        self.inner
            .server
            .lock()
            .await
            .as_ref()
            .map(|s| s.dsn().to_string())
    }

    /// Publish a local event to subscribers and linked peers.
    pub fn publish(&self, topic: impl Into<String>, payload: impl Into<Bytes>) -> usize {
        self.inner.emitter.publish(topic, payload)
    }

    pub fn publish_json<T: Serialize>(
        &self,
        topic: impl Into<String>,
        value: &T,
    ) -> std::result::Result<usize, BusError> {
        self.inner.emitter.publish_json(topic, value)
    }

    /// Handle local and relayed events whose topic matches `filter`.
    pub async fn subscribe(&self, filter: impl Into<String>, handler: Box<dyn EventHandler>) {
        self.inner.emitter.subscribe(filter, handler).await;
    }

    /// Invoke `module.method`.
    ///
    /// A connected peer that binds the module is preferred; otherwise the
    /// local module serves the call.
    pub async fn invoke(&self, module: &str, method: &str, payload: Bytes) -> Result<Bytes> {
        let me = self.server_id();
        let providers = self.inner.binder.providers(module).await;

        if let Some(remote) = providers.iter().find(|p| p.peer_id() != me) {
            return Ok(remote.call(method, payload).await?);
        }
        if let Some(local) = self.inner.modules.get(module) {
            return Ok(local.invoke(method, payload).await?);
        }
        match providers.first() {
            Some(remote) => Ok(remote.call(method, payload).await?),
            None => Err(ServiceError::UnknownModule(module.to_string()).into()),
        }
    }

    /// Cancel retries, close every connection and stop the RPC server.
    pub async fn shutdown(&self) {
        let cancelled = self.inner.scheduler.cancel_all();
        self.inner.retries.lock().await.clear();
        self.inner.router.unlink_all().await;

        let connections = self.inner.registry.drain().await;
        for (_, connection) in &connections {
            self.inner.binder.unbind(connection.id()).await;
            connection.close();
        }

        if let Some(task) = self
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        if let Some(server) = self.inner.server.lock().await.take() {
            server.stop().await;
        }

        info!(
            server_id = %self.server_id(),
            connections = connections.len(),
            retries_cancelled = cancelled,
            "Process context shut down"
        );
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.inner.scheduler
    }

    pub fn binder(&self) -> &ServiceBinder {
        &self.inner.binder
    }

    pub fn arbiter(&self) -> &Arbiter {
        &self.inner.arbiter
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.inner.emitter
    }

    pub fn router(&self) -> &EventRouter {
        &self.inner.router
    }

    pub fn modules(&self) -> &ModuleTable {
        &self.inner.modules
    }

    /// Live retry task for `server_id`, if any.
    pub async fn retry_task(&self, server_id: &str) -> Option<RetryTask> {
        let retries = self.inner.retries.lock().await;
        retries
            .get(server_id)
            .filter(|task| self.inner.scheduler.is_active(task.task_id))
            .cloned()
    }
}
