//! Connection supervisor.
//!
//! `connect` establishes at most one connection per server id. A successful
//! attempt runs strictly in order: registry, module binding, arbitration,
//! event link, retry cancellation. A deferred attempt that fails hands the
//! id to a single retry task, which calls [`ProcessContext::try_connect`]
//! until it succeeds.

use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Inner, ProcessContext};
use crate::config::ServerDescriptor;
use crate::error::{Error, Result};
use crate::schedule::{RetryTask, TaskSpec};
use crate::transport::connection::client_handshake;
use crate::transport::{ConnectionHandle, TransportError};

impl ProcessContext {
    /// Whether a connection to `server_id` is registered.
    pub async fn has_connect(&self, server_id: &str) -> bool {
        self.inner.registry.has_connection(server_id).await
    }

    /// Connect to the configured peer `server_id`.
    ///
    /// Returns immediately if already connected. With `defer`, a transport
    /// failure schedules background retries and returns `Ok(())`; without
    /// it, the failure is returned and nothing is retried. Unknown ids fail
    /// with [`Error::Configuration`] either way.
    pub async fn connect(&self, server_id: &str, defer: bool) -> Result<()> {
        let descriptor = self.descriptor(server_id)?;
        if self.has_connect(server_id).await {
            return Ok(());
        }

        match self.try_connect(&descriptor).await {
            Err(Error::Connection { source, .. }) if defer => {
                debug!(server_id = %server_id, error = %source, "Connection deferred");
                self.schedule_retry(descriptor).await;
                Ok(())
            }
            other => other,
        }
    }

    /// Connect to every configured peer except this process.
    ///
    /// All attempts run concurrently and all of them complete; every failure
    /// is reported in [`Error::ConnectAll`].
    pub async fn connect_all(&self, defer: bool) -> Result<()> {
        let me = self.server_id();
        let ids: Vec<String> = self
            .inner
            .config
            .server_ids()
            .filter(|id| *id != me)
            .map(str::to_string)
            .collect();

        let results = futures::future::join_all(ids.iter().map(|id| self.connect(id, defer))).await;

        let failures: Vec<(String, Error)> = ids
            .into_iter()
            .zip(results)
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            warn!(failed = failures.len(), "Some peer connections failed");
            Err(Error::ConnectAll(failures))
        }
    }

    /// Close the connection to `server_id` and cancel its retries.
    ///
    /// Returns false if there was no connection.
    pub async fn disconnect(&self, server_id: &str) -> bool {
        let gate = self.gate(server_id);
        let _attempt = gate.lock().await;

        self.cancel_retry(server_id).await;
        let Some(connection) = self.inner.registry.remove(server_id).await else {
            return false;
        };
        connection.close();
        self.forget(server_id, &connection).await;
        info!("RPC server [{}] disconnected.", server_id);
        true
    }

    /// One connection attempt, without scheduling retries.
    ///
    /// Serialized per server id; an attempt that finds the id connected
    /// returns `Ok(())`.
    pub(crate) async fn try_connect(&self, descriptor: &ServerDescriptor) -> Result<()> {
        let server_id = descriptor.id.as_str();
        let gate = self.gate(server_id);
        let _attempt = gate.lock().await;

        if self.inner.registry.has_connection(server_id).await {
            self.cancel_retry(server_id).await;
            return Ok(());
        }
        if let Some(stale) = self.inner.registry.get(server_id).await {
            // Closed, but the drop watcher has not run yet.
            self.handle_drop(server_id, &stale).await;
        }

        self.inner.registry.mark_connecting(server_id).await;
        let connection = match self.open(descriptor).await {
            Ok(connection) => connection,
            Err(source) => {
                self.inner.registry.abandon(server_id).await;
                return Err(Error::Connection {
                    server_id: server_id.to_string(),
                    source,
                });
            }
        };

        if let Err(e) = self.inner.registry.set(server_id, connection.clone()).await {
            connection.close();
            return Err(e.into());
        }

        let binding = self
            .inner
            .binder
            .bind_remote(&connection, &descriptor.modules)
            .await;
        let bound = self.inner.binder.bound_modules(connection.id()).await;

        // Stop failures never fail the connect.
        let arbitration = self
            .inner
            .arbiter
            .arbitrate(server_id, connection.local_id(), &bound)
            .await;
        for error in arbitration.errors {
            self.inner
                .hooks
                .arbitration_failed(server_id, &Error::from(error))
                .await;
        }

        self.inner.router.link(&connection).await;
        self.cancel_retry(server_id).await;
        self.watch_drop(server_id, &connection);

        self.inner.hooks.peer_connected(server_id, &bound).await;
        info!("RPC server [{}] connected.", server_id);

        binding.map(|_| ()).map_err(Error::from)
    }

    /// Dial and handshake within the connect timeout.
    async fn open(&self, descriptor: &ServerDescriptor) -> std::result::Result<ConnectionHandle, TransportError> {
        let options = &descriptor.transport;
        let self_id = self.server_id();
        let timeout = options.connect_timeout();

        let attempt = async {
            let pipe = self.inner.transport.dial(options).await?;
            client_handshake(
                pipe,
                &descriptor.id,
                &self_id,
                options.secret.as_deref(),
                &self.inner.config.limits,
            )
            .await
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    /// Ensure exactly one live retry task for the descriptor's id.
    async fn schedule_retry(&self, descriptor: ServerDescriptor) {
        let server_id = descriptor.id.clone();
        let mut retries = self.inner.retries.lock().await;

        if let Some(task) = retries.get(&server_id) {
            if self.inner.scheduler.is_active(task.task_id) {
                return;
            }
        }
        if self.inner.registry.has_connection(&server_id).await {
            return;
        }

        let spec = TaskSpec::from_retry(format!("connect-{}", server_id), &self.inner.config.retry);
        let interval = spec.repeat;
        let owner: Weak<Inner> = Arc::downgrade(&self.inner);
        let descriptor = Arc::new(descriptor);

        let task_id = self.inner.scheduler.create(spec, move || {
            let owner = owner.clone();
            let descriptor = descriptor.clone();
            async move {
                let Some(inner) = owner.upgrade() else {
                    return;
                };
                let context = ProcessContext { inner };
                match context.try_connect(&descriptor).await {
                    Ok(()) => {}
                    Err(Error::Connection { source, .. }) => {
                        debug!(server_id = %descriptor.id, error = %source, "Retry attempt failed");
                    }
                    Err(e) => {
                        warn!(server_id = %descriptor.id, error = %e, "Retry connected with errors");
                    }
                }
            }
        });

        info!(
            server_id = %server_id,
            task_id = %task_id,
            interval = ?interval,
            "Scheduled connection retry"
        );
        retries.insert(
            server_id.clone(),
            RetryTask {
                server_id,
                task_id,
                interval,
                created_at: chrono::Utc::now(),
            },
        );
    }

    async fn cancel_retry(&self, server_id: &str) {
        if let Some(task) = self.inner.retries.lock().await.remove(server_id) {
            if self.inner.scheduler.cancel(task.task_id) {
                debug!(server_id = %server_id, task_id = %task.task_id, "Cancelled connection retry");
            }
        }
    }

    /// Clean up after `connection` closes, unless it was replaced meanwhile.
    ///
    /// Dropped peers are not reconnected automatically.
    fn watch_drop(&self, server_id: &str, connection: &ConnectionHandle) {
        let owner = Arc::downgrade(&self.inner);
        let server_id = server_id.to_string();
        let connection = connection.clone();

        tokio::spawn(async move {
            connection.closed().await;
            let Some(inner) = owner.upgrade() else {
                return;
            };
            let context = ProcessContext { inner };
            context.handle_drop(&server_id, &connection).await;
        });
    }

    async fn handle_drop(&self, server_id: &str, connection: &ConnectionHandle) {
        if !self
            .inner
            .registry
            .remove_if(server_id, connection.id())
            .await
        {
            return;
        }
        self.forget(server_id, connection).await;
        warn!("RPC server [{}] disconnected.", server_id);
    }

    /// Drop the link, bindings and suspensions of a removed connection.
    async fn forget(&self, server_id: &str, connection: &ConnectionHandle) {
        self.inner.router.unlink(connection.id()).await;
        self.inner.binder.unbind(connection.id()).await;
        let released = self.inner.arbiter.release(server_id).await;
        self.inner
            .hooks
            .peer_disconnected(server_id, &released)
            .await;
    }

    fn descriptor(&self, server_id: &str) -> Result<ServerDescriptor> {
        self.inner
            .config
            .server(server_id)
            .cloned()
            .ok_or_else(|| Error::Configuration(server_id.to_string()))
    }

    fn gate(&self, server_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .gates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(server_id.to_string())
            .or_default()
            .clone()
    }

    /// Connection id registered for `server_id`.
    pub async fn connection_id(&self, server_id: &str) -> Option<Uuid> {
        self.inner.registry.get(server_id).await.map(|c| c.id())
    }
}
