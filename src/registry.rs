//! Registry table: connection state per server id.
//!
//! Holds at most one live connection handle per server id. Only the
//! connection supervisor in [`crate::context`] writes to it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::transport::ConnectionHandle;

/// Error types for registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Server '{0}' already has a live connection")]
    AlreadyConnected(String),
}

/// Connection state of one server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug)]
struct Entry {
    state: ConnectionState,
    handle: Option<ConnectionHandle>,
}

impl Entry {
    /// A closed handle reads as Disconnected before the drop watcher evicts it.
    fn state(&self) -> ConnectionState {
        match (&self.state, &self.handle) {
            (ConnectionState::Connected, Some(handle)) if handle.is_closed() => {
                ConnectionState::Disconnected
            }
            (state, _) => *state,
        }
    }
}

/// Thread-safe table of server id -> connection.
#[derive(Clone, Default)]
pub struct Registry {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `server_id` is connected.
    pub async fn has_connection(&self, server_id: &str) -> bool {
        self.state(server_id).await == ConnectionState::Connected
    }

    pub async fn state(&self, server_id: &str) -> ConnectionState {
        self.entries
            .read()
            .await
            .get(server_id)
            .map(Entry::state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub async fn get(&self, server_id: &str) -> Option<ConnectionHandle> {
        self.entries
            .read()
            .await
            .get(server_id)
            .and_then(|e| e.handle.clone())
    }

    /// Record that an attempt for `server_id` is in flight.
    ///
    /// Has no effect on a connected entry.
    pub async fn mark_connecting(&self, server_id: &str) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(server_id.to_string()).or_insert(Entry {
            state: ConnectionState::Disconnected,
            handle: None,
        });
        if entry.state() != ConnectionState::Connected {
            entry.state = ConnectionState::Connecting;
        }
    }

    /// Drop an in-flight marker after a failed attempt.
    pub async fn abandon(&self, server_id: &str) {
        let mut entries = self.entries.write().await;
        if entries
            .get(server_id)
            .is_some_and(|e| e.state == ConnectionState::Connecting)
        {
            entries.remove(server_id);
        }
    }

    /// Store the handle for `server_id` and mark it connected.
    ///
    /// Refuses to replace a live handle. A closed one is replaced.
    pub async fn set(&self, server_id: &str, handle: ConnectionHandle) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.get(server_id).and_then(|e| e.handle.as_ref()) {
            if !existing.is_closed() {
                return Err(RegistryError::AlreadyConnected(server_id.to_string()));
            }
        }

        info!(
            server_id = %server_id,
            connection_id = %handle.id(),
            "Registered connection"
        );
        entries.insert(
            server_id.to_string(),
            Entry {
                state: ConnectionState::Connected,
                handle: Some(handle),
            },
        );
        Ok(())
    }

    /// Remove `server_id`, returning its handle if it had one.
    pub async fn remove(&self, server_id: &str) -> Option<ConnectionHandle> {
        let removed = self.entries.write().await.remove(server_id)?;
        debug!(server_id = %server_id, "Removed registry entry");
        removed.handle
    }

    /// Remove `server_id` only if it still holds connection `connection_id`.
    pub async fn remove_if(&self, server_id: &str, connection_id: Uuid) -> bool {
        let mut entries = self.entries.write().await;
        let matches = entries
            .get(server_id)
            .and_then(|e| e.handle.as_ref())
            .is_some_and(|h| h.id() == connection_id);
        if matches {
            entries.remove(server_id);
            debug!(server_id = %server_id, connection_id = %connection_id, "Removed dropped connection");
        }
        matches
    }

    /// Connected server ids, sorted.
    pub async fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.state() == ConnectionState::Connected)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Take every stored handle, leaving the table empty.
    pub async fn drain(&self) -> Vec<(String, ConnectionHandle)> {
        self.entries
            .write()
            .await
            .drain()
            .filter_map(|(id, e)| e.handle.map(|h| (id, h)))
            .collect()
    }
}
