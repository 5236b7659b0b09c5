//! Cross-process event router.
//!
//! Links the local [`EventEmitter`] to peer connections with two tasks per
//! link:
//! - outbound: forwards locally originated envelopes to the peer
//! - inbound: re-emits the peer's events locally, tagged with its id
//!
//! Only `Origin::Local` envelopes leave the process, so an event is never
//! echoed back to its source and never relayed from one peer to another.
//! Every connection gets an inbound task, but each peer id has a single
//! outbound task, so a publish reaches each peer at most once and in order
//! even when two connections to the same peer exist.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::EventEmitter;
use crate::transport::{ConnectionHandle, TransportError};

struct Link {
    connection: ConnectionHandle,
    inbound: JoinHandle<()>,
    outbound: Option<JoinHandle<()>>,
}

impl Link {
    fn abort(&self) {
        self.inbound.abort();
        if let Some(outbound) = &self.outbound {
            outbound.abort();
        }
    }
}

#[derive(Clone)]
pub struct EventRouter {
    emitter: EventEmitter,
    links: Arc<Mutex<HashMap<Uuid, Link>>>,
}

impl EventRouter {
    pub fn new(emitter: EventEmitter) -> Self {
        Self {
            emitter,
            links: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Link a connection's events with the local emitter.
    ///
    /// Returns false for self-connections and already linked connections.
    /// The link is removed automatically when the connection closes.
    pub async fn link(&self, connection: &ConnectionHandle) -> bool {
        if connection.is_self() {
            debug!(peer_id = %connection.peer_id(), "Not linking self-connection");
            return false;
        }

        let mut links = self.links.lock().await;
        if links.contains_key(&connection.id()) || connection.is_closed() {
            return false;
        }

        let has_outbound = links.values().any(|l| {
            l.connection.peer_id() == connection.peer_id() && l.outbound.is_some()
        });
        let outbound = (!has_outbound).then(|| self.spawn_outbound(connection.clone()));
        let inbound = self.spawn_inbound(connection.clone());

        links.insert(
            connection.id(),
            Link {
                connection: connection.clone(),
                inbound,
                outbound,
            },
        );
        drop(links);

        let router = self.clone();
        let watched = connection.clone();
        tokio::spawn(async move {
            watched.closed().await;
            router.unlink(watched.id()).await;
        });

        info!(
            peer_id = %connection.peer_id(),
            connection_id = %connection.id(),
            outbound = !has_outbound,
            "Linked peer events"
        );
        true
    }

    /// Stop both tasks of a link. Unknown ids are ignored.
    pub async fn unlink(&self, connection_id: Uuid) -> bool {
        let mut links = self.links.lock().await;
        let Some(link) = links.remove(&connection_id) else {
            return false;
        };
        link.abort();

        // Hand the outbound role to another live connection to the same peer.
        if link.outbound.is_some() {
            let peer_id = link.connection.peer_id();
            if let Some(successor) = links
                .values_mut()
                .find(|l| l.connection.peer_id() == peer_id && !l.connection.is_closed())
            {
                successor.outbound = Some(self.spawn_outbound(successor.connection.clone()));
                debug!(
                    peer_id = %peer_id,
                    connection_id = %successor.connection.id(),
                    "Outbound moved"
                );
            }
        }

        info!(
            peer_id = %link.connection.peer_id(),
            connection_id = %connection_id,
            "Unlinked peer events"
        );
        true
    }

    /// Whether any connection to `peer_id` is linked.
    pub async fn is_linked(&self, peer_id: &str) -> bool {
        self.links
            .lock()
            .await
            .values()
            .any(|l| l.connection.peer_id() == peer_id)
    }

    /// Linked peer ids, sorted and deduplicated.
    pub async fn linked_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .links
            .lock()
            .await
            .values()
            .map(|l| l.connection.peer_id().to_string())
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    /// Stop every link.
    pub async fn unlink_all(&self) {
        for (_, link) in self.links.lock().await.drain() {
            link.abort();
        }
    }

    fn spawn_outbound(&self, connection: ConnectionHandle) -> JoinHandle<()> {
        let mut local = self.emitter.receiver();
        tokio::spawn(async move {
            loop {
                match local.recv().await {
                    Ok(envelope) => {
                        if !envelope.origin.is_local() {
                            continue;
                        }
                        match connection.send_event(&envelope).await {
                            Ok(()) => {}
                            Err(e @ TransportError::FrameTooLarge { .. }) => {
                                warn!(
                                    peer_id = %connection.peer_id(),
                                    topic = %envelope.topic,
                                    error = %e,
                                    "Event not forwarded"
                                );
                            }
                            Err(e) => {
                                debug!(
                                    peer_id = %connection.peer_id(),
                                    error = %e,
                                    "Outbound link closed"
                                );
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(
                            peer_id = %connection.peer_id(),
                            skipped = n,
                            "Outbound link lagged, skipped events"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_inbound(&self, connection: ConnectionHandle) -> JoinHandle<()> {
        let mut remote = connection.subscribe_events();
        let emitter = self.emitter.clone();
        tokio::spawn(async move {
            loop {
                match remote.recv().await {
                    Ok(envelope) => {
                        emitter.deliver(envelope);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(
                            peer_id = %connection.peer_id(),
                            skipped = n,
                            "Inbound link lagged, skipped events"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
