//! Local pub/sub and cross-process event routing.
//!
//! This module contains:
//! - `Envelope` / `Origin`: events as they travel through a process
//! - `EventHandler` trait: For processing events
//! - `EventEmitter`: In-process broadcast channel (`channel`)
//! - `EventRouter`: Links the emitter to peer connections (`router`)

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

pub mod channel;
pub mod dispatch;
pub mod router;

pub use channel::EventEmitter;
pub use dispatch::dispatch_to_handlers;
pub use router::EventRouter;

/// Topic filter that matches every topic.
pub const WILDCARD_TOPIC: &str = "#";

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Where an event entered this process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Published by this process.
    Local,
    /// Received from the named peer.
    Peer(String),
}

impl Origin {
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Local)
    }
}

/// An event inside a process.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: String,
    pub payload: Bytes,
    pub origin: Origin,
}

impl Envelope {
    pub fn local(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            origin: Origin::Local,
        }
    }

    pub fn from_peer(
        peer_id: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            origin: Origin::Peer(peer_id.into()),
        }
    }

    /// Decode the payload as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Handler for processing events from the emitter.
pub trait EventHandler: Send + Sync {
    /// Process an event.
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<()>>;
}

/// Check if a topic matches a filter pattern.
///
/// Matching rules:
/// - "#" matches all topics
/// - Exact match: "orders" matches "orders"
/// - Hierarchical: "orders" matches "orders.items" (prefix match with dot separator)
pub fn topic_matches(topic: &str, filter: &str) -> bool {
    if filter == WILDCARD_TOPIC {
        return true;
    }
    if topic == filter {
        return true;
    }
    topic.starts_with(filter) && topic[filter.len()..].starts_with('.')
}
