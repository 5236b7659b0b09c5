//! In-process event emitter.
//!
//! Uses a tokio broadcast channel for pub/sub within a single process. Events
//! published locally and events relayed from peers share the same channel;
//! the [`Origin`](super::Origin) on each envelope tells them apart.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

use super::{dispatch_to_handlers, topic_matches, Envelope, EventHandler, Result};
use crate::config::DEFAULT_EVENT_CHANNEL_CAPACITY;

type HandlerGroup = Arc<RwLock<Vec<Box<dyn EventHandler>>>>;

/// Local publish/subscribe emitter.
///
/// Handlers are grouped by topic filter; each group has one consumer task
/// that dispatches matching envelopes to its handlers in publish order.
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<Arc<Envelope>>,
    groups: Arc<RwLock<HashMap<String, HandlerGroup>>>,
}

impl EventEmitter {
    /// Create an emitter with the given broadcast capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        debug!(capacity, "Event emitter initialized");
        Self {
            sender,
            groups: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Publish a locally originated event.
    ///
    /// Returns the number of receivers (local consumers and peer links) that
    /// saw the event.
    pub fn publish(&self, topic: impl Into<String>, payload: impl Into<Bytes>) -> usize {
        self.deliver(Envelope::local(topic, payload))
    }

    /// Publish a locally originated event with a JSON payload.
    pub fn publish_json<T: Serialize>(&self, topic: impl Into<String>, value: &T) -> Result<usize> {
        let payload = serde_json::to_vec(value)?;
        Ok(self.publish(topic, payload))
    }

    /// Put an envelope of any origin on the channel.
    pub fn deliver(&self, envelope: Envelope) -> usize {
        let topic = envelope.topic.clone();
        match self.sender.send(Arc::new(envelope)) {
            Ok(receivers) => {
                debug!(topic = %topic, receivers, "Event emitted");
                receivers
            }
            Err(_) => {
                debug!(topic = %topic, "Event emitted (no receivers)");
                0
            }
        }
    }

    /// Raw receiver for every envelope published after this call.
    pub fn receiver(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.sender.subscribe()
    }

    /// Stream of envelopes whose topic matches `filter`.
    ///
    /// Lagged gaps are logged and skipped.
    pub fn stream(&self, filter: impl Into<String>) -> impl Stream<Item = Arc<Envelope>> {
        let filter = filter.into();
        BroadcastStream::new(self.sender.subscribe()).filter_map(move |item| {
            let matched = match item {
                Ok(envelope) if topic_matches(&envelope.topic, &filter) => Some(envelope),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event stream lagged, skipped events");
                    None
                }
            };
            futures::future::ready(matched)
        })
    }

    /// Number of live receivers (consumer groups, streams and peer links).
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Register a handler for topics matching `filter`.
    ///
    /// The first handler for a filter starts that filter's consumer; events
    /// published after this call returns are delivered.
    pub async fn subscribe(&self, filter: impl Into<String>, handler: Box<dyn EventHandler>) -> usize {
        let filter = filter.into();
        let mut groups = self.groups.write().await;

        if let Some(group) = groups.get(&filter) {
            let mut handlers = group.write().await;
            handlers.push(handler);
            info!(filter = %filter, handler_count = handlers.len(), "Handler subscribed");
            return handlers.len();
        }

        let group: HandlerGroup = Arc::new(RwLock::new(vec![handler]));
        groups.insert(filter.clone(), group.clone());
        drop(groups);

        self.start_consumer(filter.clone(), group);
        info!(filter = %filter, handler_count = 1, "Handler subscribed");
        1
    }

    fn start_consumer(&self, filter: String, handlers: HandlerGroup) {
        let mut receiver = self.sender.subscribe();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if !topic_matches(&envelope.topic, &filter) {
                            continue;
                        }
                        dispatch_to_handlers(&handlers, &envelope).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!(filter = %filter, skipped = n, "Consumer lagged, skipped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(filter = %filter, "Emitter closed, stopping consumer");
                        break;
                    }
                }
            }
        });
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CHANNEL_CAPACITY)
    }
}
