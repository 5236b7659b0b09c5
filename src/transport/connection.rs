//! Established peer connections.
//!
//! A [`ConnectionHandle`] is created once the handshake on a [`FramePipe`]
//! succeeded. It owns a driver task that reads inbound frames:
//! - `Reply` completes the pending `call` with the same id
//! - `Event` is re-emitted to event subscribers, tagged with the peer id
//! - `Call` is served by the connection's [`CallDispatcher`], if any
//!
//! Outbound frames share one ordered channel, so events sent by a single
//! task arrive in the order they were sent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{FramePipe, TransportError};
use crate::bus::Envelope;
use crate::config::ResourceLimits;
use crate::proto::{frame, reply, Frame};
use crate::services::ServiceError;

type PendingCalls = HashMap<u64, oneshot::Sender<Result<Bytes, TransportError>>>;

/// Serves module calls arriving on a connection.
#[async_trait]
pub trait CallDispatcher: Send + Sync {
    async fn dispatch(&self, module: &str, method: &str, payload: Bytes)
        -> Result<Bytes, ServiceError>;
}

/// What the other side announced during the handshake.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: String,
    pub local_id: String,
    pub modules: Vec<String>,
}

struct Inner {
    id: Uuid,
    peer: PeerInfo,
    remote: String,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    pending: Mutex<PendingCalls>,
    next_call: AtomicU64,
    events: broadcast::Sender<Envelope>,
    closed: watch::Sender<bool>,
    call_timeout: Duration,
    max_frame_bytes: usize,
}

impl Inner {
    fn sender(&self) -> Result<mpsc::Sender<Frame>, TransportError> {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(TransportError::Closed)
    }

    /// Reject frames the transport would refuse to write.
    fn admit(&self, frame: Frame) -> Result<Frame, TransportError> {
        let size = frame.encoded_len();
        if size > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                size,
                limit: self.max_frame_bytes,
            });
        }
        Ok(frame)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, PendingCalls> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark closed, drop the outbound sender and fail pending calls.
    /// Returns false if already closed.
    fn shut(&self) -> bool {
        let was_closed = self.closed.send_replace(true);
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        for (_, waiter) in self.pending().drain() {
            let _ = waiter.send(Err(TransportError::Closed));
        }
        !was_closed
    }
}

/// Cheaply cloneable handle to one live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer_id", &self.inner.peer.peer_id)
            .field("remote", &self.inner.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionHandle {
    /// Wrap a pipe whose handshake already completed and start its driver.
    pub fn establish(
        pipe: FramePipe,
        peer: PeerInfo,
        limits: &ResourceLimits,
        dispatcher: Option<Arc<dyn CallDispatcher>>,
    ) -> Self {
        let FramePipe { tx, rx, remote } = pipe;
        let (events, _) = broadcast::channel(limits.event_channel_capacity.max(1));
        let (closed, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            id: Uuid::new_v4(),
            peer,
            remote,
            outbound: Mutex::new(Some(tx)),
            pending: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(1),
            events,
            closed,
            call_timeout: limits.call_timeout(),
            max_frame_bytes: limits.max_frame_bytes,
        });

        debug!(
            connection_id = %inner.id,
            peer_id = %inner.peer.peer_id,
            remote = %inner.remote,
            "Connection established"
        );
        tokio::spawn(drive(inner.clone(), rx, dispatcher));

        Self { inner }
    }

    /// Unique id of this connection.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Server id of the other side.
    pub fn peer_id(&self) -> &str {
        &self.inner.peer.peer_id
    }

    /// Server id this side presented in the handshake.
    pub fn local_id(&self) -> &str {
        &self.inner.peer.local_id
    }

    /// Whether this process is talking to itself.
    pub fn is_self(&self) -> bool {
        self.inner.peer.peer_id == self.inner.peer.local_id
    }

    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    /// Modules the peer announced for remote invocation.
    pub fn peer_modules(&self) -> &[String] {
        &self.inner.peer.modules
    }

    pub fn announces(&self, module: &str) -> bool {
        self.inner.peer.modules.iter().any(|m| m == module)
    }

    /// Invoke `module.method` on the peer and wait for its reply.
    pub async fn call(
        &self,
        module: &str,
        method: &str,
        payload: Bytes,
    ) -> Result<Bytes, TransportError> {
        let id = self.inner.next_call.fetch_add(1, Ordering::SeqCst);
        let frame = self
            .inner
            .admit(Frame::call(id, module, method, payload.to_vec()))?;
        let (waiter, reply) = oneshot::channel();
        self.inner.pending().insert(id, waiter);

        if self.is_closed() {
            self.inner.pending().remove(&id);
            return Err(TransportError::Closed);
        }

        let sent = match self.inner.sender() {
            Ok(tx) => tx.send(frame).await.is_ok(),
            Err(_) => false,
        };
        if !sent {
            self.inner.pending().remove(&id);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(self.inner.call_timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.inner.pending().remove(&id);
                Err(TransportError::Timeout(self.inner.call_timeout))
            }
        }
    }

    /// Send an event to the peer.
    ///
    /// Events sent from one task are delivered in order. An event too large
    /// for one frame fails with `FrameTooLarge` and the connection stays up.
    pub async fn send_event(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let frame = self.inner.admit(Frame::event(
            &envelope.topic,
            envelope.payload.to_vec(),
            self.local_id(),
        ))?;
        let tx = self.inner.sender()?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    /// Receiver for events arriving from the peer.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Envelope> {
        self.inner.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once the connection is closed, by either side.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Close the connection. Closing twice is a no-op.
    pub fn close(&self) {
        if self.inner.shut() {
            info!(
                connection_id = %self.inner.id,
                peer_id = %self.inner.peer.peer_id,
                "Connection closed"
            );
        }
    }
}

async fn drive(
    inner: Arc<Inner>,
    mut rx: mpsc::Receiver<Frame>,
    dispatcher: Option<Arc<dyn CallDispatcher>>,
) {
    let mut closed = inner.closed.subscribe();

    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = closed.wait_for(|closed| *closed) => break,
        };

        let kind_name = frame.kind_name();
        match frame.kind {
            Some(frame::Kind::Reply(r)) => {
                let outcome = match r.outcome {
                    Some(reply::Outcome::Ok(payload)) => Ok(Bytes::from(payload)),
                    Some(reply::Outcome::Error(message)) => Err(TransportError::Remote(message)),
                    None => Err(TransportError::Remote("empty reply".to_string())),
                };
                match inner.pending().remove(&r.id) {
                    Some(waiter) => {
                        let _ = waiter.send(outcome);
                    }
                    None => debug!(call_id = r.id, "Reply for unknown call dropped"),
                }
            }
            Some(frame::Kind::Event(event)) => {
                let envelope = Envelope::from_peer(
                    inner.peer.peer_id.clone(),
                    event.topic,
                    Bytes::from(event.payload),
                );
                // No subscribers simply means the connection is not linked yet.
                let _ = inner.events.send(envelope);
            }
            Some(frame::Kind::Call(call)) => {
                let Ok(tx) = inner.sender() else { break };
                let dispatcher = dispatcher.clone();
                let inner = inner.clone();
                tokio::spawn(async move {
                    let outcome = match dispatcher {
                        Some(d) => d
                            .dispatch(&call.module, &call.method, Bytes::from(call.payload))
                            .await
                            .map(|b| b.to_vec())
                            .map_err(|e| e.to_string()),
                        None => Err(ServiceError::UnknownModule(call.module).to_string()),
                    };
                    let reply = inner
                        .admit(Frame::reply(call.id, outcome))
                        .unwrap_or_else(|e| Frame::reply(call.id, Err(e.to_string())));
                    let _ = tx.send(reply).await;
                });
            }
            _ => {
                warn!(
                    peer_id = %inner.peer.peer_id,
                    kind = kind_name,
                    "Unexpected frame after handshake"
                );
            }
        }
    }

    if inner.shut() {
        info!(
            connection_id = %inner.id,
            peer_id = %inner.peer.peer_id,
            "Connection dropped"
        );
    }
}

/// Dialing side of the handshake.
///
/// Sends `Hello` and waits for `Welcome` from `expected_id`.
pub async fn client_handshake(
    mut pipe: FramePipe,
    expected_id: &str,
    self_id: &str,
    secret: Option<&str>,
    limits: &ResourceLimits,
) -> Result<ConnectionHandle, TransportError> {
    pipe.tx
        .send(Frame::hello(self_id, secret.unwrap_or_default()))
        .await
        .map_err(|_| TransportError::Handshake("peer closed before hello".to_string()))?;

    let first = pipe
        .rx
        .recv()
        .await
        .ok_or_else(|| TransportError::Handshake("peer closed during handshake".to_string()))?;

    let kind_name = first.kind_name();
    match first.kind {
        Some(frame::Kind::Welcome(welcome)) => {
            if welcome.server_id != expected_id {
                return Err(TransportError::Handshake(format!(
                    "expected '{}' but reached '{}'",
                    expected_id, welcome.server_id
                )));
            }
            let peer = PeerInfo {
                peer_id: welcome.server_id,
                local_id: self_id.to_string(),
                modules: welcome.modules,
            };
            Ok(ConnectionHandle::establish(pipe, peer, limits, None))
        }
        Some(frame::Kind::Refused(refused)) => Err(TransportError::Refused {
            server_id: expected_id.to_string(),
            reason: refused.reason,
        }),
        _ => Err(TransportError::Handshake(format!(
            "expected welcome, got {}",
            kind_name
        ))),
    }
}
