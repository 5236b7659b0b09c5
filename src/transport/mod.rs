//! Transport layer for peer connections.
//!
//! A transport only moves [`Frame`]s: `dial` and `bind` produce
//! [`FramePipe`]s, and everything above (handshake, calls, events) is
//! transport-agnostic and lives in [`connection`] and [`server`].
//!
//! Supports:
//! - TCP: Standard network transport with length-prefixed frames (default)
//! - Memory: In-process network for single-process deployments and tests

pub mod codec;
pub mod connection;
pub mod memory;
pub mod server;
pub mod tcp;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::proto::Frame;

pub use connection::{CallDispatcher, ConnectionHandle};
pub use memory::MemoryTransport;
pub use server::RpcServer;
pub use tcp::TcpTransport;

/// Frames buffered per direction before senders wait.
pub const PIPE_CAPACITY: usize = 256;

/// Default handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Errors that can occur on a transport or connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Peer unreachable at {0}")]
    Unreachable(String),

    #[error("Connection refused by '{server_id}': {reason}")]
    Refused { server_id: String, reason: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Address {0} already in use")]
    AddressInUse(String),

    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Frame encode failed: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("Frame decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Connection closed")]
    Closed,
}

/// Addressing and authentication for one peer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Host to dial or bind.
    pub host: String,
    /// Port to dial or bind. Port 0 binds an ephemeral port.
    pub port: u16,
    /// Shared secret checked during the handshake.
    pub secret: Option<String>,
    /// Timeout for dial plus handshake.
    pub connect_timeout_ms: u64,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            secret: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl TransportOptions {
    /// Options for `host:port` with defaults for everything else.
    pub fn at(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Get the socket address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Bidirectional frame channel produced by a transport.
#[derive(Debug)]
pub struct FramePipe {
    /// Frames to send to the remote side.
    pub tx: mpsc::Sender<Frame>,
    /// Frames received from the remote side. Ends when the remote closes.
    pub rx: mpsc::Receiver<Frame>,
    /// Human-readable remote address for logging.
    pub remote: String,
}

impl FramePipe {
    /// Create two pipes wired to each other.
    pub fn pair(a_label: impl Into<String>, b_label: impl Into<String>) -> (FramePipe, FramePipe) {
        let (a_tx, b_rx) = mpsc::channel(PIPE_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(PIPE_CAPACITY);
        (
            FramePipe {
                tx: a_tx,
                rx: a_rx,
                remote: b_label.into(),
            },
            FramePipe {
                tx: b_tx,
                rx: b_rx,
                remote: a_label.into(),
            },
        )
    }
}

/// A bound listener yielding one pipe per accepted connection.
///
/// Dropping the listener stops accepting.
pub struct Listener {
    /// Address description, e.g. `tcp://127.0.0.1:7001`.
    pub dsn: String,
    pub incoming: mpsc::Receiver<FramePipe>,
    shutdown: Option<Box<dyn FnOnce() + Send>>,
}

impl Listener {
    pub fn new(
        dsn: impl Into<String>,
        incoming: mpsc::Receiver<FramePipe>,
        shutdown: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            dsn: dsn.into(),
            incoming,
            shutdown: Some(Box::new(shutdown)),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown();
        }
    }
}

/// Moves frames between processes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logging.
    fn name(&self) -> &'static str;

    /// Open a pipe to the peer at `options`.
    async fn dial(&self, options: &TransportOptions) -> Result<FramePipe, TransportError>;

    /// Start accepting pipes at `options`.
    async fn bind(&self, options: &TransportOptions) -> Result<Listener, TransportError>;
}
