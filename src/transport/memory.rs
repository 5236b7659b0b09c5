//! In-process transport.
//!
//! Every clone of a [`MemoryTransport`] shares one simulated network, so
//! several process contexts inside a single test binary can dial each other
//! by `host:port`. Refusals can be injected to exercise deferred retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{FramePipe, Listener, Transport, TransportError, TransportOptions, PIPE_CAPACITY};

/// First port handed out for `port: 0` binds.
const EPHEMERAL_PORT_START: u16 = 40_000;

#[derive(Default)]
struct Network {
    listeners: HashMap<String, mpsc::Sender<FramePipe>>,
    refusals: HashMap<String, usize>,
    dials: HashMap<String, usize>,
}

/// Shared in-memory network.
#[derive(Clone)]
pub struct MemoryTransport {
    network: Arc<Mutex<Network>>,
    next_port: Arc<AtomicU16>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            network: Arc::new(Mutex::new(Network::default())),
            next_port: Arc::new(AtomicU16::new(EPHEMERAL_PORT_START)),
        }
    }

    fn network(&self) -> std::sync::MutexGuard<'_, Network> {
        self.network.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `count` dials to `addr` fail as unreachable.
    pub fn refuse_next(&self, addr: &str, count: usize) {
        self.network().refusals.insert(addr.to_string(), count);
    }

    /// Number of dials attempted against `addr`, refused ones included.
    pub fn dial_count(&self, addr: &str) -> usize {
        self.network().dials.get(addr).copied().unwrap_or(0)
    }

    pub fn is_listening(&self, addr: &str) -> bool {
        self.network()
            .listeners
            .get(addr)
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn dial(&self, options: &TransportOptions) -> Result<FramePipe, TransportError> {
        let addr = options.addr();
        let listener = {
            let mut network = self.network();
            *network.dials.entry(addr.clone()).or_insert(0) += 1;

            if let Some(remaining) = network.refusals.get_mut(&addr) {
                if *remaining > 0 {
                    *remaining -= 1;
                    debug!(addr = %addr, remaining = *remaining, "Refusing injected dial");
                    return Err(TransportError::Unreachable(addr));
                }
            }

            network
                .listeners
                .get(&addr)
                .cloned()
                .ok_or_else(|| TransportError::Unreachable(addr.clone()))?
        };

        let (local, remote) = FramePipe::pair(format!("memory-client->{}", addr), addr.clone());
        listener
            .send(remote)
            .await
            .map_err(|_| TransportError::Unreachable(addr))?;
        Ok(local)
    }

    async fn bind(&self, options: &TransportOptions) -> Result<Listener, TransportError> {
        let port = if options.port == 0 {
            self.next_port.fetch_add(1, Ordering::SeqCst)
        } else {
            options.port
        };
        let addr = format!("{}:{}", options.host, port);

        let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
        {
            let mut network = self.network();
            if network.listeners.get(&addr).is_some_and(|l| !l.is_closed()) {
                return Err(TransportError::AddressInUse(addr));
            }
            network.listeners.insert(addr.clone(), tx);
        }

        debug!(addr = %addr, "Memory listener bound");
        let network = self.network.clone();
        let key = addr.clone();
        Ok(Listener::new(format!("memory://{}", addr), rx, move || {
            network
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .listeners
                .remove(&key);
        }))
    }
}
