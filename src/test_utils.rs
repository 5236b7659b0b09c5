//! Test utilities and mock implementations.
//!
//! Provides handlers and service modules that record what happened to them,
//! for tests that exercise the emitter, binder and arbitration without real
//! workloads.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::bus::{BusError, Envelope, EventHandler};
use crate::lifecycle::LifecycleHooks;
use crate::services::{ServiceError, ServiceModule, Singleton};

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll an async `condition` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Handler that counts envelopes.
pub struct CountingHandler {
    count: Arc<AtomicUsize>,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn count(&self) -> Arc<AtomicUsize> {
        self.count.clone()
    }
}

impl Default for CountingHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CountingHandler {
    fn handle(&self, _envelope: Arc<Envelope>) -> BoxFuture<'static, Result<(), BusError>> {
        let count = self.count.clone();
        Box::pin(async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Handler that keeps every envelope it sees.
pub struct RecordingHandler {
    seen: Arc<Mutex<Vec<Arc<Envelope>>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn seen(&self) -> Arc<Mutex<Vec<Arc<Envelope>>>> {
        self.seen.clone()
    }
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for RecordingHandler {
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, Result<(), BusError>> {
        let seen = self.seen.clone();
        Box::pin(async move {
            if let Ok(mut seen) = seen.lock() {
                seen.push(envelope);
            }
            Ok(())
        })
    }
}

/// Service module that counts stop signals and can refuse to stop.
pub struct MockSingleton {
    name: String,
    running: AtomicBool,
    refuse_stop: AtomicBool,
    stops: Arc<AtomicUsize>,
}

impl MockSingleton {
    pub fn running(name: &str) -> Self {
        Self {
            name: name.to_string(),
            running: AtomicBool::new(true),
            refuse_stop: AtomicBool::new(false),
            stops: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_refuse_stop(&self, refuse: bool) {
        self.refuse_stop.store(refuse, Ordering::SeqCst);
    }

    /// Number of stop signals received (including refused ones).
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceModule for MockSingleton {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, method: &str, payload: Bytes) -> Result<Bytes, ServiceError> {
        match method {
            "ping" => Ok(payload),
            other => Err(ServiceError::UnknownMethod {
                module: self.name.clone(),
                method: other.to_string(),
            }),
        }
    }

    fn as_singleton(&self) -> Option<&dyn Singleton> {
        Some(self)
    }
}

#[async_trait]
impl Singleton for MockSingleton {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self, _graceful: bool) -> Result<(), ServiceError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.refuse_stop.load(Ordering::SeqCst) {
            return Err(ServiceError::Failed(format!("{} is busy", self.name)));
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Life-cycle hooks that record every callback as a string.
#[derive(Default)]
pub struct RecordingHooks {
    calls: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl LifecycleHooks for RecordingHooks {
    async fn startup(&self, server_id: &str) {
        self.record(format!("startup:{}", server_id));
    }

    async fn peer_connected(&self, server_id: &str, modules: &[String]) {
        self.record(format!("connected:{}:{}", server_id, modules.join(",")));
    }

    async fn arbitration_failed(&self, server_id: &str, error: &crate::error::Error) {
        let module = match error {
            crate::error::Error::Arbitration { module, .. } => module.as_str(),
            _ => "",
        };
        self.record(format!("arbitration_failed:{}:{}", server_id, module));
    }

    async fn peer_disconnected(&self, server_id: &str, released: &[String]) {
        self.record(format!("disconnected:{}:{}", server_id, released.join(",")));
    }
}
