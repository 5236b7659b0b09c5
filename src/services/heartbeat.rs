//! Heartbeat background service.
//!
//! Publishes a `heartbeat` event on a fixed interval. It is a singleton: when
//! a peer that also serves `heartbeat` is connected, arbitration stops the
//! local copy so only one process in the deployment beats.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{ServiceError, ServiceModule, Singleton};
use crate::bus::EventEmitter;

pub const HEARTBEAT_MODULE: &str = "heartbeat";
pub const HEARTBEAT_TOPIC: &str = "heartbeat";

/// Payload of a `heartbeat` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beat {
    pub source: String,
    pub sequence: u64,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Reply of the `status` method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatStatus {
    pub running: bool,
    pub beats: u64,
}

struct Running {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct HeartbeatModule {
    source: String,
    interval: Duration,
    emitter: EventEmitter,
    beats: Arc<AtomicU64>,
    running: Mutex<Option<Running>>,
}

impl HeartbeatModule {
    pub fn new(source: impl Into<String>, emitter: EventEmitter, interval: Duration) -> Self {
        Self {
            source: source.into(),
            interval,
            emitter,
            beats: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
        }
    }

    /// Start beating. Starting a running service is a no-op.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return;
        }

        let (stop, mut stop_rx) = watch::channel(false);
        let emitter = self.emitter.clone();
        let beats = self.beats.clone();
        let source = self.source.clone();
        let mut ticker = tokio::time::interval(self.interval);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sequence = beats.fetch_add(1, Ordering::SeqCst) + 1;
                        let beat = Beat {
                            source: source.clone(),
                            sequence,
                            at: chrono::Utc::now(),
                        };
                        if let Err(e) = emitter.publish_json(HEARTBEAT_TOPIC, &beat) {
                            debug!(error = %e, "Failed to encode heartbeat");
                        }
                    }
                    _ = stop_rx.wait_for(|stopped| *stopped) => break,
                }
            }
        });

        info!(source = %self.source, interval = ?self.interval, "Heartbeat started");
        *running = Some(Running { stop, task });
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::SeqCst)
    }

    fn status(&self) -> HeartbeatStatus {
        HeartbeatStatus {
            running: self.is_running(),
            beats: self.beats(),
        }
    }
}

#[async_trait]
impl ServiceModule for HeartbeatModule {
    fn name(&self) -> &str {
        HEARTBEAT_MODULE
    }

    async fn invoke(&self, method: &str, _payload: Bytes) -> Result<Bytes, ServiceError> {
        match method {
            "status" => Ok(Bytes::from(serde_json::to_vec(&self.status())?)),
            other => Err(ServiceError::UnknownMethod {
                module: HEARTBEAT_MODULE.to_string(),
                method: other.to_string(),
            }),
        }
    }

    fn as_singleton(&self) -> Option<&dyn Singleton> {
        Some(self)
    }
}

#[async_trait]
impl Singleton for HeartbeatModule {
    fn is_running(&self) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.as_ref().is_some_and(|r| !r.task.is_finished())
    }

    async fn stop(&self, graceful: bool) -> Result<(), ServiceError> {
        let taken = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(Running { stop, task }) = taken else {
            return Ok(());
        };

        if graceful {
            // The loop only observes the stop signal between beats.
            let _ = stop.send(true);
            task.await
                .map_err(|e| ServiceError::Failed(format!("heartbeat task failed: {}", e)))?;
        } else {
            task.abort();
        }

        info!(source = %self.source, graceful, beats = self.beats(), "Heartbeat stopped");
        Ok(())
    }
}
