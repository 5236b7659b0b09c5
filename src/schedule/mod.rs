//! Retry scheduler.
//!
//! Runs a callback repeatedly until the task is cancelled. Delays between
//! runs come from `backon` builders: a constant interval by default, or an
//! exponential curve capped at `max_repeat` when one is set.
//!
//! Cancellation is cooperative. A callback may cancel its own task; the run
//! in progress completes and no further run starts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder, ExponentialBuilder};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RetryConfig;

pub type TaskId = Uuid;

/// When and how often a task runs.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Label for logs, e.g. `connect-rpc-1`.
    pub salt: String,
    pub start_at: Instant,
    /// Delay between runs (initial delay when growing exponentially).
    pub repeat: Duration,
    /// Ceiling for exponential growth. `None` keeps the delay fixed.
    pub max_repeat: Option<Duration>,
    /// Stop after this many runs. `None` runs until cancelled.
    pub max_runs: Option<usize>,
}

impl TaskSpec {
    /// Run now, then every `repeat`.
    pub fn every(salt: impl Into<String>, repeat: Duration) -> Self {
        Self {
            salt: salt.into(),
            start_at: Instant::now(),
            repeat,
            max_repeat: None,
            max_runs: None,
        }
    }

    /// Task spec following a configured retry policy.
    pub fn from_retry(salt: impl Into<String>, retry: &RetryConfig) -> Self {
        Self {
            max_repeat: retry.max_interval(),
            max_runs: retry.max_attempts,
            ..Self::every(salt, retry.interval())
        }
    }

    pub fn starting_at(mut self, start_at: Instant) -> Self {
        self.start_at = start_at;
        self
    }

    pub fn with_max_repeat(mut self, max_repeat: Duration) -> Self {
        self.max_repeat = Some(max_repeat);
        self
    }

    pub fn with_max_runs(mut self, max_runs: usize) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    /// Delays between consecutive runs.
    fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        match self.max_repeat {
            Some(max) if max > self.repeat => Box::new(
                ExponentialBuilder::default()
                    .with_min_delay(self.repeat)
                    .with_max_delay(max)
                    .with_max_times(usize::MAX)
                    .build(),
            ),
            _ => Box::new(
                ConstantBuilder::default()
                    .with_delay(self.repeat)
                    .with_max_times(usize::MAX)
                    .build(),
            ),
        }
    }

    /// Delay used once the backoff iterator is exhausted.
    fn fallback_delay(&self) -> Duration {
        self.max_repeat
            .filter(|max| *max > self.repeat)
            .unwrap_or(self.repeat)
    }
}

/// Per-server retry bookkeeping kept by the connection supervisor.
#[derive(Debug, Clone)]
pub struct RetryTask {
    pub server_id: String,
    pub task_id: TaskId,
    pub interval: Duration,
    pub created_at: DateTime<Utc>,
}

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub created: u64,
    pub cancelled: u64,
    pub active: usize,
}

struct ScheduledTask {
    salt: String,
    cancel: watch::Sender<bool>,
    // Never aborted; cancellation goes through `cancel`.
    _handle: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    tasks: Mutex<HashMap<TaskId, ScheduledTask>>,
    created: AtomicU64,
    cancelled: AtomicU64,
}

impl Inner {
    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, ScheduledTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone, Default)]
pub struct RetryScheduler {
    inner: Arc<Inner>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `callback` per `spec` and return the task id.
    pub fn create<F, Fut>(&self, spec: TaskSpec, callback: F) -> TaskId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (cancel, cancelled) = watch::channel(false);
        let salt = spec.salt.clone();

        // Hold the table lock across spawn so a callback that cancels its own
        // task always finds the entry.
        let mut tasks = self.inner.tasks();
        let handle = tokio::spawn(run(
            id,
            spec,
            callback,
            cancelled,
            Arc::downgrade(&self.inner),
        ));
        tasks.insert(
            id,
            ScheduledTask {
                salt: salt.clone(),
                cancel,
                _handle: handle,
            },
        );
        drop(tasks);

        self.inner.created.fetch_add(1, Ordering::SeqCst);
        debug!(task_id = %id, salt = %salt, "Task scheduled");
        id
    }

    /// Cancel a task. Unknown or already cancelled ids are ignored.
    pub fn cancel(&self, id: TaskId) -> bool {
        let Some(task) = self.inner.tasks().remove(&id) else {
            return false;
        };
        let _ = task.cancel.send(true);
        self.inner.cancelled.fetch_add(1, Ordering::SeqCst);
        debug!(task_id = %id, salt = %task.salt, "Task cancelled");
        true
    }

    /// Whether `id` is scheduled and not cancelled or exhausted.
    pub fn is_active(&self, id: TaskId) -> bool {
        self.inner
            .tasks()
            .get(&id)
            .is_some_and(|t| !*t.cancel.borrow())
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            created: self.inner.created.load(Ordering::SeqCst),
            cancelled: self.inner.cancelled.load(Ordering::SeqCst),
            active: self.inner.tasks().len(),
        }
    }

    /// Cancel every task.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<TaskId> = self.inner.tasks().keys().copied().collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }
}

async fn run<F, Fut>(
    id: TaskId,
    spec: TaskSpec,
    callback: F,
    mut cancelled: watch::Receiver<bool>,
    owner: Weak<Inner>,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::select! {
        _ = tokio::time::sleep_until(spec.start_at) => {}
        _ = cancelled.wait_for(|c| *c) => return,
    }

    let mut delays = spec.delays();
    let mut runs = 0usize;

    loop {
        if *cancelled.borrow() {
            return;
        }

        callback().await;
        runs += 1;

        if *cancelled.borrow() {
            return;
        }

        if spec.max_runs.is_some_and(|max| runs >= max) {
            if let Some(owner) = owner.upgrade() {
                owner.tasks().remove(&id);
            }
            info!(task_id = %id, salt = %spec.salt, runs, "Task exhausted its runs");
            return;
        }

        let delay = delays.next().unwrap_or_else(|| spec.fallback_delay());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled.wait_for(|c| *c) => return,
        }
    }
}
