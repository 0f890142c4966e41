//! Background task scheduler for tagged, cancellable jobs.
//!
//! Tasks are identified by a human-readable name and grouped by a tag (for
//! indexing jobs, the conversation id). The scheduler tracks what is running
//! and keeps a bounded history of finished tasks.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Finished tasks kept for inspection.
const FINISHED_HISTORY: usize = 64;

/// A task that is still running.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: Uuid,
    pub name: String,
    pub tag: String,
    pub started_at: DateTime<Utc>,
}

/// Terminal state of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum TaskState {
    Completed,
    Failed(String),
    Cancelled,
}

/// A task that has finished, successfully or not.
#[derive(Debug, Clone, Serialize)]
pub struct FinishedTask {
    pub info: TaskInfo,
    pub finished_at: DateTime<Utc>,
    pub state: TaskState,
}

struct RunningTask {
    info: TaskInfo,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Registry {
    running: HashMap<Uuid, RunningTask>,
    finished: VecDeque<FinishedTask>,
}

struct Inner {
    registry: Mutex<Registry>,
    root: CancellationToken,
    idle: Notify,
}

/// Runs and tracks tagged background tasks.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("running", &self.list_running().len())
            .finish_non_exhaustive()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                root: CancellationToken::new(),
                idle: Notify::new(),
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A panicking task cannot leave the registry half-updated.
        self.inner
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Spawn `work` on the tokio runtime under `name` and `tag`.
    ///
    /// The work receives a token that fires on [`cancel`](Self::cancel),
    /// [`cancel_all`](Self::cancel_all), or scheduler shutdown.
    pub fn run_tagged<F, Fut, T>(&self, name: impl Into<String>, tag: impl Into<String>, work: F) -> Uuid
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let info = TaskInfo {
            id: Uuid::new_v4(),
            name: name.into(),
            tag: tag.into(),
            started_at: Utc::now(),
        };
        let id = info.id;
        let cancel = self.inner.root.child_token();
        let fut = work(cancel.clone());

        self.registry().running.insert(
            id,
            RunningTask {
                info: info.clone(),
                cancel: cancel.clone(),
            },
        );
        tracing::debug!(task = %info.name, tag = %info.tag, "Task started");

        let scheduler = self.clone();
        tokio::spawn(async move {
            // The work runs in its own task so a panic still reaches `finish`.
            let state = match tokio::spawn(fut).await {
                Ok(Ok(_)) if cancel.is_cancelled() => TaskState::Cancelled,
                Ok(Ok(_)) => TaskState::Completed,
                Ok(Err(Error::Cancelled)) => TaskState::Cancelled,
                Ok(Err(err)) => TaskState::Failed(err.to_string()),
                Err(err) if err.is_panic() => TaskState::Failed("task panicked".to_string()),
                Err(err) => TaskState::Failed(err.to_string()),
            };
            scheduler.finish(id, state);
        });

        id
    }

    fn finish(&self, id: Uuid, state: TaskState) {
        let mut registry = self.registry();
        let Some(task) = registry.running.remove(&id) else {
            return;
        };

        match &state {
            TaskState::Completed => {
                tracing::debug!(task = %task.info.name, tag = %task.info.tag, "Task completed");
            }
            TaskState::Cancelled => {
                tracing::info!(task = %task.info.name, tag = %task.info.tag, "Task cancelled");
            }
            TaskState::Failed(reason) => {
                tracing::warn!(task = %task.info.name, tag = %task.info.tag, "Task failed: {reason}");
            }
        }

        if registry.finished.len() >= FINISHED_HISTORY {
            registry.finished.pop_front();
        }
        registry.finished.push_back(FinishedTask {
            info: task.info,
            finished_at: Utc::now(),
            state,
        });
        let idle = registry.running.is_empty();
        drop(registry);

        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    /// Tasks currently running.
    pub fn list_running(&self) -> Vec<TaskInfo> {
        self.registry()
            .running
            .values()
            .map(|task| task.info.clone())
            .collect()
    }

    /// Whether a task with this tag is running.
    pub fn is_running(&self, tag: &str) -> bool {
        self.registry()
            .running
            .values()
            .any(|task| task.info.tag == tag)
    }

    /// Recently finished tasks, oldest first.
    pub fn list_finished(&self) -> Vec<FinishedTask> {
        self.registry().finished.iter().cloned().collect()
    }

    /// Cancel every running task carrying `tag`. Returns how many were signalled.
    pub fn cancel(&self, tag: &str) -> usize {
        let registry = self.registry();
        let mut count = 0;
        for task in registry.running.values().filter(|task| task.info.tag == tag) {
            task.cancel.cancel();
            count += 1;
        }
        count
    }

    /// Cancel all running tasks. Tasks started afterwards are unaffected.
    pub fn cancel_all(&self) {
        for task in self.registry().running.values() {
            task.cancel.cancel();
        }
    }

    /// Cancel everything, now and in the future.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
    }

    /// Wait until no task is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.registry().running.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
