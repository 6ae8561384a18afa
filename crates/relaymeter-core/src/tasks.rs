//! Bounded pool for detached background work
//!
//! Billing commits and notifications outlive the request that started
//! them. They run here instead of on bare `tokio::spawn` so concurrency
//! stays bounded and tests (or shutdown) can wait for them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Concurrency-limited, awaitable set of background tasks
#[derive(Clone)]
pub struct TaskPool {
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
}

impl TaskPool {
    /// Create a pool running at most `max_concurrency` tasks at once
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Submit a task; it starts once a permit is free
    pub fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tracing::warn!(task = name, "task pool closed, dropping task");
                return None;
            };
            Some(task.await)
        })
    }

    /// Submit a task that is abandoned when `deadline` elapses after it starts
    ///
    /// Resolves to `None` when the task was abandoned.
    pub fn spawn_with_deadline<F>(
        &self,
        name: &'static str,
        deadline: Duration,
        task: F,
    ) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tracing::warn!(task = name, "task pool closed, dropping task");
                return None;
            };
            if let Ok(output) = tokio::time::timeout(deadline, task).await {
                Some(output)
            } else {
                tracing::warn!(
                    task = name,
                    deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                    "background task abandoned after deadline"
                );
                None
            }
        })
    }

    /// Number of tasks submitted and not yet finished
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait until every task submitted so far has finished
    ///
    /// Tasks submitted while waiting are awaited too; the pool accepts new
    /// work again afterwards.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("pending", &self.tracker.len())
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}
