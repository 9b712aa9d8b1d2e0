//! Worker pool that runs response callbacks off the session I/O path.

use crate::config::WorkerSettings;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{debug, error};

/// Unit of work run by the pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    settings: WorkerSettings,
    queues: Vec<flume::Sender<Task>>,
    next: usize,
}

/// Bounded set of queues drained by long-lived worker tasks.
///
/// Tasks that find their queue full, or a pool that is disabled, run on a
/// freshly spawned tokio task instead. The pool can be resized at runtime
/// with [`TaskPool::reconfigure`].
pub struct TaskPool {
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskPool")
            .field("settings", &state.settings)
            .field("queues", &state.queues.len())
            .finish()
    }
}

impl TaskPool {
    /// Create a pool and start its workers.
    ///
    /// Must be called from within a tokio runtime when `settings` enables
    /// pooling.
    #[must_use]
    pub fn new(settings: WorkerSettings) -> Self {
        Self {
            state: Mutex::new(PoolState {
                settings,
                queues: spawn_workers(settings),
                next: 0,
            }),
        }
    }

    /// Create a pool with no workers; every task gets its own tokio task.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            state: Mutex::new(PoolState {
                settings: WorkerSettings {
                    size: 0,
                    queue_len: 0,
                    queue_number: 0,
                },
                queues: Vec::new(),
                next: 0,
            }),
        }
    }

    /// Current sizing.
    #[must_use]
    pub fn settings(&self) -> WorkerSettings {
        self.state.lock().settings
    }

    /// Replace the worker set. Tasks already queued on the old workers still
    /// run; those workers exit once their queue drains.
    pub fn reconfigure(&self, settings: WorkerSettings) {
        let mut state = self.state.lock();
        if state.settings == settings && (state.queues.is_empty() != settings.is_pooled()) {
            return;
        }

        debug!("reconfiguring callback workers: {:?}", settings);
        state.queues = spawn_workers(settings);
        state.settings = settings;
        state.next = 0;
    }

    /// Schedule `task`.
    pub fn submit(&self, task: Task) {
        let overflow = {
            let mut state = self.state.lock();
            if state.queues.is_empty() {
                Some(task)
            } else {
                let index = state.next % state.queues.len();
                state.next = state.next.wrapping_add(1);
                match state.queues[index].try_send(task) {
                    Ok(()) => None,
                    Err(flume::TrySendError::Full(task) | flume::TrySendError::Disconnected(task)) => {
                        Some(task)
                    }
                }
            }
        };

        if let Some(task) = overflow {
            tokio::spawn(async move { run(task) });
        }
    }
}

fn run(task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("response callback panicked");
    }
}

fn spawn_workers(settings: WorkerSettings) -> Vec<flume::Sender<Task>> {
    if !settings.is_pooled() {
        return Vec::new();
    }

    let queue_number = settings.queue_number.max(1);
    let per_queue = settings.size.div_ceil(queue_number);

    (0..queue_number)
        .map(|_| {
            let (tx, rx) = flume::bounded::<Task>(settings.queue_len.max(1));
            for _ in 0..per_queue {
                let rx = rx.clone();
                tokio::spawn(async move {
                    while let Ok(task) = rx.recv_async().await {
                        run(task);
                    }
                });
            }
            tx
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn run_tasks(pool: &TaskPool, count: usize) -> usize {
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..count {
            let done = Arc::clone(&done);
            pool.submit(Box::new(move || {
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        for _ in 0..100 {
            if done.load(Ordering::SeqCst) == count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        done.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_disabled_pool_spawns_tasks() {
        let pool = TaskPool::disabled();
        assert_eq!(run_tasks(&pool, 16).await, 16);
    }

    #[tokio::test]
    async fn test_overflow_and_reconfigure() {
        let pool = TaskPool::new(WorkerSettings {
            size: 2,
            queue_len: 1,
            queue_number: 1,
        });
        assert_eq!(run_tasks(&pool, 64).await, 64);

        let resized = WorkerSettings {
            size: 8,
            queue_len: 16,
            queue_number: 4,
        };
        pool.reconfigure(resized);
        assert_eq!(pool.settings(), resized);
        assert_eq!(run_tasks(&pool, 64).await, 64);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_kill_worker() {
        let pool = TaskPool::new(WorkerSettings {
            size: 2,
            queue_len: 4,
            queue_number: 1,
        });
        pool.submit(Box::new(|| panic!("callback failure")));
        assert_eq!(run_tasks(&pool, 4).await, 4);
    }
}
