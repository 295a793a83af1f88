//! Bounded set of detached background tasks.
//!
//! Revalidation refreshes and on-demand pre-warms outlive the request that
//! started them. They run here so their completion can be observed and their
//! errors logged instead of lost.

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Default cap on concurrently running background tasks.
pub const DEFAULT_MAX_BACKGROUND_TASKS: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub in_flight: usize,
    pub started: u64,
    pub finished: u64,
    pub failed: u64,
    /// Spawns refused because the set was full
    pub refused: u64,
}

/// Clone is cheap; clones share the same task set.
#[derive(Clone)]
pub struct BackgroundTasks {
    capacity: usize,
    stats: watch::Sender<TaskStats>,
}

impl BackgroundTasks {
    pub fn new(capacity: usize) -> Self {
        let (stats, _) = watch::channel(TaskStats::default());
        Self {
            capacity: capacity.max(1),
            stats,
        }
    }

    pub fn stats(&self) -> TaskStats {
        *self.stats.borrow()
    }

    /// Spawn a detached task. Returns false, without running it, if the set
    /// is at capacity. Errors and panics are logged and counted as failures.
    pub fn spawn<F, E>(&self, kind: &'static str, label: impl Into<String>, task: F) -> bool
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let label = label.into();
        let capacity = self.capacity;
        let admitted = self.stats.send_if_modified(|stats| {
            if stats.in_flight >= capacity {
                stats.refused += 1;
                // Counter change only; waiters care about in_flight
                false
            } else {
                stats.in_flight += 1;
                stats.started += 1;
                true
            }
        });

        if !admitted {
            warn!(kind = kind, task = %label, capacity = capacity, "Background task set full, skipping");
            return false;
        }

        debug!(kind = kind, task = %label, "Background task started");
        let stats = self.stats.clone();
        tokio::spawn(async move {
            let succeeded = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {
                    debug!(kind = kind, task = %label, "Background task finished");
                    true
                }
                Ok(Err(e)) => {
                    warn!(kind = kind, task = %label, error = %e, "Background task failed");
                    false
                }
                Err(_) => {
                    warn!(kind = kind, task = %label, "Background task panicked");
                    false
                }
            };
            stats.send_modify(|stats| {
                stats.in_flight -= 1;
                if succeeded {
                    stats.finished += 1;
                } else {
                    stats.failed += 1;
                }
            });
        });
        true
    }

    /// Wait until no task is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.stats.subscribe();
        // The sender lives in self, so this only ends when idle
        let _ = rx.wait_for(|stats| stats.in_flight == 0).await;
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BACKGROUND_TASKS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_tracks_success_and_failure() {
        let tasks = BackgroundTasks::new(4);
        assert!(tasks.spawn("test", "ok", async { Ok::<(), String>(()) }));
        assert!(tasks.spawn("test", "err", async { Err::<(), _>("boom".to_string()) }));
        tasks.wait_idle().await;

        let stats = tasks.stats();
        assert_eq!(stats.started, 2);
        assert_eq!(stats.finished, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_refuses_beyond_capacity() {
        let tasks = BackgroundTasks::new(1);
        let (tx, rx) = oneshot::channel::<()>();

        assert!(tasks.spawn("test", "blocking", async move {
            let _ = rx.await;
            Ok::<(), String>(())
        }));
        assert!(!tasks.spawn("test", "overflow", async { Ok::<(), String>(()) }));
        assert_eq!(tasks.stats().refused, 1);

        tx.send(()).unwrap();
        tasks.wait_idle().await;
        assert_eq!(tasks.stats().finished, 1);
    }

    #[tokio::test]
    async fn test_panic_counts_as_failure() {
        let tasks = BackgroundTasks::new(2);
        tasks.spawn("test", "panics", async {
            if true {
                panic!("task blew up");
            }
            Ok::<(), String>(())
        });
        tasks.wait_idle().await;
        assert_eq!(tasks.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_wait_idle_waits_for_running_task() {
        let tasks = BackgroundTasks::default();
        tasks.spawn("test", "sleep", async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<(), String>(())
        });
        tasks.wait_idle().await;
        assert_eq!(tasks.stats().finished, 1);
    }
}
