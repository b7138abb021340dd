//! The session's task pool.
//!
//! Every job controller and every pipeline stage runs as a task tracked
//! here, so closing a session can cancel them all and wait for the stragglers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Default)]
pub struct WorkerPool {
    tracker: TaskTracker,
    token: CancellationToken,
    shut_down: AtomicBool,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// A token cancelled when the pool shuts down.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Cancel every task. Returns `false` if the pool was already shut down.
    pub fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::debug!(tasks = self.tracker.len(), "shutting down worker pool");
        self.tracker.close();
        self.token.cancel();
        true
    }

    /// Wait until every task has finished. Only returns after [`shutdown`](Self::shutdown).
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    /// Tasks still running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_cancels_and_is_reported_once() {
        let pool = WorkerPool::new();
        let token = pool.child_token();
        let task = pool.spawn(async move {
            token.cancelled().await;
            "cancelled"
        });

        assert!(pool.shutdown());
        assert!(!pool.shutdown());
        assert_eq!(task.await.unwrap(), "cancelled");
        tokio::time::timeout(Duration::from_secs(1), pool.wait()).await.unwrap();
        assert_eq!(pool.active(), 0);
    }
}
