//! Graceful shutdown coordination via `CancellationToken` and `TaskTracker`.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Tracks the server's background tasks and signals them to stop.
#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn a tracked task.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(task)
    }

    /// Number of tracked tasks still running.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Signal shutdown and wait up to `timeout` for tracked tasks.
    ///
    /// Returns `false` if some tasks were still running at the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.shutdown();
        let _ = self.tasks.close();
        info!(task_count = self.tasks.len(), "waiting for tasks to complete");
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_err() {
            warn!(
                task_count = self.tasks.len(),
                "shutdown timed out after {timeout:?}, some tasks may still be running"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_cancels_tokens() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        assert!(!coord.is_shutting_down());
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn drain_waits_for_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let _ = coord.spawn(async move { token.cancelled().await });
        assert_eq!(coord.task_count(), 1);
        assert!(coord.drain(Duration::from_secs(5)).await);
        assert_eq!(coord.task_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_at_deadline() {
        let coord = ShutdownCoordinator::new();
        let _ = coord.spawn(std::future::pending::<()>());
        assert!(!coord.drain(Duration::from_secs(1)).await);
    }
}
