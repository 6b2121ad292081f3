//! Background work that must never block or fail the call that scheduled it.
//!
//! Tasks are tracked so that shutdown (and tests) can wait for them, and every task error
//! is reported on a dedicated channel instead of being dropped.

use crate::counter;
use crate::metrics_defs::BACKGROUND_TASK_FAILED;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// An error returned by a background task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub task: &'static str,
    pub error: String,
}

#[derive(Clone)]
pub struct TaskQueue {
    tracker: TaskTracker,
    failures: mpsc::UnboundedSender<TaskFailure>,
    // Flushes close and reopen the shared tracker, so they take turns.
    flushing: Arc<Mutex<()>>,
}

impl TaskQueue {
    /// Creates a queue and the receiving end of its failure channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskFailure>) {
        let (failures, rx) = mpsc::unbounded_channel();
        let queue = TaskQueue {
            tracker: TaskTracker::new(),
            failures,
            flushing: Arc::new(Mutex::new(())),
        };
        (queue, rx)
    }

    /// Runs `fut` in the background. An `Err` is logged, counted and sent to the failure
    /// channel.
    pub fn spawn<F, E>(&self, task: &'static str, fut: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let failures = self.failures.clone();
        self.tracker.spawn(async move {
            if let Err(err) = fut.await {
                tracing::error!(task, error = %err, "background task failed");
                counter!(BACKGROUND_TASK_FAILED, "task" => task).increment(1);
                // The receiver may be gone during shutdown.
                let _ = failures.send(TaskFailure {
                    task,
                    error: err.to_string(),
                });
            }
        });
    }

    /// Waits until every task spawned so far has finished. The queue keeps accepting work.
    ///
    /// Concurrent flushes from clones of the queue run one after another.
    pub async fn flush(&self) {
        let _turn = self.flushing.lock().await;
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Number of tasks still running.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }
}

/// Drains a failure channel into the log until every sender is dropped.
pub fn spawn_failure_logger(mut rx: mpsc::UnboundedReceiver<TaskFailure>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(failure) = rx.recv().await {
            tracing::warn!(
                task = failure.task,
                error = %failure.error,
                "background task failure drained"
            );
        }
    })
}
