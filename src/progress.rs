//! Progress reporting for long-running operations
//!
//! Blocking work (scans, conflict checks) runs on tokio's blocking pool and
//! streams [`Progress`] updates back over an unbounded channel.

use crate::error::AppError;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One progress update
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub message: String,
}

impl Progress {
    pub fn new(current: usize, total: usize, message: impl Into<String>) -> Self {
        Self {
            current,
            total,
            message: message.into(),
        }
    }
}

/// Sending half handed to blocking work
#[derive(Debug, Clone)]
pub struct ProgressSender(mpsc::UnboundedSender<Progress>);

impl ProgressSender {
    /// Report progress; silently dropped once the receiver is gone
    pub fn send(&self, progress: Progress) {
        let _ = self.0.send(progress);
    }
}

/// A running operation: progress stream plus final result
pub struct OperationHandle<T> {
    pub progress: mpsc::UnboundedReceiver<Progress>,
    result: JoinHandle<Result<T, AppError>>,
}

impl<T: Send + 'static> OperationHandle<T> {
    /// Run `work` on the blocking pool
    pub fn spawn_blocking<F>(work: F) -> Self
    where
        F: FnOnce(ProgressSender) -> Result<T, AppError> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let result = tokio::task::spawn_blocking(move || work(ProgressSender(tx)));
        Self {
            progress: rx,
            result,
        }
    }

    /// Next progress update, `None` once the operation has finished
    pub async fn next_progress(&mut self) -> Option<Progress> {
        self.progress.recv().await
    }

    /// Wait for the result, discarding remaining progress
    pub async fn wait(self) -> Result<T, AppError> {
        match self.result.await {
            Ok(result) => result,
            Err(e) => Err(AppError::Task(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_then_result() {
        let mut handle = OperationHandle::spawn_blocking(|progress| {
            for i in 1..=3 {
                progress.send(Progress::new(i, 3, format!("step {}", i)));
            }
            Ok(42)
        });

        let mut seen = Vec::new();
        while let Some(p) = handle.next_progress().await {
            seen.push(p.current);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(handle.wait().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_error_passthrough() {
        let handle: OperationHandle<()> =
            OperationHandle::spawn_blocking(|_| Err(AppError::Task("boom".to_string())));
        assert!(handle.wait().await.is_err());
    }
}
