//! Coalescing bursts of per-file errors into one report
//!
//! A scan over hundreds of broken archives should surface one message, not
//! hundreds. [`ErrorBatcher`] collects errors until the stream has been quiet
//! for the window (or the batch is full) and then yields a single
//! [`ErrorReport`].

use crate::vpk::ParseError;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Quiet period before a batch is flushed
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(300);

/// Batch size that forces an immediate flush
pub const DEFAULT_MAX_BATCH: usize = 50;

/// Number of file names spelled out in a summary
const SUMMARY_NAMES: usize = 3;

/// A coalesced batch of errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub count: usize,
    pub files: Vec<String>,
    pub message: String,
}

impl ErrorReport {
    pub fn from_errors(errors: &[ParseError]) -> Self {
        let files: Vec<String> = errors
            .iter()
            .map(|e| crate::paths::display_name(&e.file))
            .collect();

        let mut message = format!(
            "Failed to parse {} file(s): {}",
            files.len(),
            files.iter().take(SUMMARY_NAMES).cloned().collect::<Vec<_>>().join(", ")
        );
        if files.len() > SUMMARY_NAMES {
            message.push_str(&format!(" +{} more", files.len() - SUMMARY_NAMES));
        }

        Self {
            count: files.len(),
            files,
            message,
        }
    }
}

#[derive(Debug)]
pub struct ErrorBatcher {
    window: Duration,
    max_batch: usize,
    pending: Vec<ParseError>,
    last_push: Option<Instant>,
}

impl Default for ErrorBatcher {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MAX_BATCH)
    }
}

impl ErrorBatcher {
    pub fn new(window: Duration, max_batch: usize) -> Self {
        Self {
            window,
            max_batch: max_batch.max(1),
            pending: Vec::new(),
            last_push: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// When the pending batch becomes due, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.last_push.map(|t| t + self.window)
    }

    /// Queue an error; returns a report when the batch is full
    pub fn push(&mut self, error: ParseError, now: Instant) -> Option<ErrorReport> {
        self.pending.push(error);
        self.last_push = Some(now);
        if self.pending.len() >= self.max_batch {
            return self.flush();
        }
        None
    }

    /// Flush if the window has elapsed since the last push
    pub fn poll(&mut self, now: Instant) -> Option<ErrorReport> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.flush(),
            _ => None,
        }
    }

    /// Emit whatever is pending
    pub fn flush(&mut self) -> Option<ErrorReport> {
        self.last_push = None;
        if self.pending.is_empty() {
            return None;
        }
        let errors = std::mem::take(&mut self.pending);
        debug!("Flushing {} batched error(s)", errors.len());
        Some(ErrorReport::from_errors(&errors))
    }
}

/// Drive a batcher from a channel until it closes, handing each report to `emit`
pub async fn forward_errors<F>(
    mut rx: mpsc::UnboundedReceiver<ParseError>,
    mut batcher: ErrorBatcher,
    emit: F,
) where
    F: Fn(ErrorReport),
{
    loop {
        let deadline = batcher.deadline();
        tokio::select! {
            received = rx.recv() => match received {
                Some(error) => {
                    if let Some(report) = batcher.push(error, Instant::now()) {
                        emit(report);
                    }
                }
                None => break,
            },
            _ = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Some(report) = batcher.poll(Instant::now()) {
                    emit(report);
                }
            }
        }
    }

    if let Some(report) = batcher.flush() {
        emit(report);
    }
}
