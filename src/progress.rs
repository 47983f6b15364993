//! Progress observers for a pipeline run.
//!
//! The pipeline never renders anything itself; it calls a
//! [`ProgressReporter`] after each row and once when a batch finishes with at
//! least one geocoded row.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

pub trait ProgressReporter: Send + Sync {
    fn on_progress(&self, done: usize, total: usize);

    /// Emitted only when `geocoded > 0`.
    fn on_complete(&self, geocoded: usize);
}

pub struct NullProgress;

impl ProgressReporter for NullProgress {
    fn on_progress(&self, _done: usize, _total: usize) {}
    fn on_complete(&self, _geocoded: usize) {}
}

/// Logs every `every` rows and on the final row.
pub struct LogProgress {
    every: usize,
    last_logged: AtomicUsize,
}

impl LogProgress {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            last_logged: AtomicUsize::new(0),
        }
    }
}

impl ProgressReporter for LogProgress {
    fn on_progress(&self, done: usize, total: usize) {
        let last = self.last_logged.load(Ordering::Relaxed);
        if done == total || done >= last + self.every {
            self.last_logged.store(done, Ordering::Relaxed);
            info!(target: "pipeline", done, total, "geocoding progress");
        }
    }

    fn on_complete(&self, geocoded: usize) {
        info!(target: "pipeline", geocoded, "batch finished with geocoded rows");
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress { done: usize, total: usize },
    Completed { geocoded: usize },
}

/// Forwards events to a channel, for adapters that render on another task.
pub struct ChannelProgress {
    sender: UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(sender: UnboundedSender<ProgressEvent>) -> Self {
        Self { sender }
    }
}

impl ProgressReporter for ChannelProgress {
    fn on_progress(&self, done: usize, total: usize) {
        // receiver gone means nobody is watching
        let _ = self.sender.send(ProgressEvent::Progress { done, total });
    }

    fn on_complete(&self, geocoded: usize) {
        let _ = self.sender.send(ProgressEvent::Completed { geocoded });
    }
}
