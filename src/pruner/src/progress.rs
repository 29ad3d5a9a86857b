//! Events emitted while a prune run makes progress.
//!
//! Events for one path arrive in causal order: `PathStarted` first, then at
//! most one terminal event (`PathDeleted`, `PathFannedOut`, `PathFailed` or
//! `PathAborted`), with any `PathRetrying` in between. Events of different
//! paths interleave freely. `RunFinished` is always the last event of a run.
//!
//! Children of a fanned-out path are queued page by page while it is still
//! being listed, so a child may start before its parent's `PathFannedOut`.
//! The parent's `PathStarted` always comes first.
//!
//! Paths still queued when a run is cancelled never start; they only receive
//! `PathAborted`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::path::TreePath;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    PathStarted {
        path: TreePath,
    },
    PathDeleted {
        path: TreePath,
    },
    PathFannedOut {
        path: TreePath,
        child_count: usize,
    },
    PathRetrying {
        path: TreePath,
        attempt: u32,
        delay: Duration,
    },
    PathFailed {
        path: TreePath,
        reason: String,
    },
    PathAborted {
        path: TreePath,
    },
    RunFinished {
        succeeded: bool,
        failed_paths: BTreeSet<TreePath>,
    },
}

impl ProgressEvent {
    /// Path this event is about; `None` for `RunFinished`.
    pub fn path(&self) -> Option<&TreePath> {
        match self {
            Self::PathStarted { path }
            | Self::PathDeleted { path }
            | Self::PathFannedOut { path, .. }
            | Self::PathRetrying { path, .. }
            | Self::PathFailed { path, .. }
            | Self::PathAborted { path } => Some(path),
            Self::RunFinished { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PathDeleted { .. }
                | Self::PathFannedOut { .. }
                | Self::PathFailed { .. }
                | Self::PathAborted { .. }
        )
    }
}

/// Receiver of progress events. Called from worker tasks, so implementations
/// must not block.
pub trait ProgressSink: Send + Sync + 'static {
    fn on_event(&self, event: &ProgressEvent);
}

impl<S: ProgressSink + ?Sized> ProgressSink for Arc<S> {
    fn on_event(&self, event: &ProgressEvent) {
        (**self).on_event(event);
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::PathStarted { path } => {
                tracing::debug!(path = %path, "Deleting path");
            }
            ProgressEvent::PathDeleted { path } => {
                tracing::info!(path = %path, "Deleted path");
            }
            ProgressEvent::PathFannedOut { path, child_count } => {
                tracing::info!(path = %path, child_count, "Path too large, deleting children");
            }
            ProgressEvent::PathRetrying {
                path,
                attempt,
                delay,
            } => {
                tracing::warn!(path = %path, attempt, delay = ?delay, "Retrying path");
            }
            ProgressEvent::PathFailed { path, reason } => {
                tracing::error!(path = %path, reason = %reason, "Failed to delete path");
            }
            ProgressEvent::PathAborted { path } => {
                tracing::warn!(path = %path, "Path left untouched after cancellation");
            }
            ProgressEvent::RunFinished {
                succeeded,
                failed_paths,
            } => {
                tracing::info!(
                    succeeded,
                    failed = failed_paths.len(),
                    "Prune run finished"
                );
            }
        }
    }
}

/// Forwards events into an unbounded channel, e.g. for a progress display.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ProgressSink for ChannelProgress {
    fn on_event(&self, event: &ProgressEvent) {
        // a dropped receiver only means nobody is watching
        let _ = self.sender.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_progress_forwards_events() {
        let (sink, mut receiver) = ChannelProgress::new();
        let path = TreePath::parse("/a");

        sink.on_event(&ProgressEvent::PathStarted { path: path.clone() });
        sink.on_event(&ProgressEvent::PathDeleted { path: path.clone() });

        let first = receiver.try_recv().unwrap();
        let second = receiver.try_recv().unwrap();
        assert_eq!(first, ProgressEvent::PathStarted { path: path.clone() });
        assert!(!first.is_terminal());
        assert!(second.is_terminal());
        assert_eq!(second.path(), Some(&path));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_channel_progress_survives_dropped_receiver() {
        let (sink, receiver) = ChannelProgress::new();
        drop(receiver);
        sink.on_event(&ProgressEvent::RunFinished {
            succeeded: true,
            failed_paths: BTreeSet::new(),
        });
    }
}
