//! Deletion engine for very large subtrees of a remote key-value tree.
//!
//! The store behind [`store::ListingClient`] and [`store::DeleteTransport`]
//! cannot report how big a subtree is. [`PruneOrchestrator`] therefore tries
//! the cheapest thing first, a single delete request per path, and only
//! lists a path's children when the store rejects that request as too large.
//! Children become independent jobs on a bounded work queue.
//!
//! # Example
//!
//! ```rust,ignore
//! use pruner::{PruneOrchestrator, TreePath, TracingProgress};
//!
//! let orchestrator = PruneOrchestrator::new(store.clone(), store, config.pruner)?
//!     .with_progress(TracingProgress);
//! let report = orchestrator.run(TreePath::parse("/logs/2023")).await;
//! if !report.is_success() {
//!     for (path, reason) in &report.failed {
//!         eprintln!("{path}: {reason}");
//!     }
//! }
//! ```

pub mod cancel;
pub mod metrics;
pub mod orchestrator;
pub mod pager;
pub mod path;
pub mod progress;
pub mod retry;
pub mod store;
pub mod tokens;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use cancel::CancelSignal;
pub use metrics::{MetricsSummary, PruneMetrics};
pub use orchestrator::{
    FailureReason, JobState, PruneError, PruneOrchestrator, PruneReport, PruneStatus,
};
pub use pager::{CursorPager, PageError};
pub use path::TreePath;
pub use progress::{ChannelProgress, NoopProgress, ProgressEvent, ProgressSink, TracingProgress};
pub use retry::{FailureClass, RetryDecision, RetryPolicy};
pub use store::{DeleteTransport, ListingClient, StoreError, StoreResult};
pub use tokens::{PoolClosed, Token, TokenPool};
