//! Removal of arbitrarily large subtrees from a remote tree store.
//!
//! [`pruner`] holds the deletion engine; [`common`] its configuration and
//! logging setup.

pub use common;
pub use pruner;

pub use common::{Configuration, LoggingConfig, PrunerConfig, RetryConfig};
pub use pruner::{PruneOrchestrator, PruneReport, PruneStatus, TreePath};
