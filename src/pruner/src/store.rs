//! Contracts the engine consumes from the remote tree store.
//!
//! The store exposes exactly two primitives: an ordered, paginated listing of
//! a node's direct children, and an atomic delete of a whole subtree that the
//! store refuses when the request would exceed its payload limit.

use std::time::Duration;

use async_trait::async_trait;

use crate::path::TreePath;

/// Failures reported by the listing client or the delete transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transient service error: {0}")]
    Transient(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("path not found: {0}")]
    NotFound(String),

    #[error("malformed path: {0}")]
    MalformedPath(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Ordered enumeration of a node's direct children.
#[async_trait]
pub trait ListingClient: Send + Sync + 'static {
    /// List up to `num_children` child keys of `path`, in increasing order.
    ///
    /// Keys not strictly greater than `start_after` are filtered out first;
    /// the survivors are then truncated to `num_children`. A missing path or
    /// a leaf lists as empty. When a response cannot be produced within
    /// `timeout` the call fails with [`StoreError::Timeout`] instead of
    /// returning a partial page.
    async fn list_path(
        &self,
        path: &TreePath,
        num_children: usize,
        start_after: Option<&str>,
        timeout: Option<Duration>,
    ) -> StoreResult<Vec<String>>;
}

/// Single-request removal of everything under a path.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeleteTransport: Send + Sync + 'static {
    /// Remove `path` and its whole subtree in one request.
    ///
    /// Returns [`StoreError::PayloadTooLarge`] when the store rejects the
    /// request for exceeding its size limit; nothing is removed in that case.
    async fn delete_subtree(&self, path: &TreePath, timeout: Option<Duration>) -> StoreResult<()>;
}
