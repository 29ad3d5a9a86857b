//! Prune run metrics
//!
//! Thread-safe counters shared by the coordinator and its workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Thread-safe metrics for tracking a prune run
#[derive(Debug, Clone, Default)]
pub struct PruneMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    jobs_started: AtomicUsize,
    paths_deleted: AtomicUsize,
    paths_fanned_out: AtomicUsize,
    paths_failed: AtomicUsize,
    paths_aborted: AtomicUsize,
    retries_attempted: AtomicUsize,
    delete_requests: AtomicUsize,
    list_requests: AtomicUsize,
    children_enqueued: AtomicUsize,
}

/// Point-in-time copy of [`PruneMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSummary {
    pub jobs_started: usize,
    pub paths_deleted: usize,
    pub paths_fanned_out: usize,
    pub paths_failed: usize,
    pub paths_aborted: usize,
    pub retries_attempted: usize,
    pub delete_requests: usize,
    pub list_requests: usize,
    pub children_enqueued: usize,
}

impl PruneMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_job_start(&self) {
        self.inner.jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deleted(&self) {
        self.inner.paths_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fan_out(&self) {
        self.inner.paths_fanned_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_children_enqueued(&self, children: usize) {
        self.inner
            .children_enqueued
            .fetch_add(children, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.inner.paths_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aborted(&self, paths: usize) {
        self.inner.paths_aborted.fetch_add(paths, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.inner.retries_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete_request(&self) {
        self.inner.delete_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_list_request(&self) {
        self.inner.list_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn paths_deleted(&self) -> usize {
        self.inner.paths_deleted.load(Ordering::Relaxed)
    }

    pub fn paths_failed(&self) -> usize {
        self.inner.paths_failed.load(Ordering::Relaxed)
    }

    pub fn retries_attempted(&self) -> usize {
        self.inner.retries_attempted.load(Ordering::Relaxed)
    }

    /// Get a summary of all metrics
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            jobs_started: self.inner.jobs_started.load(Ordering::Relaxed),
            paths_deleted: self.paths_deleted(),
            paths_fanned_out: self.inner.paths_fanned_out.load(Ordering::Relaxed),
            paths_failed: self.paths_failed(),
            paths_aborted: self.inner.paths_aborted.load(Ordering::Relaxed),
            retries_attempted: self.retries_attempted(),
            delete_requests: self.inner.delete_requests.load(Ordering::Relaxed),
            list_requests: self.inner.list_requests.load(Ordering::Relaxed),
            children_enqueued: self.inner.children_enqueued.load(Ordering::Relaxed),
        }
    }
}
