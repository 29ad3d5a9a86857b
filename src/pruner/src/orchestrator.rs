//! Chunked delete orchestration
//!
//! Removes a subtree of arbitrary size from a store that only offers a
//! size-limited atomic delete and a paginated child listing. Every path is
//! first deleted optimistically in one request; only when the store reports
//! the request as too large are its children listed and pushed back onto the
//! work queue as independent jobs. Each listing page is handed to the
//! coordinator as soon as it arrives, so children start deleting while their
//! parent is still being enumerated. Depth is handled by the queue, never by
//! recursion.
//!
//! A single coordinator owns the queue and spawns at most `max_concurrency`
//! workers. Every store call additionally holds one token from a shared
//! [`TokenPool`] of the same size, so no more than `max_concurrency` calls
//! are ever in flight.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::config::{ConfigError, PrunerConfig};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelSignal;
use crate::metrics::{MetricsSummary, PruneMetrics};
use crate::pager::{CursorPager, PageError};
use crate::path::TreePath;
use crate::progress::{NoopProgress, ProgressEvent, ProgressSink};
use crate::retry::{FailureClass, RetryDecision, RetryPolicy};
use crate::store::{DeleteTransport, ListingClient, StoreError};
use crate::tokens::TokenPool;

/// Errors that prevent a run from starting. Per-path failures never surface
/// as an error; they are reported in [`PruneReport`].
#[derive(Debug, thiserror::Error)]
pub enum PruneError {
    #[error("invalid pruner configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

/// Why a path could not be removed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("{0}")]
    Fatal(StoreError),

    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: StoreError },

    #[error("listing children failed after {attempts} attempts: {error}")]
    ListingFailed { attempts: u32, error: StoreError },

    #[error("listing returned {key:?} after {after:?}; keys must strictly increase")]
    ListingOutOfOrder { key: String, after: String },

    #[error("payload too large and the path has no children to split into")]
    Unsplittable,

    #[error("concurrency token pool was closed")]
    PoolClosed,

    #[error("worker panicked: {0}")]
    WorkerPanicked(String),
}

impl FailureReason {
    fn from_delete_error(error: StoreError, attempts: u32) -> Self {
        match RetryPolicy::classify(&error) {
            FailureClass::Fatal => Self::Fatal(error),
            _ => Self::RetriesExhausted {
                attempts,
                last_error: error,
            },
        }
    }
}

/// Lifecycle of a single delete job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Attempting,
    Succeeded,
    FannedOut,
    Failed,
    Aborted,
}

#[derive(Debug, Clone)]
struct DeleteJob {
    path: TreePath,
    attempt: u32,
    backoff: Option<Duration>,
    state: JobState,
}

impl DeleteJob {
    fn new(path: TreePath) -> Self {
        Self {
            path,
            attempt: 1,
            backoff: None,
            state: JobState::Pending,
        }
    }

    fn retry(self, delay: Duration) -> Self {
        Self {
            path: self.path,
            attempt: self.attempt + 1,
            backoff: Some(delay),
            state: JobState::Pending,
        }
    }
}

enum JobOutcome {
    Deleted,
    /// Every page was listed; carries the total number of children.
    FannedOut(usize),
    Retry { delay: Duration, error: StoreError },
    Failed(FailureReason),
    Aborted,
}

impl JobOutcome {
    fn state(&self) -> JobState {
        match self {
            Self::Deleted => JobState::Succeeded,
            Self::FannedOut(_) => JobState::FannedOut,
            Self::Retry { .. } => JobState::Pending,
            Self::Failed(_) => JobState::Failed,
            Self::Aborted => JobState::Aborted,
        }
    }
}

/// One listing page of a fanned-out path, sent to the coordinator.
struct ChildBatch {
    parent: TreePath,
    keys: Vec<String>,
}

/// Overall result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneStatus {
    /// Every path under the root was removed.
    Succeeded,
    /// Some paths failed; they are listed in [`PruneReport::failed`].
    PartialFailure,
    /// The run was cancelled before every path was resolved.
    Aborted,
}

/// Summary of a finished run. Failed and aborted subtrees are left exactly
/// as they were, so the whole run can be repeated safely.
#[derive(Debug, Clone)]
pub struct PruneReport {
    pub root: TreePath,
    pub status: PruneStatus,
    pub failed: BTreeMap<TreePath, FailureReason>,
    pub aborted: BTreeSet<TreePath>,
    pub metrics: MetricsSummary,
    pub duration: Duration,
}

impl PruneReport {
    pub fn is_success(&self) -> bool {
        self.status == PruneStatus::Succeeded
    }

    pub fn failed_paths(&self) -> BTreeSet<TreePath> {
        self.failed.keys().cloned().collect()
    }
}

/// Deletes large subtrees by optimistic direct deletes and fan-out.
pub struct PruneOrchestrator {
    lister: Arc<dyn ListingClient>,
    deleter: Arc<dyn DeleteTransport>,
    config: PrunerConfig,
    policy: RetryPolicy,
    tokens: TokenPool,
    progress: Arc<dyn ProgressSink>,
}

impl PruneOrchestrator {
    /// Create a new orchestrator; fails if `config` is not valid.
    pub fn new(
        lister: Arc<dyn ListingClient>,
        deleter: Arc<dyn DeleteTransport>,
        config: PrunerConfig,
    ) -> Result<Self, PruneError> {
        config.validate()?;

        Ok(Self {
            lister,
            deleter,
            policy: RetryPolicy::from(&config.retry),
            tokens: TokenPool::new(config.max_concurrency),
            progress: Arc::new(NoopProgress),
            config,
        })
    }

    pub fn with_progress(mut self, progress: impl ProgressSink) -> Self {
        self.progress = Arc::new(progress);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Share a token pool with other runs so the bound holds across them.
    pub fn with_token_pool(mut self, tokens: TokenPool) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn config(&self) -> &PrunerConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenPool {
        &self.tokens
    }

    /// Delete `root` and everything below it.
    pub async fn run(&self, root: TreePath) -> PruneReport {
        self.run_with_cancel(root, CancelSignal::new()).await
    }

    /// Delete `root` and everything below it until `cancel` is raised.
    pub async fn run_with_cancel(&self, root: TreePath, cancel: CancelSignal) -> PruneReport {
        let started = Instant::now();
        let metrics = PruneMetrics::new();

        info!(
            path = %root,
            max_concurrency = self.config.max_concurrency,
            page_size = self.config.page_size,
            call_timeout = ?self.config.call_timeout,
            max_attempts = self.policy.max_attempts(),
            "Starting prune run"
        );

        let (discovered_tx, mut discovered) = mpsc::unbounded_channel();
        let worker = Arc::new(Worker {
            lister: self.lister.clone(),
            deleter: self.deleter.clone(),
            policy: self.policy.clone(),
            tokens: self.tokens.clone(),
            progress: self.progress.clone(),
            metrics: metrics.clone(),
            page_size: self.config.page_size,
            call_timeout: self.config.call_timeout,
            cancel: cancel.clone(),
            discovered: discovered_tx,
        });

        let mut tally = RunTally::default();
        let mut queue = VecDeque::from([DeleteJob::new(root.clone())]);
        let mut workers = JoinSet::new();
        let mut running = BTreeSet::new();
        let mut join_failure = None;

        loop {
            while workers.len() < self.config.max_concurrency && !cancel.is_cancelled() {
                let Some(mut job) = queue.pop_front() else {
                    break;
                };
                job.state = JobState::Attempting;
                running.insert(job.path.clone());
                let worker = worker.clone();
                workers.spawn(async move {
                    let outcome = AssertUnwindSafe(worker.attempt(&job))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            JobOutcome::Failed(FailureReason::WorkerPanicked(panic_message(
                                panic.as_ref(),
                            )))
                        });
                    (job, outcome)
                });
            }

            if workers.is_empty() {
                break;
            }

            tokio::select! {
                Some(batch) = discovered.recv() => {
                    Self::enqueue_children(batch, &mut queue, &metrics);
                }
                Some(joined) = workers.join_next() => {
                    // pages are sent before their worker finishes
                    while let Ok(batch) = discovered.try_recv() {
                        Self::enqueue_children(batch, &mut queue, &metrics);
                    }
                    match joined {
                        Ok((job, outcome)) => {
                            running.remove(&job.path);
                            self.settle(job, outcome, &mut queue, &mut tally, &metrics);
                        }
                        Err(e) => {
                            error!(error = %e, "Worker task did not complete");
                            join_failure = Some(e.to_string());
                        }
                    }
                }
                else => break,
            }
        }

        // paths whose task died without reporting an outcome
        for path in running {
            let reason = FailureReason::WorkerPanicked(
                join_failure
                    .clone()
                    .unwrap_or_else(|| "worker task did not report back".to_string()),
            );
            error!(path = %path, reason = %reason, "Failed to delete path");
            metrics.record_failure();
            self.progress.on_event(&ProgressEvent::PathFailed {
                path: path.clone(),
                reason: reason.to_string(),
            });
            tally.failed.insert(path, reason);
        }

        if !queue.is_empty() {
            info!(
                pending = queue.len(),
                "Run cancelled, leaving pending paths untouched"
            );
        }
        for job in queue.drain(..) {
            self.progress.on_event(&ProgressEvent::PathAborted {
                path: job.path.clone(),
            });
            metrics.record_aborted(1);
            tally.aborted.insert(job.path);
        }

        let status = if !tally.aborted.is_empty() {
            PruneStatus::Aborted
        } else if !tally.failed.is_empty() {
            PruneStatus::PartialFailure
        } else {
            PruneStatus::Succeeded
        };

        let report = PruneReport {
            root,
            status,
            failed: tally.failed,
            aborted: tally.aborted,
            metrics: metrics.summary(),
            duration: started.elapsed(),
        };

        self.progress.on_event(&ProgressEvent::RunFinished {
            succeeded: report.is_success(),
            failed_paths: report.failed_paths(),
        });

        info!(
            path = %report.root,
            status = ?report.status,
            deleted = report.metrics.paths_deleted,
            fanned_out = report.metrics.paths_fanned_out,
            failed = report.failed.len(),
            aborted = report.aborted.len(),
            retries = report.metrics.retries_attempted,
            duration = ?report.duration,
            "Prune run complete"
        );

        report
    }

    /// Apply a worker's outcome to the queue and the run's bookkeeping.
    fn settle(
        &self,
        mut job: DeleteJob,
        outcome: JobOutcome,
        queue: &mut VecDeque<DeleteJob>,
        tally: &mut RunTally,
        metrics: &PruneMetrics,
    ) {
        job.state = outcome.state();

        match outcome {
            JobOutcome::Deleted => {
                debug!(path = %job.path, attempt = job.attempt, "Deleted path");
                metrics.record_deleted();
                self.progress
                    .on_event(&ProgressEvent::PathDeleted { path: job.path });
            }
            JobOutcome::FannedOut(child_count) => {
                debug!(
                    path = %job.path,
                    child_count,
                    "Path too large for a single delete, fanned out"
                );
                metrics.record_fan_out();
                self.progress.on_event(&ProgressEvent::PathFannedOut {
                    path: job.path.clone(),
                    child_count,
                });
            }
            JobOutcome::Retry { delay, error } => {
                warn!(
                    path = %job.path,
                    attempt = job.attempt,
                    max_attempts = self.policy.max_attempts(),
                    delay = ?delay,
                    error = %error,
                    "Delete failed, retrying after backoff"
                );
                metrics.record_retry();
                self.progress.on_event(&ProgressEvent::PathRetrying {
                    path: job.path.clone(),
                    attempt: job.attempt + 1,
                    delay,
                });
                queue.push_back(job.retry(delay));
            }
            JobOutcome::Failed(reason) => {
                error!(path = %job.path, reason = %reason, "Failed to delete path");
                metrics.record_failure();
                self.progress.on_event(&ProgressEvent::PathFailed {
                    path: job.path.clone(),
                    reason: reason.to_string(),
                });
                tally.failed.insert(job.path, reason);
            }
            JobOutcome::Aborted => {
                debug!(path = %job.path, state = ?job.state, "Path interrupted by cancellation");
                metrics.record_aborted(1);
                self.progress.on_event(&ProgressEvent::PathAborted {
                    path: job.path.clone(),
                });
                tally.aborted.insert(job.path);
            }
        }
    }

    /// Queue one listing page worth of children behind the existing work.
    fn enqueue_children(
        batch: ChildBatch,
        queue: &mut VecDeque<DeleteJob>,
        metrics: &PruneMetrics,
    ) {
        debug!(
            path = %batch.parent,
            children = batch.keys.len(),
            "Queueing children"
        );
        metrics.record_children_enqueued(batch.keys.len());
        queue.extend(
            batch
                .keys
                .into_iter()
                .map(|key| DeleteJob::new(batch.parent.child(key))),
        );
    }
}

#[derive(Default)]
struct RunTally {
    failed: BTreeMap<TreePath, FailureReason>,
    aborted: BTreeSet<TreePath>,
}

/// State shared by all worker tasks of one run.
struct Worker {
    lister: Arc<dyn ListingClient>,
    deleter: Arc<dyn DeleteTransport>,
    policy: RetryPolicy,
    tokens: TokenPool,
    progress: Arc<dyn ProgressSink>,
    metrics: PruneMetrics,
    page_size: usize,
    call_timeout: Duration,
    cancel: CancelSignal,
    discovered: mpsc::UnboundedSender<ChildBatch>,
}

impl Worker {
    /// One delete attempt for `job`, followed by enumeration if the store
    /// reports the subtree as too large.
    async fn attempt(&self, job: &DeleteJob) -> JobOutcome {
        if let Some(delay) = job.backoff {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return JobOutcome::Aborted,
            }
        }

        if job.attempt == 1 {
            self.metrics.record_job_start();
            self.progress.on_event(&ProgressEvent::PathStarted {
                path: job.path.clone(),
            });
        }

        let result = {
            let token = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return JobOutcome::Aborted,
                token = self.tokens.acquire() => token,
            };
            let Ok(_token) = token else {
                return JobOutcome::Failed(FailureReason::PoolClosed);
            };

            self.metrics.record_delete_request();
            self.deleter
                .delete_subtree(&job.path, Some(self.call_timeout))
                .await
        };

        match result {
            Ok(()) => JobOutcome::Deleted,
            Err(error) => match self.policy.decide(&error, job.attempt) {
                RetryDecision::RetryAfter(delay) => JobOutcome::Retry { delay, error },
                RetryDecision::FanOut => self.fan_out(&job.path).await,
                RetryDecision::GiveUp => {
                    JobOutcome::Failed(FailureReason::from_delete_error(error, job.attempt))
                }
            },
        }
    }

    /// List every child of `path`, retrying each page on its own budget.
    /// Every page goes to the coordinator as soon as it arrives.
    async fn fan_out(&self, path: &TreePath) -> JobOutcome {
        let mut pager = CursorPager::new(self.lister.clone(), path.clone(), self.page_size)
            .with_timeout(self.call_timeout)
            .with_tokens(self.tokens.clone())
            .with_cancel(self.cancel.clone())
            .with_metrics(self.metrics.clone());
        let mut child_count = 0;
        let mut attempt = 1;

        loop {
            match pager.next_page().await {
                Ok(Some(keys)) => {
                    child_count += keys.len();
                    attempt = 1;
                    // the coordinator holds the receiver until every worker is joined
                    let _ = self.discovered.send(ChildBatch {
                        parent: path.clone(),
                        keys,
                    });
                }
                Ok(None) => break,
                Err(PageError::Cancelled) => return JobOutcome::Aborted,
                Err(PageError::PoolClosed(_)) => {
                    return JobOutcome::Failed(FailureReason::PoolClosed);
                }
                Err(PageError::OutOfOrder { key, after }) => {
                    return JobOutcome::Failed(FailureReason::ListingOutOfOrder { key, after });
                }
                Err(PageError::Store(error)) => match self.policy.decide(&error, attempt) {
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            path = %path,
                            cursor = ?pager.cursor(),
                            attempt,
                            delay = ?delay,
                            error = %error,
                            "Listing page failed, retrying after backoff"
                        );
                        self.metrics.record_retry();
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.cancel.cancelled() => return JobOutcome::Aborted,
                        }
                        attempt += 1;
                    }
                    RetryDecision::FanOut | RetryDecision::GiveUp => {
                        return JobOutcome::Failed(FailureReason::ListingFailed {
                            attempts: attempt,
                            error,
                        });
                    }
                },
            }
        }

        if child_count == 0 {
            return JobOutcome::Failed(FailureReason::Unsplittable);
        }

        JobOutcome::FannedOut(child_count)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
