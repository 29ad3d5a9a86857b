//! Cursor-driven pagination over one path's children.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;

use crate::cancel::CancelSignal;
use crate::metrics::PruneMetrics;
use crate::path::TreePath;
use crate::store::{ListingClient, StoreError};
use crate::tokens::{PoolClosed, Token, TokenPool};

/// Failure of a single page request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PageError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    PoolClosed(#[from] PoolClosed),

    #[error("listing cancelled before the page was requested")]
    Cancelled,

    /// The store returned a key that does not sort after the previous one,
    /// so the cursor would not advance.
    #[error("listing returned {key:?}, which does not sort after {after:?}")]
    OutOfOrder { key: String, after: String },
}

/// Walks the children of one path page by page.
///
/// Each page starts strictly after the last key of the previous page. A page
/// shorter than `page_size` ends the sequence. A failed page does not move
/// the cursor, so calling [`CursorPager::next_page`] again re-issues that
/// same page without revisiting earlier keys.
pub struct CursorPager {
    client: Arc<dyn ListingClient>,
    path: TreePath,
    page_size: usize,
    timeout: Option<Duration>,
    tokens: Option<TokenPool>,
    cancel: Option<CancelSignal>,
    metrics: Option<PruneMetrics>,
    cursor: Option<String>,
    exhausted: bool,
    pages_fetched: usize,
}

impl CursorPager {
    pub fn new(client: Arc<dyn ListingClient>, path: TreePath, page_size: usize) -> Self {
        Self {
            client,
            path,
            page_size: page_size.max(1),
            timeout: None,
            tokens: None,
            cancel: None,
            metrics: None,
            cursor: None,
            exhausted: false,
            pages_fetched: 0,
        }
    }

    /// Per-page deadline handed to the listing client.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Hold one token from `tokens` for the duration of each page request.
    pub fn with_tokens(mut self, tokens: TokenPool) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Stop requesting pages once `cancel` is raised, including while
    /// waiting for a token.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Count every request actually sent to the store.
    pub fn with_metrics(mut self, metrics: PruneMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn path(&self) -> &TreePath {
        &self.path
    }

    /// Last key observed so far.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Fetch the next page, or `Ok(None)` once every child has been seen.
    pub async fn next_page(&mut self) -> Result<Option<Vec<String>>, PageError> {
        if self.exhausted {
            return Ok(None);
        }

        let keys = {
            let _token = self.acquire_token().await?;
            if let Some(metrics) = &self.metrics {
                metrics.record_list_request();
            }
            self.client
                .list_path(
                    &self.path,
                    self.page_size,
                    self.cursor.as_deref(),
                    self.timeout,
                )
                .await?
        };
        self.check_order(&keys)?;

        self.pages_fetched += 1;

        if keys.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = keys.last() {
            self.cursor = Some(last.clone());
        } else {
            self.exhausted = true;
            return Ok(None);
        }

        tracing::trace!(
            path = %self.path,
            page = self.pages_fetched,
            keys = keys.len(),
            cursor = ?self.cursor,
            "Fetched listing page"
        );

        Ok(Some(keys))
    }

    async fn acquire_token(&self) -> Result<Option<Token>, PageError> {
        if self.cancel.as_ref().is_some_and(CancelSignal::is_cancelled) {
            return Err(PageError::Cancelled);
        }
        let Some(pool) = &self.tokens else {
            return Ok(None);
        };
        let token = match &self.cancel {
            Some(cancel) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PageError::Cancelled),
                token = pool.acquire() => token?,
            },
            None => pool.acquire().await?,
        };
        Ok(Some(token))
    }

    /// Keys must be strictly increasing and sort after the cursor.
    fn check_order(&self, keys: &[String]) -> Result<(), PageError> {
        let mut previous = self.cursor.as_deref();
        for key in keys {
            if let Some(after) = previous.filter(|after| key.as_str() <= *after) {
                return Err(PageError::OutOfOrder {
                    key: key.clone(),
                    after: after.to_owned(),
                });
            }
            previous = Some(key.as_str());
        }
        Ok(())
    }

    /// Drain every remaining page into one ordered list.
    pub async fn collect_all(mut self) -> Result<Vec<String>, PageError> {
        let mut keys = Vec::new();
        while let Some(page) = self.next_page().await? {
            keys.extend(page);
        }
        Ok(keys)
    }

    /// The remaining children as a lazy stream of keys. The stream ends after
    /// the first error.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<String, PageError>> + Send {
        async_stream::try_stream! {
            while let Some(page) = self.next_page().await? {
                for key in page {
                    yield key;
                }
            }
        }
    }
}
