//! Process-wide permits bounding in-flight store calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Returned when the pool has been closed and no further tokens will be issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("concurrency token pool is closed")]
pub struct PoolClosed;

/// A pool of `capacity` concurrency tokens shared by every listing and
/// delete call of a run.
#[derive(Debug, Clone)]
pub struct TokenPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl TokenPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait for a token. The token goes back to the pool when dropped.
    pub async fn acquire(&self) -> Result<Token, PoolClosed> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolClosed)?;

        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        Ok(Token {
            _permit: permit,
            pool: self.inner.clone(),
        })
    }

    /// Stop issuing tokens; pending and future `acquire` calls fail.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously held tokens seen so far.
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::SeqCst)
    }
}

/// A held concurrency token.
#[derive(Debug)]
pub struct Token {
    _permit: OwnedSemaphorePermit,
    pool: Arc<PoolInner>,
}

impl Drop for Token {
    fn drop(&mut self) {
        self.pool.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tokens_return_on_drop() {
        let pool = TokenPool::new(2);

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.in_flight(), 2);

        drop(first);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.in_flight(), 1);

        drop(second);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let pool = TokenPool::new(1);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(pool.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_token_released_when_task_panics() {
        let pool = TokenPool::new(1);

        let task = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _token = pool.acquire().await.unwrap();
                panic!("worker blew up");
            })
        };
        assert!(task.await.is_err());

        assert_eq!(pool.available(), 1);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let pool = TokenPool::new(1);
        pool.close();
        assert_eq!(pool.acquire().await.unwrap_err(), PoolClosed);
    }
}
