//! Optimistic-concurrency window store.
//!
//! Models the transaction primitive of an external document store: read the
//! document and its version, run the updater, and commit only if the version
//! is unchanged. Conflicting commits are retried with jittered exponential
//! backoff; a transaction that never commits surfaces as `StoreUnavailable`,
//! as does any error the backend itself reports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::clock::Clock;
use super::record::{WindowKey, WindowRecord};
use super::store::{Updater, WindowStore};
use crate::error::{RateLimitError, Result};

/// A record together with the version it was read at.
#[derive(Debug, Clone)]
pub struct Versioned {
    pub record: WindowRecord,
    pub version: u64,
}

/// The primitives an external document store has to offer.
#[async_trait]
pub trait VersionedBackend: Send + Sync {
    /// Read a document and its current version.
    async fn load(&self, doc_id: &str) -> Result<Option<Versioned>>;

    /// Write `record` only if the stored version still equals `expected`
    /// (`None` meaning "document must not exist"). Returns `false` on conflict.
    async fn compare_and_swap(
        &self,
        doc_id: &str,
        expected: Option<u64>,
        record: WindowRecord,
    ) -> Result<bool>;

    /// Delete at most `limit` documents whose window started before `cutoff_ms`.
    async fn delete_older_than(&self, cutoff_ms: u64, limit: usize) -> Result<usize>;

    /// Number of stored documents.
    async fn count(&self) -> Result<usize>;
}

/// Retry policy for conflicting transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt, in milliseconds
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Upper bound on a single backoff, in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    10
}

fn default_max_backoff_ms() -> u64 {
    1_000
}

impl RetryPolicy {
    /// Full-jitter exponential backoff after the given (1-based) failed attempt.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let ceiling = exp.min(self.max_backoff_ms);
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// A `WindowStore` built on compare-and-swap.
pub struct OptimisticWindowStore<B: VersionedBackend> {
    backend: B,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl<B: VersionedBackend> OptimisticWindowStore<B> {
    /// Create a store over `backend` with the default retry policy.
    pub fn new(backend: B, clock: Arc<dyn Clock>) -> Self {
        Self::with_retry(backend, clock, RetryPolicy::default())
    }

    /// Create a store with an explicit retry policy.
    pub fn with_retry(backend: B, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            clock,
            retry,
        }
    }

    /// Get the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[async_trait]
impl<B: VersionedBackend> WindowStore for OptimisticWindowStore<B> {
    async fn read_and_update(
        &self,
        key: &WindowKey,
        updater: &mut Updater<'_>,
    ) -> Result<Option<WindowRecord>> {
        let doc_id = key.document_id();
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let loaded = self
                .backend
                .load(&doc_id)
                .await
                .map_err(RateLimitError::into_store_unavailable)?;
            let (current, version) = match loaded {
                Some(v) => (Some(v.record), Some(v.version)),
                None => (None, None),
            };

            let Some(next) = updater(current.as_ref()) else {
                return Ok(current);
            };

            if self
                .backend
                .compare_and_swap(&doc_id, version, next.clone())
                .await
                .map_err(RateLimitError::into_store_unavailable)?
            {
                return Ok(Some(next));
            }

            debug!(key = %doc_id, attempt = attempt, "Transaction conflict, retrying");
            if attempt < max_attempts {
                tokio::time::sleep(self.retry.backoff(attempt)).await;
            }
        }

        warn!(key = %doc_id, attempts = max_attempts, "Transaction retries exhausted");
        Err(RateLimitError::StoreUnavailable(format!(
            "transaction on {} did not commit after {} attempts",
            doc_id, max_attempts
        )))
    }

    async fn sweep_older_than(&self, max_age_ms: u64, batch_limit: usize) -> Result<usize> {
        let cutoff = self.clock.now_ms().saturating_sub(max_age_ms);
        self.backend
            .delete_older_than(cutoff, batch_limit)
            .await
            .map_err(RateLimitError::into_store_unavailable)
    }

    async fn get(&self, key: &WindowKey) -> Result<Option<WindowRecord>> {
        Ok(self
            .backend
            .load(&key.document_id())
            .await
            .map_err(RateLimitError::into_store_unavailable)?
            .map(|v| v.record))
    }

    async fn record_count(&self) -> Result<usize> {
        self.backend
            .count()
            .await
            .map_err(RateLimitError::into_store_unavailable)
    }
}

/// An in-process versioned document map.
///
/// Can be told to reject the next N commits as conflicts, which is how the
/// retry path is exercised without real contention.
#[derive(Default)]
pub struct MemoryVersionedBackend {
    docs: DashMap<String, Versioned>,
    injected_conflicts: AtomicUsize,
}

impl MemoryVersionedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` compare-and-swap calls as if another writer won.
    pub fn inject_conflicts(&self, n: usize) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl VersionedBackend for MemoryVersionedBackend {
    async fn load(&self, doc_id: &str) -> Result<Option<Versioned>> {
        Ok(self.docs.get(doc_id).map(|v| v.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        doc_id: &str,
        expected: Option<u64>,
        record: WindowRecord,
    ) -> Result<bool> {
        if self.take_injected_conflict() {
            return Ok(false);
        }

        let committed = match self.docs.entry(doc_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get().version;
                if expected == Some(current) {
                    entry.insert(Versioned {
                        record,
                        version: current + 1,
                    });
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                if expected.is_none() {
                    entry.insert(Versioned { record, version: 1 });
                    true
                } else {
                    false
                }
            }
        };

        Ok(committed)
    }

    async fn delete_older_than(&self, cutoff_ms: u64, limit: usize) -> Result<usize> {
        let stale: Vec<String> = self
            .docs
            .iter()
            .filter(|v| v.value().record.window_start_ms < cutoff_ms)
            .map(|v| v.key().clone())
            .take(limit)
            .collect();

        Ok(stale
            .iter()
            .filter(|id| {
                self.docs
                    .remove_if(id.as_str(), |_, v| v.record.window_start_ms < cutoff_ms)
                    .is_some()
            })
            .count())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.docs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    fn increment(key: &WindowKey) -> impl FnMut(Option<&WindowRecord>) -> Option<WindowRecord> + Send + '_ {
        move |current| match current {
            Some(record) => Some(WindowRecord {
                count: record.count + 1,
                ..record.clone()
            }),
            None => Some(WindowRecord::fresh(key, 0)),
        }
    }

    #[tokio::test]
    async fn test_commit_without_conflict() {
        let store = OptimisticWindowStore::new(
            MemoryVersionedBackend::new(),
            Arc::new(ManualClock::new(0)),
        );
        let key = WindowKey::new("1.2.3.4", "chat");

        let committed = store.read_and_update(&key, &mut increment(&key)).await.unwrap();
        assert_eq!(committed.unwrap().count, 1);

        let committed = store.read_and_update(&key, &mut increment(&key)).await.unwrap();
        assert_eq!(committed.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let store = OptimisticWindowStore::with_retry(
            MemoryVersionedBackend::new(),
            Arc::new(ManualClock::new(0)),
            fast_retry(5),
        );
        let key = WindowKey::new("1.2.3.4", "chat");
        store.backend().inject_conflicts(3);

        let mut runs = 0;
        let committed = store
            .read_and_update(&key, &mut |current| {
                runs += 1;
                increment(&key)(current)
            })
            .await
            .unwrap();

        assert_eq!(runs, 4);
        assert_eq!(committed.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_store_unavailable() {
        let store = OptimisticWindowStore::with_retry(
            MemoryVersionedBackend::new(),
            Arc::new(ManualClock::new(0)),
            fast_retry(3),
        );
        let key = WindowKey::new("1.2.3.4", "chat");
        store.backend().inject_conflicts(10);

        let err = store
            .read_and_update(&key, &mut increment(&key))
            .await
            .unwrap_err();

        assert!(err.is_store_unavailable());
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(OptimisticWindowStore::with_retry(
            MemoryVersionedBackend::new(),
            Arc::new(ManualClock::new(0)),
            fast_retry(1_000),
        ));
        let key = WindowKey::new("1.2.3.4", "chat");

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    store.read_and_update(&key, &mut increment(&key)).await
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        assert_eq!(store.get(&key).await.unwrap().unwrap().count, 32);
    }

    /// A backend whose connection is always refused.
    struct RefusingBackend;

    fn refused() -> RateLimitError {
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused").into()
    }

    #[async_trait]
    impl VersionedBackend for RefusingBackend {
        async fn load(&self, _doc_id: &str) -> Result<Option<Versioned>> {
            Err(refused())
        }

        async fn compare_and_swap(
            &self,
            _doc_id: &str,
            _expected: Option<u64>,
            _record: WindowRecord,
        ) -> Result<bool> {
            Err(refused())
        }

        async fn delete_older_than(&self, _cutoff_ms: u64, _limit: usize) -> Result<usize> {
            Err(refused())
        }

        async fn count(&self) -> Result<usize> {
            Err(refused())
        }
    }

    #[tokio::test]
    async fn test_backend_errors_are_store_unavailable() {
        let store = OptimisticWindowStore::new(RefusingBackend, Arc::new(ManualClock::new(0)));
        let key = WindowKey::new("1.2.3.4", "chat");

        let err = store
            .read_and_update(&key, &mut increment(&key))
            .await
            .unwrap_err();
        assert!(err.is_store_unavailable());
        assert!(store.get(&key).await.unwrap_err().is_store_unavailable());
        assert!(store
            .sweep_older_than(1_000, 10)
            .await
            .unwrap_err()
            .is_store_unavailable());
        assert!(store.record_count().await.unwrap_err().is_store_unavailable());
    }

    #[tokio::test]
    async fn test_sweep_uses_clock_cutoff() {
        let clock = Arc::new(ManualClock::new(0));
        let store = OptimisticWindowStore::new(MemoryVersionedBackend::new(), clock.clone());

        for i in 0..4 {
            let key = WindowKey::new(format!("10.0.0.{}", i), "inquiry");
            store.read_and_update(&key, &mut increment(&key)).await.unwrap();
        }

        clock.set(10_000);
        assert_eq!(store.sweep_older_than(20_000, 10).await.unwrap(), 0);
        assert_eq!(store.sweep_older_than(5_000, 3).await.unwrap(), 3);
        assert_eq!(store.record_count().await.unwrap(), 1);
    }
}
