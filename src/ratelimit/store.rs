//! Window store trait and the in-process implementation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::clock::Clock;
use super::record::{WindowKey, WindowRecord};
use crate::error::{RateLimitError, Result};

/// The read-decide-write step run inside a store transaction.
///
/// Receives the current record (if any) and returns the record to persist,
/// or `None` to leave the stored state untouched. Stores that retry on
/// conflict may call it more than once; only the final call is committed.
pub type Updater<'a> = dyn FnMut(Option<&WindowRecord>) -> Option<WindowRecord> + Send + 'a;

/// Durable storage for window records.
///
/// Implementations must serialize `read_and_update` per key: two concurrent
/// callers for the same key never observe the same pre-update record.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Atomically apply `updater` to the record stored under `key`.
    ///
    /// Returns the record as committed, or `None` if nothing is stored.
    async fn read_and_update(
        &self,
        key: &WindowKey,
        updater: &mut Updater<'_>,
    ) -> Result<Option<WindowRecord>>;

    /// Delete at most `batch_limit` records whose window started more than
    /// `max_age_ms` ago. Returns how many were deleted.
    async fn sweep_older_than(&self, max_age_ms: u64, batch_limit: usize) -> Result<usize>;

    /// Read a record without modifying it.
    async fn get(&self, key: &WindowKey) -> Result<Option<WindowRecord>>;

    /// Number of records currently stored.
    async fn record_count(&self) -> Result<usize>;
}

/// An in-process window store.
///
/// The per-key entry lock held by `DashMap` while the updater runs is what
/// makes the read, the decision and the write a single unit. Only suitable
/// when every limiter instance shares this process.
pub struct MemoryWindowStore {
    records: DashMap<String, WindowRecord>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl MemoryWindowStore {
    /// Create an empty store using `clock` for sweep cutoffs.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage; while unavailable every operation fails with
    /// `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RateLimitError::StoreUnavailable(
                "memory store is marked unavailable".to_string(),
            ))
        }
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn read_and_update(
        &self,
        key: &WindowKey,
        updater: &mut Updater<'_>,
    ) -> Result<Option<WindowRecord>> {
        self.ensure_available()?;

        let doc_id = key.document_id();
        trace!(key = %doc_id, "Updating window record");

        let committed = match self.records.entry(doc_id) {
            Entry::Occupied(mut entry) => {
                if let Some(next) = updater(Some(entry.get())) {
                    entry.insert(next);
                }
                Some(entry.get().clone())
            }
            Entry::Vacant(entry) => {
                updater(None).map(|next| entry.insert(next).value().clone())
            }
        };

        Ok(committed)
    }

    async fn sweep_older_than(&self, max_age_ms: u64, batch_limit: usize) -> Result<usize> {
        self.ensure_available()?;

        let cutoff = self.clock.now_ms().saturating_sub(max_age_ms);
        let stale: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.value().window_start_ms < cutoff)
            .map(|r| r.key().clone())
            .take(batch_limit)
            .collect();

        let mut deleted = 0;
        for doc_id in stale {
            // The record may have rolled into a new window since the scan.
            if self
                .records
                .remove_if(&doc_id, |_, record| record.window_start_ms < cutoff)
                .is_some()
            {
                deleted += 1;
            }
        }

        debug!(deleted = deleted, cutoff = cutoff, "Swept stale window records");
        Ok(deleted)
    }

    async fn get(&self, key: &WindowKey) -> Result<Option<WindowRecord>> {
        self.ensure_available()?;
        Ok(self.records.get(&key.document_id()).map(|r| r.value().clone()))
    }

    async fn record_count(&self) -> Result<usize> {
        self.ensure_available()?;
        Ok(self.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn store_at(now_ms: u64) -> (Arc<ManualClock>, MemoryWindowStore) {
        let clock = Arc::new(ManualClock::new(now_ms));
        let store = MemoryWindowStore::new(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_read_and_update_creates_record() {
        let (_, store) = store_at(0);
        let key = WindowKey::new("1.2.3.4", "chat");

        let committed = store
            .read_and_update(&key, &mut |current| {
                assert!(current.is_none());
                Some(WindowRecord::fresh(&key, 10))
            })
            .await
            .unwrap();

        assert_eq!(committed.unwrap().count, 1);
        assert_eq!(store.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_and_update_sees_previous_write() {
        let (_, store) = store_at(0);
        let key = WindowKey::new("1.2.3.4", "chat");

        for _ in 0..3 {
            store
                .read_and_update(&key, &mut |current| match current {
                    Some(record) => Some(WindowRecord {
                        count: record.count + 1,
                        ..record.clone()
                    }),
                    None => Some(WindowRecord::fresh(&key, 0)),
                })
                .await
                .unwrap();
        }

        assert_eq!(store.get(&key).await.unwrap().unwrap().count, 3);
    }

    #[tokio::test]
    async fn test_updater_returning_none_leaves_store_untouched() {
        let (_, store) = store_at(0);
        let key = WindowKey::new("1.2.3.4", "chat");

        let committed = store.read_and_update(&key, &mut |_| None).await.unwrap();

        assert!(committed.is_none());
        assert_eq!(store.record_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let (_, store) = store_at(0);
        store.set_available(false);

        let key = WindowKey::new("1.2.3.4", "chat");
        let err = store.read_and_update(&key, &mut |_| None).await.unwrap_err();
        assert!(err.is_store_unavailable());

        store.set_available(true);
        tokio_test::assert_ok!(store.read_and_update(&key, &mut |_| None).await);
    }

    #[tokio::test]
    async fn test_sweep_respects_cutoff_and_batch_limit() {
        let (clock, store) = store_at(0);

        for i in 0..5 {
            let key = WindowKey::new(format!("10.0.0.{}", i), "chat");
            store
                .read_and_update(&key, &mut |_| Some(WindowRecord::fresh(&key, 0)))
                .await
                .unwrap();
        }
        let fresh_key = WindowKey::new("10.0.1.1", "chat");
        store
            .read_and_update(&fresh_key, &mut |_| Some(WindowRecord::fresh(&fresh_key, 90_000)))
            .await
            .unwrap();

        clock.set(100_000);

        // Cutoff is 40_000: the five records at 0 are stale, the one at 90_000 is not.
        assert_eq!(store.sweep_older_than(60_000, 3).await.unwrap(), 3);
        assert_eq!(store.sweep_older_than(60_000, 3).await.unwrap(), 2);
        assert_eq!(store.sweep_older_than(60_000, 3).await.unwrap(), 0);

        assert_eq!(store.record_count().await.unwrap(), 1);
        assert!(store.get(&fresh_key).await.unwrap().is_some());
    }
}
