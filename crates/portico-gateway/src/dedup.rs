//! Request deduplication store.
//!
//! The store's `check_and_insert` is the single atomic primitive the
//! idempotency stage builds on; there is deliberately no separate
//! read-then-write path. Records expire lazily against the injected clock:
//! an expired record behaves exactly like an absent one.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use portico_common::protocol::Result;

use crate::clock::Clock;

/// Outcome of the atomic check-and-insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// The ID was unknown (or expired); a pending record now exists and the
    /// caller owns it.
    Inserted,
    /// Another request with this ID is in flight.
    Pending,
    /// A request with this ID already completed within the retention window.
    Completed,
}

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically claims an ID. At most one concurrent caller per ID gets
    /// `Inserted`.
    async fn check_and_insert(&self, id: &str) -> Result<CheckResult>;

    /// Marks a claimed ID as completed. The record keeps rejecting
    /// duplicates until the retention window elapses.
    async fn complete(&self, id: &str) -> Result<()>;

    /// Releases a claimed ID after a failed or cancelled first attempt so a
    /// genuine retry is allowed through.
    async fn remove(&self, id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    state: RecordState,
    first_seen: Instant,
}

/// In-process dedup store.
///
/// Retention is measured from first sight of the ID. Expired records are
/// replaced in place on the next check; [`MemoryDedupStore::sweep`] purges
/// them in bulk for long-running processes.
pub struct MemoryDedupStore {
    clock: Arc<dyn Clock>,
    retention: Duration,
    records: Mutex<HashMap<String, Record>>,
}

impl MemoryDedupStore {
    pub fn new(clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self {
            clock,
            retention,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Drops every expired record. Intended to run periodically.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.retain(|_, record| now.duration_since(record.first_seen) < self.retention);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn check_and_insert(&self, id: &str) -> Result<CheckResult> {
        let now = self.clock.now();
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(record) = records.get(id) {
            if now.duration_since(record.first_seen) < self.retention {
                return Ok(match record.state {
                    RecordState::Pending => CheckResult::Pending,
                    RecordState::Completed => CheckResult::Completed,
                });
            }
        }

        records.insert(
            id.to_string(),
            Record {
                state: RecordState::Pending,
                first_seen: now,
            },
        );
        Ok(CheckResult::Inserted)
    }

    async fn complete(&self, id: &str) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = records.get_mut(id) {
            record.state = RecordState::Completed;
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock(retention: Duration) -> (MemoryDedupStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryDedupStore::new(clock.clone(), retention);
        (store, clock)
    }

    #[tokio::test]
    async fn test_first_claim_wins() {
        let (store, _) = store_with_clock(Duration::from_secs(60));
        assert_eq!(
            store.check_and_insert("req-1").await.unwrap(),
            CheckResult::Inserted
        );
        assert_eq!(
            store.check_and_insert("req-1").await.unwrap(),
            CheckResult::Pending
        );
    }

    #[tokio::test]
    async fn test_completed_rejects_until_retention_lapses() {
        let (store, clock) = store_with_clock(Duration::from_secs(60));
        store.check_and_insert("req-1").await.unwrap();
        store.complete("req-1").await.unwrap();

        clock.advance(Duration::from_secs(59));
        assert_eq!(
            store.check_and_insert("req-1").await.unwrap(),
            CheckResult::Completed
        );

        clock.advance(Duration::from_secs(1));
        assert_eq!(
            store.check_and_insert("req-1").await.unwrap(),
            CheckResult::Inserted
        );
    }

    #[tokio::test]
    async fn test_remove_allows_retry() {
        let (store, _) = store_with_clock(Duration::from_secs(60));
        store.check_and_insert("req-1").await.unwrap();
        store.remove("req-1").await.unwrap();
        assert_eq!(
            store.check_and_insert("req-1").await.unwrap(),
            CheckResult::Inserted
        );
    }

    #[tokio::test]
    async fn test_sweep_purges_expired_records() {
        let (store, clock) = store_with_clock(Duration::from_secs(60));
        store.check_and_insert("old").await.unwrap();
        store.complete("old").await.unwrap();
        clock.advance(Duration::from_secs(61));
        store.check_and_insert("fresh").await.unwrap();

        store.sweep();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.check_and_insert("fresh").await.unwrap(),
            CheckResult::Pending
        );
    }
}
