//! Signal Record Store: a key-value mailbox whose records expire on their own.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::clock::Clock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("no free key near {0}")]
    Conflict(String),
}

#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Write `value` under `key` for `ttl`. Returns `false` without writing when
    /// a live record already holds the key.
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Values of every live record whose key starts with `prefix`, in no
    /// particular order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: SignalStore + ?Sized> SignalStore for Arc<T> {
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).put_if_absent(key, value, ttl).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        (**self).scan_prefix(prefix).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        (**self).exists(key).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        (**self).remove(key).await
    }
}

#[derive(Debug)]
struct Record {
    value: String,
    expires_at: u64,
}

/// In-process store used by tests and by the relay's `memory` backend.
/// Expired records are invisible immediately and purged on the next scan.
#[derive(Debug)]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    records: Mutex<BTreeMap<String, Record>>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Live record count.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.records
            .lock()
            .values()
            .filter(|record| record.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes a record regardless of its remaining lifetime. Tests use it to
    /// simulate the relay losing a signal.
    pub fn forget_where(&self, predicate: impl Fn(&str, &str) -> bool) -> usize {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|key, record| !predicate(key, &record.value));
        before - records.len()
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut records = self.records.lock();
        if let Some(existing) = records.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }
        records.insert(
            key.to_string(),
            Record {
                value: value.to_string(),
                expires_at: now.saturating_add(ttl.as_millis() as u64),
            },
        );
        Ok(true)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now_millis();
        let mut records = self.records.lock();
        records.retain(|_, record| record.expires_at > now);
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, record)| record.value.clone())
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        Ok(self
            .records
            .lock()
            .get(key)
            .is_some_and(|record| record.expires_at > now))
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.records.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (ManualClock, MemoryStore) {
        let clock = ManualClock::new(10_000);
        let store = MemoryStore::new(Arc::new(clock.clone()));
        (clock, store)
    }

    #[test_timeout::tokio_timeout_test]
    async fn put_never_overwrites_live_record() {
        let (_clock, store) = store();
        assert!(store.put_if_absent("k", "a", Duration::from_secs(1)).await.unwrap());
        assert!(!store.put_if_absent("k", "b", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.scan_prefix("k").await.unwrap(), vec!["a".to_string()]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn records_expire_against_clock() {
        let (clock, store) = store();
        store.put_if_absent("room:A", "1", Duration::from_millis(500)).await.unwrap();
        assert!(store.exists("room:A").await.unwrap());
        clock.advance(500);
        assert!(!store.exists("room:A").await.unwrap());
        assert!(store.put_if_absent("room:A", "2", Duration::from_secs(1)).await.unwrap());
    }

    #[test_timeout::tokio_timeout_test]
    async fn scan_is_scoped_to_prefix() {
        let (_clock, store) = store();
        let ttl = Duration::from_secs(5);
        store.put_if_absent("video:A:join:x", "1", ttl).await.unwrap();
        store.put_if_absent("video:A:leave:x", "2", ttl).await.unwrap();
        store.put_if_absent("video:AB:join:y", "3", ttl).await.unwrap();
        store.put_if_absent("room:A", "", ttl).await.unwrap();
        let mut values = store.scan_prefix("video:A:").await.unwrap();
        values.sort();
        assert_eq!(values, vec!["1".to_string(), "2".to_string()]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn remove_and_forget() {
        let (_clock, store) = store();
        let ttl = Duration::from_secs(5);
        store.put_if_absent("a", "x", ttl).await.unwrap();
        store.put_if_absent("b", "y", ttl).await.unwrap();
        store.remove("a").await.unwrap();
        assert_eq!(store.forget_where(|_, value| value == "y"), 1);
        assert!(store.is_empty());
    }
}
