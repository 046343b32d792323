//! Key-value storage contract and an in-memory backend.
//!
//! The plugin only needs `get_item` and `set_item`. Methods return boxed
//! futures so backends can be synchronous (return a ready future) or
//! asynchronous, and so the trait stays object-safe.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Failure reported by a storage backend.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct StorageError(pub String);

/// Boxed future alias for storage results.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// String key-value store the plugin persists into.
pub trait Storage: Send + Sync {
    /// Read the value stored under `key`, or `None` if absent.
    fn get_item<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set_item<'a>(&'a self, key: &'a str, value: String) -> StorageFuture<'a, ()>;
}

impl<S: Storage + ?Sized> Storage for Arc<S> {
    fn get_item<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>> {
        (**self).get_item(key)
    }

    fn set_item<'a>(&'a self, key: &'a str, value: String) -> StorageFuture<'a, ()> {
        (**self).set_item(key, value)
    }
}

#[derive(Default)]
struct MemoryInner {
    items: HashMap<String, String>,
    reads: usize,
    writes: HashMap<String, usize>,
    failing: HashSet<String>,
    failing_writes: HashSet<String>,
}

/// In-memory storage for tests and embedding.
///
/// Counts reads and per-key writes, and can be told to fail operations on
/// chosen keys.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-seeded with `items`. Seeding is not counted as writes.
    pub fn with_items<K, V>(items: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let storage = Self::new();
        storage.lock().items = items
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        storage
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current value under `key`, bypassing counters.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.lock().items.get(key).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.lock().items.clone()
    }

    pub fn read_count(&self) -> usize {
        self.lock().reads
    }

    pub fn write_count(&self, key: &str) -> usize {
        self.lock().writes.get(key).copied().unwrap_or(0)
    }

    pub fn total_writes(&self) -> usize {
        self.lock().writes.values().sum()
    }

    /// Make every later read or write of `key` fail.
    pub fn fail_key(&self, key: &str) {
        self.lock().failing.insert(key.to_string());
    }

    /// Make later writes of `key` fail; reads keep working.
    pub fn fail_writes(&self, key: &str) {
        self.lock().failing_writes.insert(key.to_string());
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.failing.clear();
        inner.failing_writes.clear();
    }
}

impl Storage for MemoryStorage {
    fn get_item<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>> {
        let result = {
            let mut inner = self.lock();
            inner.reads += 1;
            if inner.failing.contains(key) {
                Err(StorageError(format!("read of '{key}' failed")))
            } else {
                Ok(inner.items.get(key).cloned())
            }
        };
        Box::pin(async move { result })
    }

    fn set_item<'a>(&'a self, key: &'a str, value: String) -> StorageFuture<'a, ()> {
        let result = {
            let mut inner = self.lock();
            if inner.failing.contains(key) || inner.failing_writes.contains(key) {
                Err(StorageError(format!("write of '{key}' failed")))
            } else {
                *inner.writes.entry(key.to_string()).or_default() += 1;
                inner.items.insert(key.to_string(), value);
                Ok(())
            }
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_get_set() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get_item("a").await.unwrap(), None);

        storage.set_item("a", "1".to_string()).await.unwrap();
        storage.set_item("a", "2".to_string()).await.unwrap();

        assert_eq!(storage.get_item("a").await.unwrap(), Some("2".to_string()));
        assert_eq!(storage.write_count("a"), 2);
        assert_eq!(storage.read_count(), 2);
    }

    #[tokio::test]
    async fn seeded_items_are_not_counted() {
        let storage = MemoryStorage::with_items([("k", "v")]);
        assert_eq!(storage.total_writes(), 0);
        assert_eq!(storage.peek("k"), Some("v".to_string()));
    }

    #[tokio::test]
    async fn failing_keys_report_errors() {
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_key("bad");

        assert!(storage.set_item("bad", "x".to_string()).await.is_err());
        assert!(storage.get_item("bad").await.is_err());
        assert!(storage.set_item("good", "x".to_string()).await.is_ok());

        storage.clear_failures();
        assert!(storage.set_item("bad", "x".to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn write_only_failures_keep_reads_working() {
        let storage = MemoryStorage::with_items([("k", "v")]);
        storage.fail_writes("k");

        assert_eq!(storage.get_item("k").await.unwrap(), Some("v".to_string()));
        assert!(storage.set_item("k", "w".to_string()).await.is_err());
        assert_eq!(storage.peek("k"), Some("v".to_string()));
    }
}
