use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::{KeyValue, KeyValueStore};
use crate::errors::StoreError;

/// Transparent decorator that counts store operations under a label.
///
/// Wrap any backend before handing it to the container config; the store
/// contract is unchanged, only the counters are added.
pub struct StoreMetrics {
    inner: Arc<dyn KeyValueStore>,
    label: String,
    gets: AtomicU64,
    multi_gets: AtomicU64,
    puts: AtomicU64,
    multi_puts: AtomicU64,
    deletes: AtomicU64,
    flushes: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreMetricsSnapshot {
    pub label: String,
    pub gets: u64,
    pub multi_gets: u64,
    pub puts: u64,
    pub multi_puts: u64,
    pub deletes: u64,
    pub flushes: u64,
    pub errors: u64,
}

impl StoreMetrics {
    pub fn new(inner: Arc<dyn KeyValueStore>, label: impl Into<String>) -> Self {
        Self {
            inner,
            label: label.into(),
            gets: AtomicU64::new(0),
            multi_gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            multi_puts: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            label: self.label.clone(),
            gets: self.gets.load(Ordering::Relaxed),
            multi_gets: self.multi_gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            multi_puts: self.multi_puts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn track<T>(&self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if result.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

#[async_trait]
impl KeyValueStore for StoreMetrics {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        debug!(store = %self.label, key, "get");
        self.track(self.inner.get(key).await)
    }

    async fn get_all(&self, keys: &[String]) -> Result<Vec<KeyValue>, StoreError> {
        self.multi_gets.fetch_add(1, Ordering::Relaxed);
        debug!(store = %self.label, count = keys.len(), "get_all");
        self.track(self.inner.get_all(keys).await)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        debug!(store = %self.label, key, "put");
        self.track(self.inner.put(key, value).await)
    }

    async fn put_all(&self, entries: Vec<KeyValue>) -> Result<(), StoreError> {
        self.multi_puts.fetch_add(1, Ordering::Relaxed);
        debug!(store = %self.label, count = entries.len(), "put_all");
        self.track(self.inner.put_all(entries).await)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        debug!(store = %self.label, key, "delete");
        self.track(self.inner.delete(key).await)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        debug!(store = %self.label, "flush");
        self.track(self.inner.flush().await)
    }
}
