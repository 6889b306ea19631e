mod in_memory;
mod metrics;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::StoreError;

pub use in_memory::InMemoryKeyValueStore;
pub use metrics::{StoreMetrics, StoreMetricsSnapshot};

/// A single entry of a key-value store. Stores operate on opaque byte
/// payloads; domain types are a concern of the user's processing code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Durable state keyed by string, shared process-wide across partitions.
///
/// Implementations must be thread-safe. Absence is not an error: `get` of a
/// missing key returns `Ok(None)` and `delete` of a missing key succeeds.
/// After `flush` returns, all prior successful writes are durable;
/// write-through backends may implement it as a no-op.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Returns only the entries that were found; ordering need not match the
    /// input. An empty key list must not touch the backend.
    async fn get_all(&self, keys: &[String]) -> Result<Vec<KeyValue>, StoreError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Executes the writes as a single batch. A partial failure is reported
    /// as one aggregated [`StoreError::BatchWrite`].
    async fn put_all(&self, entries: Vec<KeyValue>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn flush(&self) -> Result<(), StoreError>;
}

/// A per-partition handle to a shared store backend.
///
/// Mutations raise a dirty flag so the commit protocol knows the partition
/// touched this store since its last batch close and must flush it before
/// marking offsets. Handles are cheap to clone; clones share the flag.
#[derive(Clone)]
pub struct TrackedStore {
    name: String,
    inner: Arc<dyn KeyValueStore>,
    dirty: Arc<AtomicBool>,
}

impl TrackedStore {
    fn new(name: String, inner: Arc<dyn KeyValueStore>) -> Self {
        Self {
            name,
            inner,
            dirty: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

#[async_trait]
impl KeyValueStore for TrackedStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    async fn get_all(&self, keys: &[String]) -> Result<Vec<KeyValue>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.inner.get_all(keys).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.dirty.store(true, Ordering::Release);
        self.inner.put(key, value).await
    }

    async fn put_all(&self, entries: Vec<KeyValue>) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.dirty.store(true, Ordering::Release);
        self.inner.put_all(entries).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.dirty.store(true, Ordering::Release);
        self.inner.delete(key).await
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.inner.flush().await?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }
}

/// The set of store handles wired to one partition processor. The user
/// factory receives this once per partition and clones out the handles its
/// processor needs.
#[derive(Clone, Default)]
pub struct StoreSet {
    stores: Vec<TrackedStore>,
}

impl StoreSet {
    pub(crate) fn new(backends: &HashMap<String, Arc<dyn KeyValueStore>>) -> Self {
        let stores = backends
            .iter()
            .map(|(name, backend)| TrackedStore::new(name.clone(), backend.clone()))
            .collect();
        Self { stores }
    }

    pub fn get(&self, name: &str) -> Option<TrackedStore> {
        self.stores.iter().find(|s| s.name == name).cloned()
    }

    pub(crate) fn tracked(&self) -> &[TrackedStore] {
        &self.stores
    }

    pub(crate) fn any_dirty(&self) -> bool {
        self.stores.iter().any(TrackedStore::is_dirty)
    }
}
