use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{KeyValue, KeyValueStore};
use crate::errors::StoreError;

/// A process-local key-value store backed by a hash map.
///
/// Writes are applied synchronously, so `flush` is a no-op. Useful for
/// tests and for derived state that does not need to survive a restart.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.lock().expect("store mutex poisoned");
        Ok(entries.get(key).cloned())
    }

    async fn get_all(&self, keys: &[String]) -> Result<Vec<KeyValue>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let entries = self.entries.lock().expect("store mutex poisoned");
        Ok(keys
            .iter()
            .filter_map(|key| {
                entries.get(key).map(|value| KeyValue {
                    key: key.clone(),
                    value: value.clone(),
                })
            })
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().expect("store mutex poisoned");
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn put_all(&self, batch: Vec<KeyValue>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().expect("store mutex poisoned");
        for kv in batch {
            entries.insert(kv.key, kv.value);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().expect("store mutex poisoned");
        entries.remove(key);
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
