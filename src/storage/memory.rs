//! In-memory storage, used by followers in tests and for throwaway dev daemons

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{Storage, StorageError};

/// In-memory storage backed by an ordered map
#[derive(Default)]
pub struct MemoryStorage {
    store: RwLock<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.store.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let store = self.store.read().unwrap();
        Ok(store.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut store = self.store.write().unwrap();
        store.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut store = self.store.write().unwrap();
        store.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let store = self.store.read().unwrap();
        let keys = store
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter_map(|(k, _)| k.strip_prefix(prefix).map(str::to_string))
            .collect();
        Ok(keys)
    }
}
