use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{validate_generation, CacheStorage, CachedEntry};
use crate::error::StoreError;
use crate::http::CacheKey;

type Generation = HashMap<CacheKey, CachedEntry>;

/// In-process storage. Contents are lost with the process.
#[derive(Default)]
pub struct MemoryStorage {
    generations: RwLock<BTreeMap<String, Generation>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn open(&self, generation: &str) -> Result<(), StoreError> {
        validate_generation(generation)?;
        self.generations
            .write()
            .await
            .entry(generation.to_string())
            .or_default();
        Ok(())
    }

    async fn generations(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.generations.read().await.keys().cloned().collect())
    }

    async fn delete_generation(&self, generation: &str) -> Result<bool, StoreError> {
        Ok(self.generations.write().await.remove(generation).is_some())
    }

    async fn get(
        &self,
        generation: &str,
        key: &CacheKey,
    ) -> Result<Option<CachedEntry>, StoreError> {
        Ok(self
            .generations
            .read()
            .await
            .get(generation)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(
        &self,
        generation: &str,
        key: &CacheKey,
        entry: &CachedEntry,
    ) -> Result<(), StoreError> {
        validate_generation(generation)?;
        self.generations
            .write()
            .await
            .entry(generation.to_string())
            .or_default()
            .insert(key.clone(), entry.clone());
        Ok(())
    }

    async fn put_all(
        &self,
        generation: &str,
        entries: &[(CacheKey, CachedEntry)],
    ) -> Result<(), StoreError> {
        validate_generation(generation)?;
        // Single lock acquisition: readers see none or all of the batch
        let mut generations = self.generations.write().await;
        let target = generations.entry(generation.to_string()).or_default();
        for (key, entry) in entries {
            target.insert(key.clone(), entry.clone());
        }
        Ok(())
    }

    async fn keys(&self, generation: &str) -> Result<Vec<CacheKey>, StoreError> {
        let mut keys: Vec<CacheKey> = self
            .generations
            .read()
            .await
            .get(generation)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}
