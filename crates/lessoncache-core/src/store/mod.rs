//! Versioned response storage.
//!
//! Entries are grouped into named generations. The proxy writes into exactly
//! one current generation; every other generation is stale and removed at
//! activation.
//!
//! Backends:
//! - `MemoryStorage`: in-process, used by tests and embedded hosts
//! - `FileStorage`: one directory per generation under a cache root

pub mod file;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::http::{CacheKey, Response};
use crate::state::ProxyState;

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// A stored response and when it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    pub response: Response,
    pub cached_at: DateTime<Utc>,
}

impl CachedEntry {
    pub fn new(response: Response) -> Self {
        Self {
            response,
            cached_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        format_age(self.cached_at)
    }
}

/// Human-readable age of a cache timestamp ("just now", "5m ago", "2h ago").
pub fn format_age(cached_at: DateTime<Utc>) -> String {
    let minutes = (Utc::now() - cached_at).num_minutes();
    if minutes < 1 {
        // Also covers clock skew
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        if (minutes % 1440) / 60 >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}

/// Backing store for cache generations.
///
/// Writes replace an entry wholesale; concurrent writers to the same key
/// resolve last-writer-wins.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a generation, creating it if needed.
    async fn open(&self, generation: &str) -> Result<(), StoreError>;

    /// All generations currently present.
    async fn generations(&self) -> Result<Vec<String>, StoreError>;

    /// Returns whether the generation existed.
    async fn delete_generation(&self, generation: &str) -> Result<bool, StoreError>;

    async fn get(&self, generation: &str, key: &CacheKey)
        -> Result<Option<CachedEntry>, StoreError>;

    async fn put(
        &self,
        generation: &str,
        key: &CacheKey,
        entry: &CachedEntry,
    ) -> Result<(), StoreError>;

    /// Bulk write. Backends that can should make this all-or-nothing.
    async fn put_all(
        &self,
        generation: &str,
        entries: &[(CacheKey, CachedEntry)],
    ) -> Result<(), StoreError> {
        for (key, entry) in entries {
            self.put(generation, key, entry).await?;
        }
        Ok(())
    }

    async fn keys(&self, generation: &str) -> Result<Vec<CacheKey>, StoreError>;
}

/// Generation ids double as directory names, so keep them to a safe alphabet.
pub fn validate_generation(generation: &str) -> Result<(), StoreError> {
    // A leading dot is reserved for tombstones and temp files
    let valid = !generation.is_empty()
        && !generation.starts_with('.')
        && generation
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidGeneration(generation.to_string()))
    }
}

#[derive(Clone)]
enum GenerationSource {
    Fixed(String),
    Current(watch::Receiver<Option<String>>),
}

/// The strategy engine's view of the store: one current generation, with
/// store failures absorbed as misses or skipped writes.
#[derive(Clone)]
pub struct CacheStore {
    storage: Arc<dyn CacheStorage>,
    generation: GenerationSource,
}

impl CacheStore {
    /// A view pinned to one generation.
    pub fn new(storage: Arc<dyn CacheStorage>, generation: impl Into<String>) -> Self {
        Self {
            storage,
            generation: GenerationSource::Fixed(generation.into()),
        }
    }

    /// A view that follows the state's current generation. With no current
    /// generation every lookup misses and writes are skipped.
    pub fn tracking(storage: Arc<dyn CacheStorage>, state: &ProxyState) -> Self {
        Self {
            storage,
            generation: GenerationSource::Current(state.watch_current()),
        }
    }

    pub fn generation(&self) -> Option<String> {
        match &self.generation {
            GenerationSource::Fixed(generation) => Some(generation.clone()),
            GenerationSource::Current(current) => current.borrow().clone(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    /// Look up an entry in the current generation. Read failures count as a miss.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CachedEntry> {
        let Some(generation) = self.generation() else {
            debug!(key = %key, "No current generation, cache miss");
            return None;
        };
        match self.storage.get(&generation, key).await {
            Ok(Some(entry)) => {
                debug!(key = %key, "Cache hit");
                Some(entry)
            }
            Ok(None) => {
                debug!(key = %key, "Cache miss");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    /// Write a response into the current generation. Failures are logged only.
    pub async fn write(&self, key: &CacheKey, response: &Response) -> bool {
        let Some(generation) = self.generation() else {
            debug!(key = %key, "No current generation, not caching");
            return false;
        };
        let entry = CachedEntry::new(response.clone());
        match self.storage.put(&generation, key, &entry).await {
            Ok(()) => {
                debug!(key = %key, generation = %generation, "Cached response");
                true
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache write failed");
                false
            }
        }
    }
}
