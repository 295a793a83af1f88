//! File-backed storage.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<generation>/<sha256(key)>.entry
//! ```
//!
//! An entry file holds one line of JSON metadata followed by the raw body.
//! Entries are written to a temp file and renamed into place, so a reader
//! sees either the old entry or the new one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

use super::{validate_generation, CacheStorage, CachedEntry};
use crate::error::StoreError;
use crate::http::{CacheKey, Response};

const ENTRY_EXTENSION: &str = "entry";

/// Prefix for generation directories that are being removed
const TOMBSTONE_PREFIX: &str = ".deleted-";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    key: CacheKey,
    response: Response,
    cached_at: DateTime<Utc>,
}

pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generation_dir(&self, generation: &str) -> Result<PathBuf, StoreError> {
        validate_generation(generation)?;
        Ok(self.root.join(generation))
    }

    fn entry_path(&self, generation: &str, key: &CacheKey) -> Result<PathBuf, StoreError> {
        let mut hasher = Sha256::new();
        hasher.update(key.to_string().as_bytes());
        let name = format!("{}.{}", hex::encode(hasher.finalize()), ENTRY_EXTENSION);
        Ok(self.generation_dir(generation)?.join(name))
    }

    fn encode(key: &CacheKey, entry: &CachedEntry) -> Result<Vec<u8>, StoreError> {
        let header = EntryHeader {
            key: key.clone(),
            response: entry.response.clone(),
            cached_at: entry.cached_at,
        };
        // Compact JSON never contains a raw newline
        let mut bytes = serde_json::to_vec(&header)?;
        bytes.push(b'\n');
        bytes.extend_from_slice(&entry.response.body);
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> Result<(CacheKey, CachedEntry), StoreError> {
        let split = bytes
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| StoreError::Unavailable("entry file has no header".to_string()))?;
        let header: EntryHeader = serde_json::from_slice(&bytes[..split])?;
        let mut response = header.response;
        response.body = bytes[split + 1..].to_vec();
        Ok((
            header.key,
            CachedEntry {
                response,
                cached_at: header.cached_at,
            },
        ))
    }

    async fn write_entry(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp = path.with_extension(format!(
            "tmp-{}-{}",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&temp, bytes).await?;
        if let Err(e) = fs::rename(&temp, path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for FileStorage {
    async fn open(&self, generation: &str) -> Result<(), StoreError> {
        fs::create_dir_all(self.generation_dir(generation)?).await?;
        Ok(())
    }

    async fn generations(&self) -> Result<Vec<String>, StoreError> {
        let mut generations = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_dir() {
                continue;
            }
            let name = item.file_name().to_string_lossy().into_owned();
            if name.starts_with(TOMBSTONE_PREFIX) {
                continue;
            }
            if validate_generation(&name).is_ok() {
                generations.push(name);
            }
        }
        generations.sort();
        Ok(generations)
    }

    async fn delete_generation(&self, generation: &str) -> Result<bool, StoreError> {
        let dir = self.generation_dir(generation)?;
        if !fs::try_exists(&dir).await? {
            return Ok(false);
        }

        // Rename first so the generation disappears from listings at once
        let tombstone = self.root.join(format!(
            "{}{}-{}",
            TOMBSTONE_PREFIX,
            generation,
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::rename(&dir, &tombstone).await?;
        if let Err(e) = fs::remove_dir_all(&tombstone).await {
            warn!(path = %tombstone.display(), error = %e, "Failed to remove deleted generation");
        }
        debug!(generation = generation, "Deleted generation");
        Ok(true)
    }

    async fn get(
        &self,
        generation: &str,
        key: &CacheKey,
    ) -> Result<Option<CachedEntry>, StoreError> {
        let path = self.entry_path(generation, key)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (stored_key, entry) = Self::decode(&bytes)?;
        // Guard against a hash collision serving the wrong entry
        if &stored_key != key {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn put(
        &self,
        generation: &str,
        key: &CacheKey,
        entry: &CachedEntry,
    ) -> Result<(), StoreError> {
        let path = self.entry_path(generation, key)?;
        let bytes = Self::encode(key, entry)?;
        self.write_entry(&path, &bytes).await
    }

    async fn keys(&self, generation: &str) -> Result<Vec<CacheKey>, StoreError> {
        let dir = self.generation_dir(generation)?;
        let mut listing = match fs::read_dir(&dir).await {
            Ok(listing) => listing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(item) = listing.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            match fs::read(&path).await.map_err(StoreError::from).and_then(|b| Self::decode(&b)) {
                Ok((key, _)) => keys.push(key),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable entry"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}
