//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{DeliveryError, FetchError, StoreError};
use crate::fetch::Fetcher;
use crate::http::{CacheKey, Request, Response};
use crate::store::{CacheStorage, CachedEntry, MemoryStorage};
use crate::sync::{DeferredRecord, DeliveryEndpoint};

/// Scripted network. Unknown URLs answer 404.
pub struct MockFetcher {
    routes: Mutex<HashMap<String, Response>>,
    calls: Mutex<Vec<String>>,
    offline: AtomicBool,
    delay: Option<Duration>,
    gate: watch::Sender<bool>,
}

impl MockFetcher {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            routes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
            delay: None,
            gate,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn respond(&self, url: &str, response: Response) {
        self.routes.lock().unwrap().insert(url.to_string(), response);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Block every fetch until `release` is called.
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        let url = request.url.as_str().to_string();
        self.calls.lock().unwrap().push(url.clone());

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Unreachable(url));
        }
        Ok(self
            .routes
            .lock()
            .unwrap()
            .get(&url)
            .cloned()
            .unwrap_or_else(|| Response::new(404, "not found")))
    }
}

/// Storage whose every operation fails.
pub struct FailingStorage;

#[async_trait]
impl CacheStorage for FailingStorage {
    async fn open(&self, _generation: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".to_string()))
    }

    async fn generations(&self) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unavailable("disk full".to_string()))
    }

    async fn delete_generation(&self, _generation: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("disk full".to_string()))
    }

    async fn get(
        &self,
        _generation: &str,
        _key: &CacheKey,
    ) -> Result<Option<CachedEntry>, StoreError> {
        Err(StoreError::Unavailable("disk full".to_string()))
    }

    async fn put(
        &self,
        _generation: &str,
        _key: &CacheKey,
        _entry: &CachedEntry,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".to_string()))
    }

    async fn keys(&self, _generation: &str) -> Result<Vec<CacheKey>, StoreError> {
        Err(StoreError::Unavailable("disk full".to_string()))
    }
}

/// In-memory storage that can be told to fail bulk writes, or deleting one
/// named generation.
pub struct FlakyStorage {
    inner: MemoryStorage,
    fail_put_all: AtomicBool,
    fail_delete: Mutex<Option<String>>,
}

impl FlakyStorage {
    pub fn new() -> Self {
        Self {
            inner: MemoryStorage::new(),
            fail_put_all: AtomicBool::new(false),
            fail_delete: Mutex::new(None),
        }
    }

    pub fn fail_put_all(&self, fail: bool) {
        self.fail_put_all.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete_of(&self, generation: Option<&str>) {
        *self.fail_delete.lock().unwrap() = generation.map(String::from);
    }
}

#[async_trait]
impl CacheStorage for FlakyStorage {
    async fn open(&self, generation: &str) -> Result<(), StoreError> {
        self.inner.open(generation).await
    }

    async fn generations(&self) -> Result<Vec<String>, StoreError> {
        self.inner.generations().await
    }

    async fn delete_generation(&self, generation: &str) -> Result<bool, StoreError> {
        if self.fail_delete.lock().unwrap().as_deref() == Some(generation) {
            return Err(StoreError::Unavailable("device busy".to_string()));
        }
        self.inner.delete_generation(generation).await
    }

    async fn get(
        &self,
        generation: &str,
        key: &CacheKey,
    ) -> Result<Option<CachedEntry>, StoreError> {
        self.inner.get(generation, key).await
    }

    async fn put(
        &self,
        generation: &str,
        key: &CacheKey,
        entry: &CachedEntry,
    ) -> Result<(), StoreError> {
        self.inner.put(generation, key, entry).await
    }

    async fn put_all(
        &self,
        generation: &str,
        entries: &[(CacheKey, CachedEntry)],
    ) -> Result<(), StoreError> {
        if self.fail_put_all.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk full".to_string()));
        }
        self.inner.put_all(generation, entries).await
    }

    async fn keys(&self, generation: &str) -> Result<Vec<CacheKey>, StoreError> {
        self.inner.keys(generation).await
    }
}

/// Delivery endpoint that records batches and can be told to reject them.
pub struct RecordingDelivery {
    accept: AtomicBool,
    batches: Mutex<Vec<Vec<DeferredRecord>>>,
    gate: watch::Sender<bool>,
}

impl RecordingDelivery {
    pub fn new(accept: bool) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            accept: AtomicBool::new(accept),
            batches: Mutex::new(Vec::new()),
            gate,
        }
    }

    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn batches(&self) -> Vec<Vec<DeferredRecord>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryEndpoint for RecordingDelivery {
    async fn deliver(&self, batch: &[DeferredRecord]) -> Result<(), DeliveryError> {
        self.batches.lock().unwrap().push(batch.to_vec());

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        if self.accept.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeliveryError::from_status(503, "unavailable"))
        }
    }
}
