//! Caching strategies.
//!
//! Each resource class is served by one strategy:
//!
//! | Class                        | Strategy                 |
//! |------------------------------|--------------------------|
//! | StaticAsset, LargeBinaryAsset| cache-first              |
//! | ContentResource              | stale-while-revalidate   |
//! | ApiCall, Default             | network-first            |
//! | Navigation                   | navigation-with-fallback |
//!
//! `StrategyEngine::handle` never fails: when a strategy runs out of options
//! the caller gets the offline document (HTML requests) or the synthetic
//! unavailable response.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classify::{Classifier, ResourceClass};
use crate::error::FetchError;
use crate::fetch::{fetch_with_timeout, Fetcher};
use crate::http::{CacheKey, Request, Response};
use crate::state::ProxyState;
use crate::store::{CacheStore, CachedEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
    NavigationWithFallback,
}

impl Strategy {
    pub fn for_class(class: ResourceClass) -> Self {
        match class {
            ResourceClass::StaticAsset | ResourceClass::LargeBinaryAsset => Strategy::CacheFirst,
            ResourceClass::ContentResource => Strategy::StaleWhileRevalidate,
            ResourceClass::ApiCall | ResourceClass::Default => Strategy::NetworkFirst,
            ResourceClass::Navigation => Strategy::NavigationWithFallback,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::CacheFirst => write!(f, "cache-first"),
            Strategy::NetworkFirst => write!(f, "network-first"),
            Strategy::StaleWhileRevalidate => write!(f, "stale-while-revalidate"),
            Strategy::NavigationWithFallback => write!(f, "navigation"),
        }
    }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// The registered offline document
    OfflineFallback,
    /// Synthetic unavailable response
    Unavailable,
}

impl std::fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseSource::Network => write!(f, "network"),
            ResponseSource::Cache => write!(f, "cache"),
            ResponseSource::OfflineFallback => write!(f, "offline-fallback"),
            ResponseSource::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// A served response with metadata about its source.
#[derive(Debug, Clone)]
pub struct CacheResult {
    pub response: Response,
    pub source: ResponseSource,
    /// When the served entry was cached (if from cache)
    pub cached_at: Option<DateTime<Utc>>,
}

impl CacheResult {
    pub fn from_network(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Network,
            cached_at: None,
        }
    }

    pub fn from_cache(entry: CachedEntry) -> Self {
        Self {
            response: entry.response,
            source: ResponseSource::Cache,
            cached_at: Some(entry.cached_at),
        }
    }

    pub fn offline_fallback(entry: CachedEntry) -> Self {
        Self {
            response: entry.response,
            source: ResponseSource::OfflineFallback,
            cached_at: Some(entry.cached_at),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            response: Response::unavailable(),
            source: ResponseSource::Unavailable,
            cached_at: None,
        }
    }
}

/// Per-strategy network deadlines, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyTimeouts {
    pub cache_first_ms: u64,
    pub network_first_ms: u64,
    pub revalidate_ms: u64,
    pub navigation_ms: u64,
}

impl Default for StrategyTimeouts {
    fn default() -> Self {
        Self {
            cache_first_ms: 30_000,
            network_first_ms: 10_000,
            revalidate_ms: 30_000,
            navigation_ms: 10_000,
        }
    }
}

impl StrategyTimeouts {
    pub fn deadline(&self, strategy: Strategy) -> Duration {
        let ms = match strategy {
            Strategy::CacheFirst => self.cache_first_ms,
            Strategy::NetworkFirst => self.network_first_ms,
            Strategy::StaleWhileRevalidate => self.revalidate_ms,
            Strategy::NavigationWithFallback => self.navigation_ms,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Error, Debug)]
pub enum StrategyError {
    #[error(transparent)]
    Network(#[from] FetchError),

    #[error("No cached response or offline document available")]
    NoFallback,
}

/// Clone is cheap; clones share the store, fetcher and state.
#[derive(Clone)]
pub struct StrategyEngine {
    store: CacheStore,
    fetcher: Arc<dyn Fetcher>,
    classifier: Arc<Classifier>,
    timeouts: StrategyTimeouts,
    state: Arc<ProxyState>,
    offline_fallback: CacheKey,
}

impl StrategyEngine {
    pub fn new(
        store: CacheStore,
        fetcher: Arc<dyn Fetcher>,
        classifier: Classifier,
        timeouts: StrategyTimeouts,
        state: Arc<ProxyState>,
        offline_fallback: CacheKey,
    ) -> Self {
        Self {
            store,
            fetcher,
            classifier: Arc::new(classifier),
            timeouts,
            state,
            offline_fallback,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Serve a GET request. Always produces a response.
    pub async fn handle(&self, request: &Request) -> CacheResult {
        let class = self.classifier.classify_request(request);
        let strategy = Strategy::for_class(class);
        debug!(url = %request.url, class = %class, strategy = %strategy, "Dispatching request");

        match self.execute(strategy, request).await {
            Ok(result) => result,
            Err(e) => {
                info!(url = %request.url, strategy = %strategy, error = %e, "Strategy exhausted");
                self.exhausted(request).await
            }
        }
    }

    pub async fn execute(
        &self,
        strategy: Strategy,
        request: &Request,
    ) -> Result<CacheResult, StrategyError> {
        match strategy {
            Strategy::CacheFirst => self.cache_first(request).await,
            Strategy::NetworkFirst => self.network_first(request).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
            Strategy::NavigationWithFallback => self.navigate(request).await,
        }
    }

    /// Serve from cache without touching the network; on a miss, fetch and
    /// cache a 2xx. Network failure propagates.
    pub async fn cache_first(&self, request: &Request) -> Result<CacheResult, StrategyError> {
        let key = CacheKey::get(&request.url);
        if let Some(entry) = self.store.lookup(&key).await {
            return Ok(CacheResult::from_cache(entry));
        }

        let response = self.fetch(Strategy::CacheFirst, request).await?;
        if response.is_success() {
            self.store.write(&key, &response).await;
        }
        Ok(CacheResult::from_network(response))
    }

    /// Prefer the network, writing 2xx responses through; fall back to the
    /// cached entry when the network fails.
    pub async fn network_first(&self, request: &Request) -> Result<CacheResult, StrategyError> {
        let key = CacheKey::get(&request.url);
        match self.fetch(Strategy::NetworkFirst, request).await {
            Ok(response) => {
                if response.is_success() {
                    self.store.write(&key, &response).await;
                }
                Ok(CacheResult::from_network(response))
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying cache");
                match self.store.lookup(&key).await {
                    Some(entry) => Ok(CacheResult::from_cache(entry)),
                    None => Err(e.into()),
                }
            }
        }
    }

    /// Serve the cached entry at once and refresh it in the background. With
    /// nothing cached, wait for the network.
    pub async fn stale_while_revalidate(
        &self,
        request: &Request,
    ) -> Result<CacheResult, StrategyError> {
        let key = CacheKey::get(&request.url);
        if let Some(entry) = self.store.lookup(&key).await {
            let engine = self.clone();
            let request = request.clone();
            let label = key.to_string();
            self.state
                .tasks()
                .spawn("revalidate", label, async move { engine.revalidate(&request, &key).await });
            return Ok(CacheResult::from_cache(entry));
        }

        let response = self.fetch(Strategy::StaleWhileRevalidate, request).await?;
        if response.is_success() {
            self.store.write(&key, &response).await;
        }
        Ok(CacheResult::from_network(response))
    }

    async fn revalidate(&self, request: &Request, key: &CacheKey) -> Result<(), StrategyError> {
        let response = self.fetch(Strategy::StaleWhileRevalidate, request).await?;
        if response.is_success() {
            self.store.write(key, &response).await;
        } else {
            debug!(key = %key, status = response.status, "Revalidation got non-success, keeping entry");
        }
        Ok(())
    }

    /// Return whatever the network answers, any status. Only a network
    /// failure falls back: first to this URL's entry, then to the offline
    /// document.
    pub async fn navigate(&self, request: &Request) -> Result<CacheResult, StrategyError> {
        match self.fetch(Strategy::NavigationWithFallback, request).await {
            Ok(response) => Ok(CacheResult::from_network(response)),
            Err(e) => {
                debug!(url = %request.url, error = %e, "Navigation failed, trying cache");
                let key = CacheKey::get(&request.url);
                if let Some(entry) = self.store.lookup(&key).await {
                    return Ok(CacheResult::from_cache(entry));
                }
                self.offline_document()
                    .await
                    .ok_or(StrategyError::NoFallback)
            }
        }
    }

    /// Fetch one URL into the cache unless it is already there.
    /// Returns whether a new entry was written.
    pub async fn prewarm(&self, request: &Request) -> Result<bool, StrategyError> {
        let key = CacheKey::get(&request.url);
        if self.store.lookup(&key).await.is_some() {
            debug!(key = %key, "Already cached, skipping prewarm");
            return Ok(false);
        }

        let response = self.fetch(Strategy::CacheFirst, request).await?;
        if !response.is_success() {
            warn!(key = %key, status = response.status, "Prewarm got non-success, not caching");
            return Ok(false);
        }
        Ok(self.store.write(&key, &response).await)
    }

    /// Last resort once every strategy option is gone.
    pub async fn exhausted(&self, request: &Request) -> CacheResult {
        if request.accepts_html() {
            if let Some(result) = self.offline_document().await {
                return result;
            }
            warn!(key = %self.offline_fallback, "Offline document missing from cache");
        }
        CacheResult::unavailable()
    }

    async fn offline_document(&self) -> Option<CacheResult> {
        self.store
            .lookup(&self.offline_fallback)
            .await
            .map(CacheResult::offline_fallback)
    }

    async fn fetch(&self, strategy: Strategy, request: &Request) -> Result<Response, FetchError> {
        fetch_with_timeout(
            self.fetcher.as_ref(),
            request,
            self.timeouts.deadline(strategy),
        )
        .await
    }
}
