//! The assembled proxy.
//!
//! `Proxy` wires a [`ProxyConfig`] to a storage backend and a fetcher and owns
//! the shared state every component works through: the strategy engine, the
//! lifecycle manager, the control channel and the deferred queue.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::classify::Classifier;
use crate::config::ProxyConfig;
use crate::control::{ControlChannel, ControlHandle};
use crate::error::{ConfigError, DeliveryError, FetchError, InstallError, StoreError};
use crate::fetch::Fetcher;
use crate::http::{CacheKey, Request};
use crate::lifecycle::{ActivationReport, LifecycleManager};
use crate::state::ProxyState;
use crate::store::{CacheStorage, CacheStore};
use crate::strategy::{CacheResult, StrategyEngine};
use crate::sync::{DeferredQueue, DeferredRecord, DeliveryEndpoint, HttpDelivery, SyncOutcome};
use crate::tasks::BackgroundTasks;

/// Buffer for pending sync signals
const SYNC_SIGNAL_BUFFER: usize = 4;

pub struct Proxy {
    config: ProxyConfig,
    state: Arc<ProxyState>,
    engine: StrategyEngine,
    lifecycle: LifecycleManager,
    control: ControlHandle,
    queue: Arc<DeferredQueue>,
    delivery: Option<Arc<dyn DeliveryEndpoint>>,
}

impl Proxy {
    /// Assemble a proxy for `config.version`. Spawns the control loop, so it
    /// must be called from within a tokio runtime. Nothing is current until
    /// `config.version` activates; see [`Proxy::open`] to pick up an earlier
    /// installation.
    pub fn new(
        config: ProxyConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        queue: DeferredQueue,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let tasks = BackgroundTasks::new(config.max_background_tasks);
        let state = Arc::new(ProxyState::new(config.version.clone(), tasks));
        let engine = StrategyEngine::new(
            CacheStore::tracking(storage.clone(), &state),
            fetcher.clone(),
            Classifier::new(config.routes.clone()),
            config.timeouts,
            state.clone(),
            CacheKey::get(&config.offline_fallback_url()?),
        );
        let lifecycle = LifecycleManager::new(
            state.clone(),
            storage,
            fetcher,
            config.critical_urls()?,
            config.secondary_urls()?,
            config.install_deadline(),
        );
        let control = ControlChannel::new(state.clone(), engine.clone()).spawn(config.origin_url()?);

        let delivery = match config.sync_endpoint_url()? {
            Some(endpoint) => {
                let http = HttpDelivery::new(endpoint)
                    .map_err(|e| ConfigError::Invalid(format!("sync endpoint: {}", e)))?;
                Some(Arc::new(http) as Arc<dyn DeliveryEndpoint>)
            }
            None => None,
        };

        Ok(Self {
            config,
            state,
            engine,
            lifecycle,
            control,
            queue: Arc::new(queue),
            delivery,
        })
    }

    /// Like [`Proxy::new`], then restore whichever generation was left current
    /// in `storage`.
    pub async fn open(
        config: ProxyConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        queue: DeferredQueue,
    ) -> Result<Self, ConfigError> {
        let proxy = Self::new(config, storage, fetcher, queue)?;
        proxy.lifecycle.restore().await;
        Ok(proxy)
    }

    /// Replace the configured delivery endpoint.
    pub fn with_delivery(mut self, endpoint: Arc<dyn DeliveryEndpoint>) -> Self {
        self.delivery = Some(endpoint);
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    pub fn engine(&self) -> &StrategyEngine {
        &self.engine
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    pub fn queue(&self) -> &Arc<DeferredQueue> {
        &self.queue
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        self.state.tasks()
    }

    /// Serve an intercepted request. GET requests always produce a response;
    /// anything else goes straight to the network.
    pub async fn handle(&self, request: &Request) -> Result<CacheResult, FetchError> {
        if !request.is_get() {
            debug!(method = %request.method, url = %request.url, "Passing through");
            let response = self.engine.fetcher().fetch(request).await?;
            return Ok(CacheResult::from_network(response));
        }
        Ok(self.engine.handle(request).await)
    }

    /// Resolve `resource` against the origin and serve it as a GET.
    pub async fn get(&self, resource: &str, navigate: bool) -> Result<CacheResult, ConfigError> {
        let url = self.resolve(resource)?;
        let request = if navigate {
            Request::navigate(url)
        } else {
            Request::get(url)
        };
        Ok(self.engine.handle(&request).await)
    }

    pub fn resolve(&self, resource: &str) -> Result<Url, ConfigError> {
        self.config.resolve(resource)
    }

    /// Install, wait and activate this generation.
    pub async fn run_lifecycle(&self) -> Result<ActivationReport, InstallError> {
        self.lifecycle.run().await
    }

    pub async fn enqueue(&self, payload: Value) -> Result<DeferredRecord, StoreError> {
        self.queue.enqueue(payload).await
    }

    /// Flush the deferred queue once.
    pub async fn sync(&self) -> Result<SyncOutcome, DeliveryError> {
        let endpoint = self.delivery.as_ref().ok_or(DeliveryError::NotConfigured)?;
        Ok(self.queue.flush(endpoint.as_ref()).await)
    }

    /// Start a listener that flushes whenever a signal is sent. Dropping the
    /// returned sender stops it.
    pub fn sync_trigger(&self) -> Result<mpsc::Sender<()>, DeliveryError> {
        let endpoint = self.delivery.clone().ok_or(DeliveryError::NotConfigured)?;
        let (tx, rx) = mpsc::channel(SYNC_SIGNAL_BUFFER);
        self.queue.clone().listen(endpoint, rx);
        Ok(tx)
    }
}
