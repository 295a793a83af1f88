//! Lessoncache core - an offline caching proxy for a learning app.
//!
//! Requests for the app's assets, lesson content and API are intercepted and
//! served according to their resource class, so the app keeps working when
//! the network does not. The crate provides:
//!
//! - `classify` / `strategy`: resource classes and the caching strategies
//! - `store`: generational cache storage (in-memory and file-backed)
//! - `lifecycle`: install, wait, activate and serve
//! - `control`: administrative request/reply channel for the host
//! - `sync`: durable queue of records delivered once back online
//!
//! [`Proxy`] assembles all of the above from a [`ProxyConfig`].

pub mod classify;
pub mod config;
pub mod control;
pub mod error;
pub mod fetch;
pub mod http;
pub mod lifecycle;
pub mod proxy;
pub mod state;
pub mod store;
pub mod strategy;
pub mod sync;
pub mod tasks;

#[cfg(test)]
mod testing;

pub use classify::{Classifier, ResourceClass, RoutePatterns};
pub use config::ProxyConfig;
pub use control::{ControlChannel, ControlHandle, ControlMessage, ControlReply, WireMessage};
pub use error::{ConfigError, ControlError, DeliveryError, FetchError, InstallError, StoreError};
pub use fetch::{Fetcher, HttpFetcher};
pub use http::{CacheKey, Request, RequestMode, Response};
pub use lifecycle::{ActivationReport, LifecycleManager};
pub use proxy::Proxy;
pub use state::{Clients, LifecycleEvent, Phase, ProxyState};
pub use store::{CacheStorage, CacheStore, CachedEntry, FileStorage, MemoryStorage};
pub use strategy::{CacheResult, ResponseSource, Strategy, StrategyEngine, StrategyTimeouts};
pub use sync::{DeferredQueue, DeferredRecord, DeliveryEndpoint, HttpDelivery, SyncOutcome};
pub use tasks::{BackgroundTasks, TaskStats};
