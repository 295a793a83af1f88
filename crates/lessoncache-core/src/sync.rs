//! Deferred delivery queue.
//!
//! Records produced while offline (progress events and the like) are kept in
//! a durable local queue and delivered in one batch when a sync is requested.
//!
//! ```text
//! Pending -> Sending -> Delivered (batch removed) | Pending (batch kept)
//! ```
//!
//! The batch is the snapshot taken on entering Sending. Records enqueued
//! during a send wait for the next trigger.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{DeliveryError, StoreError};

/// Timeout for a batch delivery, in seconds.
const DELIVERY_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct DeferredRecord {
    pub id: u64,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Pending,
    Sending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Nothing was queued
    Empty,
    Delivered { count: usize },
    /// Batch kept for the next trigger
    Failed { retained: usize, error: String },
    /// Another flush is already sending
    InProgress,
}

/// Remote endpoint accepting batches of records.
#[async_trait]
pub trait DeliveryEndpoint: Send + Sync {
    async fn deliver(&self, batch: &[DeferredRecord]) -> Result<(), DeliveryError>;
}

/// POSTs the batch's payloads as a JSON array. Any non-2xx is a failure.
#[derive(Clone)]
pub struct HttpDelivery {
    client: Client,
    endpoint: Url,
}

impl HttpDelivery {
    pub fn new(endpoint: Url) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DELIVERY_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl DeliveryEndpoint for HttpDelivery {
    async fn deliver(&self, batch: &[DeferredRecord]) -> Result<(), DeliveryError> {
        let payloads: Vec<&Value> = batch.iter().map(|record| &record.payload).collect();
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&payloads)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(DeliveryError::from_status(status, &body))
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    next_id: u64,
    records: Vec<DeferredRecord>,
}

/// Resets the Sending flag even if a flush is cancelled mid-delivery.
struct SendingGuard<'a>(&'a AtomicBool);

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DeferredQueue {
    path: Option<PathBuf>,
    contents: Mutex<QueueFile>,
    sending: AtomicBool,
}

impl DeferredQueue {
    /// Queue that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            contents: Mutex::new(QueueFile::default()),
            sending: AtomicBool::new(false),
        }
    }

    /// Load the queue persisted at `path`, or start empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let contents = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => QueueFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            contents: Mutex::new(contents),
            sending: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn state(&self) -> QueueState {
        if self.sending.load(Ordering::Acquire) {
            QueueState::Sending
        } else {
            QueueState::Pending
        }
    }

    pub async fn len(&self) -> usize {
        self.contents.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn records(&self) -> Vec<DeferredRecord> {
        self.contents.lock().await.records.clone()
    }

    /// Queue a record. Works online or offline; nothing is sent until a flush.
    pub async fn enqueue(&self, payload: Value) -> Result<DeferredRecord, StoreError> {
        let mut contents = self.contents.lock().await;
        let record = DeferredRecord {
            id: contents.next_id,
            payload,
            enqueued_at: Utc::now(),
        };
        contents.next_id += 1;
        contents.records.push(record.clone());

        if let Err(e) = self.persist(&contents).await {
            // Keep memory and disk in agreement
            contents.records.pop();
            contents.next_id -= 1;
            return Err(e);
        }
        debug!(id = record.id, pending = contents.records.len(), "Queued deferred record");
        Ok(record)
    }

    /// Deliver everything pending as one batch. Safe to call repeatedly.
    pub async fn flush(&self, endpoint: &dyn DeliveryEndpoint) -> SyncOutcome {
        if self
            .sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Flush already in progress");
            return SyncOutcome::InProgress;
        }
        let _guard = SendingGuard(&self.sending);

        let batch = self.contents.lock().await.records.clone();
        if batch.is_empty() {
            return SyncOutcome::Empty;
        }
        // Ids are monotonic, so the snapshot is exactly the ids up to this one
        let last_id = batch[batch.len() - 1].id;

        info!(count = batch.len(), "Delivering deferred records");
        match endpoint.deliver(&batch).await {
            Ok(()) => {
                let mut contents = self.contents.lock().await;
                contents.records.retain(|record| record.id > last_id);
                if let Err(e) = self.persist(&contents).await {
                    // The batch may be delivered again after a restart
                    warn!(error = %e, "Failed to persist queue after delivery");
                }
                info!(count = batch.len(), remaining = contents.records.len(), "Delivered deferred records");
                SyncOutcome::Delivered { count: batch.len() }
            }
            Err(e) => {
                warn!(count = batch.len(), error = %e, "Deferred delivery failed, will retry");
                SyncOutcome::Failed {
                    retained: self.len().await,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Flush on every signal received until the sender side closes.
    pub fn listen(
        self: Arc<Self>,
        endpoint: Arc<dyn DeliveryEndpoint>,
        mut signals: mpsc::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while signals.recv().await.is_some() {
                let outcome = self.flush(endpoint.as_ref()).await;
                debug!(outcome = ?outcome, "Sync signal handled");
            }
        })
    }

    async fn persist(&self, contents: &QueueFile) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(contents)?;
        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, path).await?;
        Ok(())
    }
}
