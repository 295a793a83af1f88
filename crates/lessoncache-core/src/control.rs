//! Administrative request/reply protocol between the host and the proxy.
//!
//! Every message gets exactly one reply. Fire-and-forget kinds reply `Ack`
//! as soon as the work is scheduled.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ControlError;
use crate::http::Request;
use crate::state::{LifecycleEvent, ProxyState};
use crate::strategy::StrategyEngine;

/// Buffer size for pending control messages.
const CHANNEL_BUFFER_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Force Waiting -> Activating now
    SkipActivationWait,
    GetVersion,
    /// Delete every generation
    ClearCache,
    PrewarmResource { url: Url },
}

impl ControlMessage {
    /// Decode a wire message. Unknown types and malformed payloads yield
    /// `None` and are ignored by the channel.
    pub fn from_wire(wire: &WireMessage, origin: &Url) -> Option<Self> {
        match wire.kind.as_str() {
            "SkipActivationWait" => Some(ControlMessage::SkipActivationWait),
            "GetVersion" => Some(ControlMessage::GetVersion),
            "ClearCache" => Some(ControlMessage::ClearCache),
            "PrewarmResource" => {
                let url = wire.payload.as_ref()?.get("url")?.as_str()?;
                match origin.join(url) {
                    Ok(url) => Some(ControlMessage::PrewarmResource { url }),
                    Err(e) => {
                        debug!(url = url, error = %e, "Ignoring prewarm with invalid url");
                        None
                    }
                }
            }
            other => {
                debug!(kind = other, "Ignoring unknown control message");
                None
            }
        }
    }
}

/// Control message as sent by the host: `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "ts", ts(optional))]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(untagged)]
pub enum ControlReply {
    Ack,
    /// `None` before any generation has been installed
    Version {
        version: Option<String>,
    },
    Cleared {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

struct Envelope {
    message: ControlMessage,
    reply: oneshot::Sender<ControlReply>,
}

/// Handles control messages against the shared state and strategy engine.
#[derive(Clone)]
pub struct ControlChannel {
    state: Arc<ProxyState>,
    engine: StrategyEngine,
}

impl ControlChannel {
    pub fn new(state: Arc<ProxyState>, engine: StrategyEngine) -> Self {
        Self { state, engine }
    }

    /// Answer one message.
    pub async fn handle(&self, message: ControlMessage) -> ControlReply {
        match message {
            ControlMessage::SkipActivationWait => {
                info!("Skip-waiting requested over control channel");
                self.state.skip_waiting();
                ControlReply::Ack
            }
            ControlMessage::GetVersion => ControlReply::Version {
                version: self.state.version(),
            },
            ControlMessage::ClearCache => self.clear_cache().await,
            ControlMessage::PrewarmResource { url } => {
                let engine = self.engine.clone();
                let label = url.to_string();
                self.state.tasks().spawn("prewarm", label, async move {
                    engine.prewarm(&Request::get(url)).await.map(|_| ())
                });
                ControlReply::Ack
            }
        }
    }

    async fn clear_cache(&self) -> ControlReply {
        let storage = self.engine.store().storage();
        let generations = match storage.generations().await {
            Ok(generations) => generations,
            Err(e) => {
                warn!(error = %e, "Failed to list generations for clear");
                return ControlReply::Cleared {
                    success: false,
                    error: Some(e.to_string()),
                };
            }
        };

        for generation in &generations {
            if let Err(e) = storage.delete_generation(generation).await {
                warn!(generation = %generation, error = %e, "Failed to clear generation");
                return ControlReply::Cleared {
                    success: false,
                    error: Some(format!("{}: {}", generation, e)),
                };
            }
        }

        // Nothing is left to serve from; writes must not resurrect a generation
        self.state.set_current(None);
        info!(count = generations.len(), "Cleared all generations");
        ControlReply::Cleared {
            success: true,
            error: None,
        }
    }

    /// Run a dispatch loop. Messages are handled concurrently; the loop ends
    /// when every handle is dropped.
    pub fn spawn(self, origin: Url) -> ControlHandle {
        let (tx, mut rx) = mpsc::channel::<Envelope>(CHANNEL_BUFFER_SIZE);
        let state = self.state.clone();

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let channel = self.clone();
                tokio::spawn(async move {
                    let reply = channel.handle(envelope.message).await;
                    if envelope.reply.send(reply).is_err() {
                        debug!("Control reply dropped, caller went away");
                    }
                });
            }
            debug!("Control channel closed");
        });

        ControlHandle { tx, origin, state }
    }
}

/// Host-side handle to a running control channel. Clone is cheap.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<Envelope>,
    origin: Url,
    state: Arc<ProxyState>,
}

impl ControlHandle {
    pub async fn request(&self, message: ControlMessage) -> Result<ControlReply, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope { message, reply })
            .await
            .map_err(|_| ControlError::ChannelClosed)?;
        rx.await.map_err(|_| ControlError::ChannelClosed)
    }

    /// Send a wire message. `Ok(None)` means it was ignored.
    pub async fn post(&self, wire: &WireMessage) -> Result<Option<ControlReply>, ControlError> {
        match ControlMessage::from_wire(wire, &self.origin) {
            Some(message) => self.request(message).await.map(Some),
            None => Ok(None),
        }
    }

    /// Send a raw JSON wire message. Unparseable input is ignored.
    pub async fn post_json(&self, json: &str) -> Result<Option<ControlReply>, ControlError> {
        match serde_json::from_str::<WireMessage>(json) {
            Ok(wire) => self.post(&wire).await,
            Err(e) => {
                debug!(error = %e, "Ignoring malformed control message");
                Ok(None)
            }
        }
    }

    /// Activation notices.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.state.subscribe()
    }
}
