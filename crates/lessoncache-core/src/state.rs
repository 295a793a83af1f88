//! Shared proxy state.
//!
//! One `ProxyState` exists per proxy instance. The lifecycle manager owns the
//! transitions; the strategy engine and control channel hold an `Arc` to read
//! the generation, reach the task set and request skip-waiting.
//!
//! `generation` is the id this proxy installs. The *current* generation is the
//! one requests are served from; it only moves to `generation` on activation,
//! so a failed install leaves the previous one in place.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{broadcast, watch, Notify};

use crate::tasks::BackgroundTasks;

/// Buffer for lifecycle event subscribers that fall behind.
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Installing,
    Waiting,
    Activating,
    Serving,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Installing => write!(f, "installing"),
            Phase::Waiting => write!(f, "waiting"),
            Phase::Activating => write!(f, "activating"),
            Phase::Serving => write!(f, "serving"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Installed { version: String },
    Activated { version: String },
}

pub type ClientId = u64;

/// Open host sessions and the generation controlling each.
pub struct Clients {
    next_id: AtomicU64,
    sessions: watch::Sender<BTreeMap<ClientId, Option<String>>>,
}

impl Clients {
    pub fn new() -> Self {
        let (sessions, _) = watch::channel(BTreeMap::new());
        Self {
            next_id: AtomicU64::new(1),
            sessions,
        }
    }

    /// Register a session, optionally already controlled by a generation.
    pub fn open(&self, controller: Option<&str>) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let controller = controller.map(String::from);
        self.sessions.send_modify(|sessions| {
            sessions.insert(id, controller);
        });
        id
    }

    pub fn close(&self, id: ClientId) {
        self.sessions.send_if_modified(|sessions| sessions.remove(&id).is_some());
    }

    pub fn controller(&self, id: ClientId) -> Option<String> {
        self.sessions.borrow().get(&id).cloned().flatten()
    }

    pub fn len(&self) -> usize {
        self.sessions.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sessions controlled by a generation other than `generation`.
    pub fn controlled_by_others(&self, generation: &str) -> usize {
        self.sessions
            .borrow()
            .values()
            .filter(|controller| controller.as_deref().is_some_and(|c| c != generation))
            .count()
    }

    /// Make `generation` the controller of every open session.
    pub fn claim(&self, generation: &str) -> usize {
        let mut claimed = 0;
        self.sessions.send_modify(|sessions| {
            for controller in sessions.values_mut() {
                if controller.as_deref() != Some(generation) {
                    *controller = Some(generation.to_string());
                    claimed += 1;
                }
            }
        });
        claimed
    }

    /// Resolve once no session is controlled by another generation.
    pub async fn wait_until_released(&self, generation: &str) {
        let mut rx = self.sessions.subscribe();
        let _ = rx
            .wait_for(|sessions| {
                sessions
                    .values()
                    .all(|controller| controller.as_deref().map_or(true, |c| c == generation))
            })
            .await;
    }
}

impl Default for Clients {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProxyState {
    generation: String,
    current: watch::Sender<Option<String>>,
    phase: watch::Sender<Phase>,
    skip_waiting: Notify,
    events: broadcast::Sender<LifecycleEvent>,
    clients: Clients,
    tasks: BackgroundTasks,
}

impl ProxyState {
    pub fn new(generation: impl Into<String>, tasks: BackgroundTasks) -> Self {
        let (phase, _) = watch::channel(Phase::Installing);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (current, _) = watch::channel(None);
        Self {
            generation: generation.into(),
            current,
            phase,
            skip_waiting: Notify::new(),
            events,
            clients: Clients::new(),
            tasks,
        }
    }

    /// This proxy's generation id.
    pub fn generation(&self) -> &str {
        &self.generation
    }

    /// Generation requests are served from, if any.
    pub fn current_generation(&self) -> Option<String> {
        self.current.borrow().clone()
    }

    pub fn watch_current(&self) -> watch::Receiver<Option<String>> {
        self.current.subscribe()
    }

    pub(crate) fn set_current(&self, generation: Option<String>) {
        self.current.send_replace(generation);
    }

    /// Version reported to the host: this proxy's generation once installed,
    /// otherwise whichever generation is still current.
    pub fn version(&self) -> Option<String> {
        match self.phase() {
            Phase::Installing => self.current_generation(),
            _ => Some(self.generation.clone()),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.send_replace(phase);
    }

    pub async fn wait_for_phase(&self, phase: Phase) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|current| *current == phase).await;
    }

    /// Request an immediate Waiting -> Activating transition. A request made
    /// before Waiting is remembered.
    pub fn skip_waiting(&self) {
        self.skip_waiting.notify_one();
    }

    pub(crate) async fn skip_waiting_requested(&self) {
        self.skip_waiting.notified().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub(crate) fn notify(&self, event: LifecycleEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn clients(&self) -> &Clients {
        &self.clients
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_clients_claim() {
        let clients = Clients::new();
        let a = clients.open(Some("v1"));
        let b = clients.open(None);
        assert_eq!(clients.controlled_by_others("v2"), 1);

        assert_eq!(clients.claim("v2"), 2);
        assert_eq!(clients.controller(a).as_deref(), Some("v2"));
        assert_eq!(clients.controller(b).as_deref(), Some("v2"));
        assert_eq!(clients.controlled_by_others("v2"), 0);
    }

    #[tokio::test]
    async fn test_wait_until_released() {
        let clients = std::sync::Arc::new(Clients::new());
        let old = clients.open(Some("v1"));

        let waiter = {
            let clients = clients.clone();
            tokio::spawn(async move { clients.wait_until_released("v2").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        clients.close(old);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_skip_waiting_is_remembered() {
        let state = ProxyState::new("v1", BackgroundTasks::default());
        state.skip_waiting();
        tokio::time::timeout(Duration::from_secs(1), state.skip_waiting_requested())
            .await
            .unwrap();
    }

    #[test]
    fn test_version_follows_install_progress() {
        let state = ProxyState::new("v2", BackgroundTasks::default());
        assert_eq!(state.version(), None);

        state.set_current(Some("v1".to_string()));
        assert_eq!(state.version().as_deref(), Some("v1"));

        state.set_phase(Phase::Waiting);
        assert_eq!(state.version().as_deref(), Some("v2"));
        assert_eq!(state.current_generation().as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_phase_and_events() {
        let state = ProxyState::new("v3", BackgroundTasks::default());
        assert_eq!(state.phase(), Phase::Installing);

        let mut events = state.subscribe();
        state.set_phase(Phase::Serving);
        state.notify(LifecycleEvent::Activated {
            version: "v3".to_string(),
        });

        state.wait_for_phase(Phase::Serving).await;
        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::Activated {
                version: "v3".to_string()
            }
        );
    }
}
