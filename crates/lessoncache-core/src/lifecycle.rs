//! Install / activate state machine.
//!
//! ```text
//! Installing -> Waiting -> Activating -> Serving
//! ```
//!
//! Installing pre-warms the critical resource set (fatal on failure) and the
//! secondary set (best-effort). Waiting lasts until no session is controlled
//! by an older generation, or until skip-waiting is requested. Activating
//! makes the generation current, deletes every other generation, claims all
//! sessions and announces the new version. Until then the previously current
//! generation keeps serving.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, try_join_all};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::InstallError;
use crate::fetch::{fetch_with_timeout, Fetcher};
use crate::http::{CacheKey, Request};
use crate::state::{LifecycleEvent, Phase, ProxyState};
use crate::store::{CacheStorage, CachedEntry};

/// What activation did. Failed deletions are retried on the next activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
    pub claimed: usize,
}

pub struct LifecycleManager {
    state: Arc<ProxyState>,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    critical: Vec<Url>,
    secondary: Vec<Url>,
    deadline: Duration,
}

impl LifecycleManager {
    pub fn new(
        state: Arc<ProxyState>,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        critical: Vec<Url>,
        secondary: Vec<Url>,
        deadline: Duration,
    ) -> Self {
        Self {
            state,
            storage,
            fetcher,
            critical,
            secondary,
            deadline,
        }
    }

    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    /// Adopt the generation left current by an earlier run. Only an
    /// unambiguous leftover is adopted: exactly one generation in storage.
    pub async fn restore(&self) -> Option<String> {
        let generations = match self.storage.generations().await {
            Ok(generations) => generations,
            Err(e) => {
                warn!(error = %e, "Failed to list generations, starting with none current");
                return None;
            }
        };

        let current = match generations.as_slice() {
            [] => None,
            [only] => Some(only.clone()),
            _ => {
                warn!(
                    generations = ?generations,
                    "Several generations present, none adopted as current"
                );
                None
            }
        };
        if let Some(generation) = &current {
            info!(generation = %generation, "Restored current generation");
        }
        self.state.set_current(current.clone());
        current
    }

    /// Install, wait for the old generation to let go, then activate.
    pub async fn run(&self) -> Result<ActivationReport, InstallError> {
        self.install().await?;
        self.wait_for_activation().await;
        self.activate().await
    }

    /// Pre-warm this generation. On error the generation is not usable and
    /// the phase stays `Installing` so the host can retry.
    pub async fn install(&self) -> Result<(), InstallError> {
        let generation = self.state.generation().to_string();
        self.state.set_phase(Phase::Installing);
        info!(generation = %generation, critical = self.critical.len(), "Installing");

        let existed = self
            .storage
            .generations()
            .await?
            .iter()
            .any(|g| *g == generation);
        self.storage.open(&generation).await?;

        if let Err(e) = self.write_critical(&generation).await {
            warn!(generation = %generation, error = %e, "Critical pre-warm failed");
            if !existed {
                if let Err(cleanup) = self.storage.delete_generation(&generation).await {
                    warn!(generation = %generation, error = %cleanup, "Failed to discard partial generation");
                }
            }
            return Err(e);
        }

        self.write_secondary(&generation).await;

        self.state.set_phase(Phase::Waiting);
        self.state.notify(LifecycleEvent::Installed {
            version: generation.clone(),
        });
        info!(generation = %generation, "Installed");
        Ok(())
    }

    async fn write_critical(&self, generation: &str) -> Result<(), InstallError> {
        let fetches = self.critical.iter().map(|url| async move {
            let request = Request::get(url.clone());
            let response = fetch_with_timeout(self.fetcher.as_ref(), &request, self.deadline)
                .await
                .map_err(|source| InstallError::Fetch {
                    url: url.to_string(),
                    source,
                })?;
            if !response.is_success() {
                return Err(InstallError::Status {
                    url: url.to_string(),
                    status: response.status,
                });
            }
            Ok((CacheKey::get(url), CachedEntry::new(response)))
        });

        let entries = try_join_all(fetches).await?;
        self.storage.put_all(generation, &entries).await?;
        Ok(())
    }

    async fn write_secondary(&self, generation: &str) {
        let fetches = self.secondary.iter().map(|url| async move {
            let request = Request::get(url.clone());
            match fetch_with_timeout(self.fetcher.as_ref(), &request, self.deadline).await {
                Ok(response) if response.is_success() => {
                    let entry = CachedEntry::new(response);
                    if let Err(e) = self.storage.put(generation, &CacheKey::get(url), &entry).await {
                        warn!(url = %url, error = %e, "Failed to cache secondary resource");
                    }
                }
                Ok(response) => {
                    debug!(url = %url, status = response.status, "Skipping secondary resource");
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "Failed to fetch secondary resource");
                }
            }
        });
        join_all(fetches).await;
    }

    /// Resolve when activation may proceed.
    pub async fn wait_for_activation(&self) {
        let generation = self.state.generation();
        let held = self.state.clients().controlled_by_others(generation);
        if held == 0 {
            return;
        }

        info!(generation = %generation, sessions = held, "Waiting for older sessions to close");
        tokio::select! {
            _ = self.state.skip_waiting_requested() => {
                info!(generation = %generation, "Skip-waiting requested");
            }
            _ = self.state.clients().wait_until_released(generation) => {
                debug!(generation = %generation, "Older sessions closed");
            }
        }
    }

    /// Delete every other generation, claim all sessions, announce, serve.
    pub async fn activate(&self) -> Result<ActivationReport, InstallError> {
        let generation = self.state.generation().to_string();
        if self.state.phase() != Phase::Waiting {
            return Err(InstallError::NotInstalled(generation));
        }
        self.state.set_phase(Phase::Activating);
        self.state.set_current(Some(generation.clone()));
        info!(generation = %generation, "Activating");

        let mut report = self.remove_stale_generations(&generation).await;

        report.claimed = self.state.clients().claim(&generation);
        self.state.notify(LifecycleEvent::Activated {
            version: generation.clone(),
        });
        self.state.set_phase(Phase::Serving);
        info!(
            generation = %generation,
            deleted = report.deleted.len(),
            claimed = report.claimed,
            "Serving"
        );
        Ok(report)
    }

    async fn remove_stale_generations(&self, current: &str) -> ActivationReport {
        let mut report = ActivationReport::default();
        let stale: Vec<String> = match self.storage.generations().await {
            Ok(generations) => generations.into_iter().filter(|g| g != current).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list generations, cleanup deferred");
                return report;
            }
        };

        let deletions = stale.iter().map(|generation| async move {
            (generation, self.storage.delete_generation(generation).await)
        });
        for (generation, result) in join_all(deletions).await {
            match result {
                Ok(_) => report.deleted.push(generation.clone()),
                Err(e) => {
                    warn!(generation = %generation, error = %e, "Failed to delete stale generation");
                    report.failed.push(generation.clone());
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Response;
    use crate::store::MemoryStorage;
    use crate::tasks::BackgroundTasks;
    use crate::testing::{FlakyStorage, MockFetcher};

    const ORIGIN: &str = "https://learn.example";
    const CRITICAL: [&str; 5] = ["/", "/offline.html", "/app.js", "/style.css", "/pkg/engine.wasm"];

    fn url(path: &str) -> Url {
        Url::parse(&format!("{}{}", ORIGIN, path)).unwrap()
    }

    fn online_fetcher() -> Arc<MockFetcher> {
        let fetcher = MockFetcher::new();
        for path in CRITICAL {
            fetcher.respond(&url(path).to_string(), Response::new(200, path));
        }
        fetcher.respond(&url("/lessons/1").to_string(), Response::new(200, "lesson one"));
        Arc::new(fetcher)
    }

    fn manager(
        generation: &str,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<MockFetcher>,
        secondary: &[&str],
    ) -> LifecycleManager {
        LifecycleManager::new(
            Arc::new(ProxyState::new(generation, BackgroundTasks::default())),
            storage,
            fetcher,
            CRITICAL.iter().map(|p| url(p)).collect(),
            secondary.iter().map(|p| url(p)).collect(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_install_writes_critical_set() {
        let storage = Arc::new(MemoryStorage::new());
        let lifecycle = manager("v1", storage.clone(), online_fetcher(), &[]);

        lifecycle.install().await.unwrap();

        assert_eq!(lifecycle.state().phase(), Phase::Waiting);
        assert_eq!(storage.keys("v1").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_install_fails_on_critical_error() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = online_fetcher();
        fetcher.respond(&url("/style.css").to_string(), Response::new(500, "oops"));
        let lifecycle = manager("v2", storage.clone(), fetcher, &[]);

        let err = lifecycle.install().await.unwrap_err();
        assert!(matches!(err, InstallError::Status { status: 500, .. }));
        assert_eq!(lifecycle.state().phase(), Phase::Installing);
        assert!(storage.generations().await.unwrap().is_empty());

        assert!(matches!(
            lifecycle.activate().await,
            Err(InstallError::NotInstalled(_))
        ));
    }

    #[tokio::test]
    async fn test_install_fails_offline() {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = online_fetcher();
        fetcher.set_offline(true);
        let lifecycle = manager("v1", storage.clone(), fetcher, &[]);

        assert!(matches!(
            lifecycle.install().await,
            Err(InstallError::Fetch { .. })
        ));
    }

    #[tokio::test]
    async fn test_install_fails_when_critical_write_fails() {
        let storage = Arc::new(FlakyStorage::new());
        storage.fail_put_all(true);
        let fetcher = online_fetcher();
        let lifecycle = manager("v1", storage.clone(), fetcher.clone(), &[]);

        let err = lifecycle.install().await.unwrap_err();
        assert!(matches!(err, InstallError::Store(_)));
        assert_eq!(fetcher.total_calls(), CRITICAL.len());
        assert_eq!(lifecycle.state().phase(), Phase::Installing);
        assert_eq!(lifecycle.state().current_generation(), None);
        assert!(storage.generations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_install_keeps_previous_generation_current() {
        let storage = Arc::new(MemoryStorage::new());
        manager("v1", storage.clone(), online_fetcher(), &[])
            .run()
            .await
            .unwrap();

        let fetcher = online_fetcher();
        fetcher.set_offline(true);
        let lifecycle = manager("v2", storage.clone(), fetcher, &[]);
        assert_eq!(lifecycle.restore().await.as_deref(), Some("v1"));

        assert!(lifecycle.run().await.is_err());
        assert_eq!(lifecycle.state().current_generation().as_deref(), Some("v1"));
        assert_eq!(lifecycle.state().version().as_deref(), Some("v1"));
        assert_eq!(storage.generations().await.unwrap(), vec!["v1"]);
    }

    #[tokio::test]
    async fn test_restore_only_adopts_a_single_generation() {
        let storage = Arc::new(MemoryStorage::new());
        let lifecycle = manager("v3", storage.clone(), online_fetcher(), &[]);
        assert_eq!(lifecycle.restore().await, None);

        storage.open("v1").await.unwrap();
        assert_eq!(lifecycle.restore().await.as_deref(), Some("v1"));

        storage.open("v2").await.unwrap();
        assert_eq!(lifecycle.restore().await, None);
        assert_eq!(lifecycle.state().current_generation(), None);
    }

    #[tokio::test]
    async fn test_cleanup_failure_is_retried_on_next_activation() {
        let storage = Arc::new(FlakyStorage::new());
        storage.open("v1").await.unwrap();
        storage.fail_delete_of(Some("v1"));

        let lifecycle = manager("v2", storage.clone(), online_fetcher(), &[]);
        let report = lifecycle.run().await.unwrap();
        assert_eq!(report.failed, vec!["v1".to_string()]);
        assert!(report.deleted.is_empty());
        assert_eq!(lifecycle.state().phase(), Phase::Serving);
        assert_eq!(lifecycle.state().current_generation().as_deref(), Some("v2"));
        assert_eq!(storage.generations().await.unwrap(), vec!["v1", "v2"]);

        storage.fail_delete_of(None);
        let next = manager("v2", storage.clone(), online_fetcher(), &[]);
        let report = next.run().await.unwrap();
        assert_eq!(report.deleted, vec!["v1".to_string()]);
        assert!(report.failed.is_empty());
        assert_eq!(storage.generations().await.unwrap(), vec!["v2"]);
    }

    #[tokio::test]
    async fn test_secondary_failures_do_not_block() {
        let storage = Arc::new(MemoryStorage::new());
        let lifecycle = manager(
            "v1",
            storage.clone(),
            online_fetcher(),
            &["/lessons/1", "/lessons/unknown"],
        );

        lifecycle.install().await.unwrap();

        let keys = storage.keys("v1").await.unwrap();
        assert_eq!(keys.len(), 6);
        assert!(keys.contains(&CacheKey::get(&url("/lessons/1"))));
    }

    #[tokio::test]
    async fn test_activation_leaves_only_current_generation() {
        let storage = Arc::new(MemoryStorage::new());
        storage.open("v1").await.unwrap();
        storage.open("v2").await.unwrap();
        let lifecycle = manager("v3", storage.clone(), online_fetcher(), &[]);
        let mut events = lifecycle.state().subscribe();

        let report = lifecycle.run().await.unwrap();

        assert_eq!(storage.generations().await.unwrap(), vec!["v3"]);
        assert_eq!(report.deleted.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(lifecycle.state().phase(), Phase::Serving);
        assert_eq!(lifecycle.state().current_generation().as_deref(), Some("v3"));
        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::Installed {
                version: "v3".to_string()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::Activated {
                version: "v3".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_waits_for_old_sessions_until_skip() {
        let storage = Arc::new(MemoryStorage::new());
        let lifecycle = Arc::new(manager("v2", storage, online_fetcher(), &[]));
        let session = lifecycle.state().clients().open(Some("v1"));

        let runner = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.run().await })
        };

        lifecycle.state().wait_for_phase(Phase::Waiting).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lifecycle.state().phase(), Phase::Waiting);

        lifecycle.state().skip_waiting();
        let report = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(report.claimed, 1);
        assert_eq!(
            lifecycle.state().clients().controller(session).as_deref(),
            Some("v2")
        );
    }

    #[tokio::test]
    async fn test_activates_when_old_sessions_close() {
        let storage = Arc::new(MemoryStorage::new());
        let lifecycle = Arc::new(manager("v2", storage, online_fetcher(), &[]));
        let session = lifecycle.state().clients().open(Some("v1"));

        let runner = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.run().await })
        };
        lifecycle.state().wait_for_phase(Phase::Waiting).await;

        lifecycle.state().clients().close(session);
        tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(lifecycle.state().phase(), Phase::Serving);
    }
}
