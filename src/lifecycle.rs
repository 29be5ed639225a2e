//! Generation lifecycle: seeding, activation and client handoff
//!
//! A generation moves through `Installing → Waiting → Active → Superseded`.
//! A generation whose install fails becomes `Redundant` and is never promoted.

use crate::cache_store::CacheStore;
use crate::config::OfflineConfig;
use crate::error::{OfflineError, Result};
use crate::fetcher::Fetcher;
use crate::metrics::OfflineMetrics;
use crate::models::{cache_key_for, InterceptedRequest, ResponseSnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Maximum number of concurrent fetches while seeding
const SEED_CONCURRENCY: usize = 4;

/// Lifecycle state of a cache generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Installing,
    Waiting,
    Active,
    Superseded,
    Redundant,
}

impl LifecycleState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Installing, Waiting) | (Installing, Redundant) | (Waiting, Active) | (Active, Superseded)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Installing => "installing",
            LifecycleState::Waiting => "waiting",
            LifecycleState::Active => "active",
            LifecycleState::Superseded => "superseded",
            LifecycleState::Redundant => "redundant",
        }
    }
}

/// Result of a successful install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub primary: String,
    pub offline: String,
    /// Entries written to the primary partition
    pub seeded: usize,
}

/// Seeds and rotates cache partitions
pub struct LifecycleManager {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    metrics: OfflineMetrics,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn CacheStore>, fetcher: Arc<dyn Fetcher>, metrics: OfflineMetrics) -> Self {
        LifecycleManager {
            store,
            fetcher,
            metrics,
        }
    }

    /// Seed the partitions of the generation described by `config`
    ///
    /// Every manifest URL and the offline page are fetched before anything is
    /// written. Only when all of them answered 2xx are the partitions filled;
    /// otherwise the install fails with [`OfflineError::SeedingFailed`] and the
    /// store is left exactly as it was.
    pub async fn install(&self, config: &OfflineConfig) -> Result<InstallReport> {
        let primary = config.primary_cache_name();
        let offline = config.offline_cache_name();
        info!("Installing generation: primary={}, offline={}", primary, offline);

        let result = self.seed(config, &primary, &offline).await;
        self.metrics.record_install(result.is_ok());
        match result {
            Ok(seeded) => {
                info!("Installed generation {}: {} entries seeded", primary, seeded);
                Ok(InstallReport {
                    primary,
                    offline,
                    seeded,
                })
            }
            Err(e) => {
                warn!("Install of generation {} failed: {}", primary, e);
                Err(e)
            }
        }
    }

    async fn seed(&self, config: &OfflineConfig, primary: &str, offline: &str) -> Result<usize> {
        let mut requests = Vec::with_capacity(config.precache_urls.len());
        for url in &config.precache_urls {
            let resolved = config
                .resolve(url)
                .map_err(|e| OfflineError::seeding_failed(url.as_str(), e.to_string()))?;
            requests.push(InterceptedRequest::new(http::Method::GET, resolved)?);
        }
        let offline_url = config.resolve(&config.offline_page)?;
        let offline_request = InterceptedRequest::new(http::Method::GET, offline_url)?;

        let manifest = self.fetch_all(requests).await?;
        let offline_entry = self.fetch_all(vec![offline_request]).await?;

        self.store.put_all(primary, manifest).await?;
        self.store.put_all(offline, offline_entry).await?;

        Ok(self.store.keys(primary).await?.len())
    }

    /// Fetch every request, failing on the first transport error or non-2xx status
    async fn fetch_all(&self, requests: Vec<InterceptedRequest>) -> Result<Vec<(String, ResponseSnapshot)>> {
        let semaphore = Arc::new(Semaphore::new(SEED_CONCURRENCY));
        let mut tasks = Vec::with_capacity(requests.len());

        for request in requests {
            let sem = Arc::clone(&semaphore);
            let fetcher = Arc::clone(&self.fetcher);
            tasks.push(tokio::spawn(async move {
                let _permit = sem
                    .acquire()
                    .await
                    .map_err(|e| OfflineError::InvalidState(format!("seed semaphore closed: {}", e)))?;
                let url = request.url.to_string();
                let response = fetcher
                    .fetch(&request)
                    .await
                    .map_err(|e| OfflineError::seeding_failed(url.as_str(), e.to_string()))?;
                if !response.is_success() {
                    return Err(OfflineError::seeding_failed(
                        url,
                        format!("status {}", response.status),
                    ));
                }
                debug!("Fetched seed entry: url={}, size={}", url, response.body.len());
                Ok((cache_key_for(&request.url), response))
            }));
        }

        let mut entries = Vec::with_capacity(tasks.len());
        for task in tasks {
            let entry = task
                .await
                .map_err(|e| OfflineError::InvalidState(format!("seed task failed: {}", e)))??;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Delete every partition other than the generation's primary and offline ones
    ///
    /// Returns the names of the deleted partitions.
    pub async fn activate(&self, config: &OfflineConfig) -> Result<Vec<String>> {
        let primary = config.primary_cache_name();
        let offline = config.offline_cache_name();

        let mut deleted = Vec::new();
        for name in self.store.partitions().await? {
            if name == primary || name == offline {
                continue;
            }
            if self.store.delete_partition(&name).await? {
                info!("Deleted stale partition: {}", name);
                deleted.push(name);
            }
        }
        info!("Activated generation {} ({} partitions removed)", primary, deleted.len());
        Ok(deleted)
    }
}

/// Identifier of a connected client
pub type ClientId = u64;

/// Tracks which generation controls each connected client
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, String>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ClientId, String>> {
        match self.clients.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a client controlled by `generation`
    pub fn connect(&self, generation: &str) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, generation.to_string());
        debug!("Client {} connected to generation {}", id, generation);
        id
    }

    /// Remove a client
    ///
    /// Returns the generation that controlled it and how many clients that
    /// generation still controls, or `None` for an unknown id.
    pub fn disconnect(&self, id: ClientId) -> Option<(String, usize)> {
        let mut clients = self.lock();
        let generation = clients.remove(&id)?;
        let remaining = clients.values().filter(|g| **g == generation).count();
        debug!(
            "Client {} disconnected from generation {} ({} remaining)",
            id, generation, remaining
        );
        Some((generation, remaining))
    }

    /// Move every client to `generation`. Returns the number of clients claimed.
    pub fn claim(&self, generation: &str) -> usize {
        let mut clients = self.lock();
        for controller in clients.values_mut() {
            *controller = generation.to_string();
        }
        clients.len()
    }

    /// Number of clients controlled by `generation`
    pub fn count_for(&self, generation: &str) -> usize {
        self.lock().values().filter(|g| *g == generation).count()
    }

    /// Generation controlling a client
    pub fn controller(&self, id: ClientId) -> Option<String> {
        self.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::MemoryCacheStore;
    use async_trait::async_trait;

    /// Answers 200 for every URL except the ones listed as failing
    struct SeedFetcher {
        failing: Vec<String>,
    }

    #[async_trait]
    impl Fetcher for SeedFetcher {
        async fn fetch(&self, request: &InterceptedRequest) -> Result<ResponseSnapshot> {
            if self.failing.iter().any(|f| request.url.as_str().ends_with(f.as_str())) {
                return Ok(ResponseSnapshot::new(404, "missing"));
            }
            Ok(ResponseSnapshot::new(200, format!("body of {}", request.url)))
        }
    }

    fn config(generation: &str) -> OfflineConfig {
        OfflineConfig {
            generation: generation.to_string(),
            origin: "http://localhost".to_string(),
            precache_urls: vec!["/".to_string(), "/static/css/app.css".to_string()],
            ..OfflineConfig::default()
        }
    }

    fn manager(store: Arc<MemoryCacheStore>, failing: &[&str]) -> LifecycleManager {
        let fetcher = Arc::new(SeedFetcher {
            failing: failing.iter().map(|s| s.to_string()).collect(),
        });
        LifecycleManager::new(store, fetcher, OfflineMetrics::new().unwrap())
    }

    #[test]
    fn test_state_transitions() {
        use LifecycleState::*;
        assert!(Installing.can_transition_to(Waiting));
        assert!(Installing.can_transition_to(Redundant));
        assert!(Waiting.can_transition_to(Active));
        assert!(Active.can_transition_to(Superseded));
        assert!(!Redundant.can_transition_to(Active));
        assert!(!Superseded.can_transition_to(Active));
        assert!(!Installing.can_transition_to(Active));
    }

    #[tokio::test]
    async fn test_install_seeds_both_partitions() {
        let store = Arc::new(MemoryCacheStore::new());
        let report = manager(store.clone(), &[]).install(&config("v1")).await.unwrap();

        assert_eq!(report.primary, "autolavaggio-cache-v1");
        assert_eq!(report.offline, "autolavaggio-offline-v1");
        assert_eq!(report.seeded, 2);
        assert_eq!(
            store.keys("autolavaggio-offline-v1").await.unwrap(),
            vec!["http://localhost/offline.html".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failed_install_writes_nothing() {
        let store = Arc::new(MemoryCacheStore::new());
        let err = manager(store.clone(), &["app.css"])
            .install(&config("v1"))
            .await
            .unwrap_err();

        assert!(matches!(err, OfflineError::SeedingFailed { .. }));
        assert!(store.partitions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_offline_page_fails_install() {
        let store = Arc::new(MemoryCacheStore::new());
        let result = manager(store.clone(), &["offline.html"]).install(&config("v1")).await;

        assert!(result.is_err());
        assert!(!store.has_partition("autolavaggio-cache-v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_activate_deletes_other_partitions() {
        let store = Arc::new(MemoryCacheStore::new());
        let lifecycle = manager(store.clone(), &[]);
        lifecycle.install(&config("v1")).await.unwrap();
        lifecycle.install(&config("v2")).await.unwrap();
        store.open("unrelated").await.unwrap();

        let deleted = lifecycle.activate(&config("v2")).await.unwrap();
        assert_eq!(deleted, vec!["autolavaggio-cache-v1", "unrelated"]);
        assert_eq!(
            store.partitions().await.unwrap(),
            vec!["autolavaggio-offline-v1", "autolavaggio-cache-v2"]
        );
    }

    #[test]
    fn test_client_registry_handoff() {
        let clients = ClientRegistry::new();
        let a = clients.connect("v1");
        let b = clients.connect("v1");
        assert_eq!(clients.count_for("v1"), 2);

        assert_eq!(clients.disconnect(a), Some(("v1".to_string(), 1)));
        assert_eq!(clients.disconnect(a), None);

        assert_eq!(clients.claim("v2"), 1);
        assert_eq!(clients.controller(b).as_deref(), Some("v2"));
        assert_eq!(clients.count_for("v1"), 0);
    }
}
