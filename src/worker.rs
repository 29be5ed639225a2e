//! Event dispatch for the offline cache engine
//!
//! [`OfflineRuntime`] is the single entry point the host feeds events into. It owns
//! the generation registry (active and waiting [`OfflineWorker`]s), the client
//! registry and the shared resources every generation uses.

use crate::cache_store::CacheStore;
use crate::classifier::ResourceClassifier;
use crate::config::{ConfigChanges, OfflineConfig};
use crate::error::{OfflineError, Result};
use crate::fallback::{offline_response, OfflineFallback};
use crate::fetcher::Fetcher;
use crate::lifecycle::{ClientId, ClientRegistry, InstallReport, LifecycleManager, LifecycleState};
use crate::metrics::OfflineMetrics;
use crate::models::{
    InterceptedRequest, PendingOperation, ResourceCategory, ResponseSnapshot, ResponseSource,
};
use crate::strategy::{Served, StrategyExecutor};
use crate::sync_queue::{SyncQueue, SyncReport};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Control message sent by a page to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Promote the waiting generation now
    SkipWaiting,
    /// Ask for the active primary partition name
    GetVersion,
    /// Fetch and cache the given URLs in the background
    CacheUrls { urls: Vec<String> },
}

/// Events the runtime reacts to
#[derive(Debug)]
pub enum WorkerEvent {
    Install(OfflineConfig),
    Activate,
    Intercept(InterceptedRequest),
    Message {
        message: ControlMessage,
        reply: Option<oneshot::Sender<serde_json::Value>>,
    },
    Sync {
        tag: String,
    },
}

/// Result of dispatching an event
#[derive(Debug)]
pub enum EventOutcome {
    /// A generation was installed; `state` is `Waiting` or `Active`
    Installed {
        report: InstallReport,
        state: LifecycleState,
    },
    /// A waiting generation became active
    Activated {
        generation: String,
        deleted: Vec<String>,
        claimed: usize,
    },
    /// Response for an intercepted request
    Response(Served),
    /// Reply to a control message
    Replied(serde_json::Value),
    /// Background prefetch started by `CACHE_URLS`; resolves to the number of URLs cached
    Prefetching(JoinHandle<usize>),
    /// Message handled with nothing to report
    Acknowledged,
    /// Sync trigger handled; `None` when the tag did not match or a run was in progress
    Synced(Option<SyncReport>),
}

/// One cache generation: its configuration and everything derived from it
pub struct OfflineWorker {
    // Swapped by reloads that do not need a new generation
    config: StdRwLock<Arc<OfflineConfig>>,
    state: Mutex<LifecycleState>,
    classifier: ResourceClassifier,
    executor: StrategyExecutor,
    fallback: OfflineFallback,
    fetcher: Arc<dyn Fetcher>,
    metrics: OfflineMetrics,
}

impl OfflineWorker {
    /// Create a worker in the `Installing` state
    pub fn new(
        config: OfflineConfig,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        metrics: OfflineMetrics,
    ) -> Result<Self> {
        config.validate()?;
        let offline_page = config.resolve(&config.offline_page)?;
        let executor = StrategyExecutor::new(
            Arc::clone(&store),
            Arc::clone(&fetcher),
            config.primary_cache_name(),
            metrics.clone(),
        );
        let fallback = OfflineFallback::new(
            store,
            config.offline_cache_name(),
            offline_page,
            metrics.clone(),
        );

        Ok(OfflineWorker {
            classifier: ResourceClassifier::new(config.classification.clone()),
            config: StdRwLock::new(Arc::new(config)),
            state: Mutex::new(LifecycleState::Installing),
            executor,
            fallback,
            fetcher,
            metrics,
        })
    }

    /// Configuration currently in effect for this generation
    pub fn config(&self) -> Arc<OfflineConfig> {
        match self.config.read() {
            Ok(config) => Arc::clone(&config),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Apply a reloaded configuration that keeps the same partitions
    fn apply_in_place(&self, config: OfflineConfig) {
        if config.classification != *self.classifier.rules() {
            self.classifier.update_rules(config.classification.clone());
        }
        let mut current = match self.config.write() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = Arc::new(config);
    }

    /// Primary partition name, used as the generation's version string
    pub fn name(&self) -> &str {
        self.executor.partition()
    }

    pub fn state(&self) -> LifecycleState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn transition(&self, next: LifecycleState) -> Result<()> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !state.can_transition_to(next) {
            return Err(OfflineError::InvalidState(format!(
                "generation {} cannot move from {} to {}",
                self.name(),
                state.as_str(),
                next.as_str()
            )));
        }
        debug!("Generation {}: {} -> {}", self.name(), state.as_str(), next.as_str());
        *state = next;
        Ok(())
    }

    /// Classification rules in use by this generation
    pub fn classifier(&self) -> &ResourceClassifier {
        &self.classifier
    }

    /// Produce a response for an intercepted request
    ///
    /// Never fails: when network and cache are exhausted the fallback handler answers.
    pub async fn handle(&self, request: &InterceptedRequest, queue: &SyncQueue) -> Served {
        if !request.is_safe_method() {
            let served = self.passthrough(request, queue).await;
            self.metrics.record_request("unsafe", served.source.as_str());
            return served;
        }

        let category = self.classifier.classify(request);
        let served = match self.executor.execute(category.strategy(), request).await {
            Ok(served) => served,
            Err(e) => {
                debug!("Strategy exhausted for url={}: {}", request.url, e);
                self.fall_back(request).await
            }
        };
        self.metrics.record_request(category.as_str(), served.source.as_str());
        served
    }

    /// Send an unsafe request straight to the network
    ///
    /// On a transport failure a JSON POST to a deferrable path is queued for
    /// background sync and answered with `202 Accepted`.
    async fn passthrough(&self, request: &InterceptedRequest, queue: &SyncQueue) -> Served {
        let err = match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.metrics.record_fetch(Some(response.status));
                return Served {
                    response,
                    source: ResponseSource::Network,
                    revalidation: None,
                };
            }
            Err(e) => e,
        };
        self.metrics.record_fetch(None);
        warn!("{} {} failed while offline: {}", request.method, request.url, err);

        if let Some(operation) = self.deferrable_operation(request) {
            let id = operation.id.clone();
            match queue.enqueue(operation).await {
                Ok(()) => {
                    return Served {
                        response: ResponseSnapshot::json(
                            202,
                            &json!({"queued": true, "id": id, "offline": true}),
                        ),
                        source: ResponseSource::Deferred,
                        revalidation: None,
                    };
                }
                Err(e) => error!("Failed to queue pending operation {}: {}", id, e),
            }
        }

        self.fall_back(request).await
    }

    /// Only a JSON `POST` under a deferrable path can be replayed later
    fn deferrable_operation(&self, request: &InterceptedRequest) -> Option<PendingOperation> {
        if request.method != http::Method::POST {
            return None;
        }
        let path = request.path();
        if !self
            .config()
            .sync
            .deferrable_paths
            .iter()
            .any(|p| path.starts_with(p.as_str()))
        {
            return None;
        }
        let payload: serde_json::Value = serde_json::from_slice(request.body.as_ref()?).ok()?;
        Some(PendingOperation::new(request.target(), payload))
    }

    async fn fall_back(&self, request: &InterceptedRequest) -> Served {
        let (response, source) = self.fallback.respond(request).await;
        Served {
            response,
            source,
            revalidation: None,
        }
    }

    /// Fetch and cache URLs into this generation's primary partition
    async fn prefetch(&self, urls: Vec<String>) -> usize {
        let mut cached = 0;
        for url in urls {
            let request = match self
                .config()
                .resolve(&url)
                .and_then(|u| InterceptedRequest::new(http::Method::GET, u))
            {
                Ok(request) => request,
                Err(e) => {
                    warn!("Skipping URL {}: {}", url, e);
                    continue;
                }
            };
            match self.executor.prefetch(&request).await {
                Ok(true) => cached += 1,
                Ok(false) => debug!("Not caching {}: non-success status", url),
                Err(e) => warn!("Failed to prefetch {}: {}", url, e),
            }
        }
        info!("Prefetch finished: {} URLs cached", cached);
        cached
    }
}

#[derive(Default)]
struct Generations {
    active: Option<Arc<OfflineWorker>>,
    waiting: Option<Arc<OfflineWorker>>,
}

/// Owner of every generation and the resources they share
pub struct OfflineRuntime {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    lifecycle: LifecycleManager,
    generations: RwLock<Generations>,
    clients: ClientRegistry,
    sync_queue: Arc<SyncQueue>,
    metrics: OfflineMetrics,
}

impl OfflineRuntime {
    pub fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        sync_queue: Arc<SyncQueue>,
        metrics: OfflineMetrics,
    ) -> Self {
        OfflineRuntime {
            lifecycle: LifecycleManager::new(Arc::clone(&store), Arc::clone(&fetcher), metrics.clone()),
            store,
            fetcher,
            generations: RwLock::new(Generations::default()),
            clients: ClientRegistry::new(),
            sync_queue,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn metrics(&self) -> &OfflineMetrics {
        &self.metrics
    }

    pub fn sync_queue(&self) -> &Arc<SyncQueue> {
        &self.sync_queue
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// The generation currently serving requests
    pub async fn active_worker(&self) -> Option<Arc<OfflineWorker>> {
        self.generations.read().await.active.clone()
    }

    /// The installed generation waiting for promotion
    pub async fn waiting_worker(&self) -> Option<Arc<OfflineWorker>> {
        self.generations.read().await.waiting.clone()
    }

    /// Handle one event
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome> {
        match event {
            WorkerEvent::Install(config) => self.install(config).await,
            WorkerEvent::Activate => self.activate().await,
            WorkerEvent::Intercept(request) => Ok(EventOutcome::Response(self.intercept(&request).await)),
            WorkerEvent::Message { message, reply } => self.on_message(message, reply).await,
            WorkerEvent::Sync { tag } => Ok(EventOutcome::Synced(self.sync_queue.run(&tag).await?)),
        }
    }

    async fn install(&self, config: OfflineConfig) -> Result<EventOutcome> {
        let skip_waiting = config.skip_waiting_on_install;
        let worker = Arc::new(OfflineWorker::new(
            config,
            Arc::clone(&self.store),
            Arc::clone(&self.fetcher),
            self.metrics.clone(),
        )?);

        let report = match self.lifecycle.install(&worker.config()).await {
            Ok(report) => report,
            Err(e) => {
                worker.transition(LifecycleState::Redundant)?;
                return Err(e);
            }
        };
        worker.transition(LifecycleState::Waiting)?;

        let promote = {
            let mut generations = self.generations.write().await;
            if let Some(previous) = generations.waiting.replace(Arc::clone(&worker)) {
                info!("Discarding previously waiting generation {}", previous.name());
            }
            match generations.active {
                Some(ref active) => skip_waiting || self.clients.count_for(active.name()) == 0,
                None => true,
            }
        };

        if promote {
            self.activate().await?;
        } else {
            info!("Generation {} installed and waiting for clients to close", worker.name());
        }

        Ok(EventOutcome::Installed {
            report,
            state: worker.state(),
        })
    }

    /// Serve a generation seeded by an earlier process without fetching anything
    ///
    /// Fails with [`OfflineError::NotInstalled`] when the store has no primary
    /// partition for `config`.
    pub async fn resume(&self, config: OfflineConfig) -> Result<()> {
        let worker = Arc::new(OfflineWorker::new(
            config,
            Arc::clone(&self.store),
            Arc::clone(&self.fetcher),
            self.metrics.clone(),
        )?);
        if !self.store.has_partition(worker.name()).await? {
            return Err(OfflineError::NotInstalled);
        }
        worker.transition(LifecycleState::Waiting)?;
        worker.transition(LifecycleState::Active)?;

        let mut generations = self.generations.write().await;
        if let Some(previous) = generations.active.replace(Arc::clone(&worker)) {
            previous.transition(LifecycleState::Superseded)?;
        }
        info!("Resumed generation {} from the cache store", worker.name());
        Ok(())
    }

    /// Promote the waiting generation
    async fn activate(&self) -> Result<EventOutcome> {
        let mut generations = self.generations.write().await;
        let worker = match generations.waiting {
            Some(ref worker) => Arc::clone(worker),
            None => {
                return Err(OfflineError::InvalidState(
                    "no waiting generation to activate".to_string(),
                ))
            }
        };

        let deleted = self.lifecycle.activate(&worker.config()).await?;
        worker.transition(LifecycleState::Active)?;
        if let Some(previous) = generations.active.take() {
            previous.transition(LifecycleState::Superseded)?;
        }
        generations.waiting = None;
        generations.active = Some(Arc::clone(&worker));

        let claimed = self.clients.claim(worker.name());
        info!(
            "Generation {} is active, claimed {} clients",
            worker.name(),
            claimed
        );
        Ok(EventOutcome::Activated {
            generation: worker.name().to_string(),
            deleted,
            claimed,
        })
    }

    /// Produce a response for an intercepted request; never fails
    pub async fn intercept(&self, request: &InterceptedRequest) -> Served {
        match self.active_worker().await {
            Some(worker) => worker.handle(request, &self.sync_queue).await,
            None => {
                debug!("{} while serving {}", OfflineError::NotInstalled, request.url);
                let (response, source) = match self.fetcher.fetch(request).await {
                    Ok(response) => (response, ResponseSource::Network),
                    Err(_) => (offline_response(), ResponseSource::Synthesized),
                };
                self.metrics
                    .record_request(ResourceCategory::Other.as_str(), source.as_str());
                Served {
                    response,
                    source,
                    revalidation: None,
                }
            }
        }
    }

    async fn on_message(
        &self,
        message: ControlMessage,
        reply: Option<oneshot::Sender<serde_json::Value>>,
    ) -> Result<EventOutcome> {
        debug!("Control message: {:?}", message);
        match message {
            ControlMessage::SkipWaiting => {
                if self.waiting_worker().await.is_some() {
                    self.activate().await
                } else {
                    Ok(EventOutcome::Acknowledged)
                }
            }
            ControlMessage::GetVersion => {
                let version = self.active_worker().await.map(|w| w.name().to_string());
                let body = json!({ "version": version });
                if let Some(reply) = reply {
                    // The asking side may have gone away
                    let _ = reply.send(body.clone());
                }
                Ok(EventOutcome::Replied(body))
            }
            ControlMessage::CacheUrls { urls } => match self.active_worker().await {
                Some(worker) => Ok(EventOutcome::Prefetching(tokio::spawn(async move {
                    worker.prefetch(urls).await
                }))),
                None => {
                    warn!("Ignoring CACHE_URLS for {} URLs: {}", urls.len(), OfflineError::NotInstalled);
                    Ok(EventOutcome::Acknowledged)
                }
            },
        }
    }

    /// Queue a JSON payload for the active generation's submission endpoint
    ///
    /// Returns the id of the new pending operation.
    pub async fn queue_operation(&self, payload: serde_json::Value) -> Result<String> {
        let worker = self.active_worker().await.ok_or(OfflineError::NotInstalled)?;
        let operation = PendingOperation::new(worker.config().sync.endpoint.clone(), payload);
        let id = operation.id.clone();
        self.sync_queue.enqueue(operation).await?;
        Ok(id)
    }

    /// Register a client with the active generation
    pub async fn connect_client(&self) -> Result<ClientId> {
        let worker = self.active_worker().await.ok_or(OfflineError::NotInstalled)?;
        Ok(self.clients.connect(worker.name()))
    }

    /// Remove a client; promotes the waiting generation when its last client leaves
    ///
    /// Returns `true` if a generation was promoted.
    pub async fn disconnect_client(&self, id: ClientId) -> Result<bool> {
        let (generation, remaining) = match self.clients.disconnect(id) {
            Some(entry) => entry,
            None => return Ok(false),
        };
        if remaining > 0 || self.waiting_worker().await.is_none() {
            return Ok(false);
        }
        let controls_active = self
            .active_worker()
            .await
            .map(|w| w.name() == generation)
            .unwrap_or(true);
        if !controls_active {
            return Ok(false);
        }
        self.activate().await?;
        Ok(true)
    }

    /// Apply a new configuration
    ///
    /// Changes to what gets seeded install a new generation. Anything else is
    /// swapped into the active generation in place: classification rules and the
    /// deferral paths and submission endpoint take effect on the next request.
    /// The sync tag and queue path, the fetch timeout, connectivity probing and
    /// the metrics endpoint are fixed at start-up.
    pub async fn reload(&self, new_config: OfflineConfig) -> Result<ConfigChanges> {
        let worker = self.active_worker().await.ok_or(OfflineError::NotInstalled)?;
        let mut current = OfflineConfig::clone(&worker.config());
        let changes = current.update_from(&new_config)?;
        if !changes.has_changes() {
            debug!("Configuration reload: no changes");
            return Ok(changes);
        }
        info!("Configuration reload: changed {:?}", changes.summary());

        let previous = worker.config();
        if new_config.sync.tag != previous.sync.tag
            || new_config.sync.queue_path != previous.sync.queue_path
            || changes.fetch_timeout_changed
            || changes.connectivity_changed
            || changes.metrics_endpoint_changed
        {
            warn!("Configuration reload: some changes only take effect after a restart");
        }

        if changes.requires_reinstall() {
            self.install(new_config).await?;
        } else {
            worker.apply_in_place(new_config);
        }
        Ok(changes)
    }
}
