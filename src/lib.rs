//! Washcache
//!
//! Offline cache engine for the car-wash management web application. Every request
//! the application would send to its origin passes through the engine, which picks
//! a caching policy for it, falls back to cached or synthesized responses when the
//! network is down, and replays state-changing operations recorded while offline.
//!
//! # Features
//!
//! - **Per-request caching policy**: cache-first for static assets, network-first
//!   for API calls, stale-while-revalidate for page navigations
//! - **Offline fallback**: offline page for navigations, any cached copy otherwise,
//!   and a `503` JSON body as the last resort
//! - **Generation lifecycle**: all-or-nothing seeding of a new cache generation and
//!   removal of stale partitions on activation
//! - **Background sync**: persisted FIFO of pending operations replayed when the
//!   origin comes back
//! - **Metrics**: Prometheus counters exposed on a separate endpoint
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use washcache::{
//!     HttpFetcher, InterceptedRequest, MemoryCacheStore, OfflineConfig, OfflineMetrics,
//!     OfflineRuntime, SyncQueue, WorkerEvent,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OfflineConfig::from_file("washcache.yaml")?;
//! let metrics = OfflineMetrics::new()?;
//! let fetcher = Arc::new(HttpFetcher::with_timeout(config.fetch_timeout())?);
//! let queue = Arc::new(SyncQueue::in_memory(
//!     fetcher.clone(),
//!     config.origin_url()?,
//!     config.sync.tag.clone(),
//!     metrics.clone(),
//! ));
//! let runtime = OfflineRuntime::new(Arc::new(MemoryCacheStore::new()), fetcher, queue, metrics);
//!
//! runtime.dispatch(WorkerEvent::Install(config)).await?;
//! let served = runtime
//!     .intercept(&InterceptedRequest::get("http://127.0.0.1:8000/static/css/app.css")?)
//!     .await;
//! println!("{} from {}", served.response.status, served.source.as_str());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`ResourceClassifier`]: maps a request to a [`ResourceCategory`]
//! - [`StrategyExecutor`]: runs the caching policy of a category
//! - [`OfflineFallback`]: answers requests network and cache could not
//! - [`LifecycleManager`]: seeds and rotates cache partitions
//! - [`SyncQueue`]: pending operations and their replay
//! - [`OfflineRuntime`]: single entry point dispatching [`WorkerEvent`]s
//! - [`CacheStore`]: partitioned response store, in memory or on disk

pub mod cache_store;
pub mod classifier;
pub mod config;
pub mod connectivity;
pub mod disk_store;
pub mod error;
pub mod fallback;
pub mod fetcher;
pub mod lifecycle;
pub mod metrics;
pub mod metrics_endpoint;
pub mod models;
pub mod server;
pub mod strategy;
pub mod sync_queue;
pub mod worker;

// Re-export commonly used types
pub use cache_store::{CacheStats, CacheStore, MemoryCacheStore};
pub use classifier::ResourceClassifier;
pub use config::{ClassificationRules, ConfigChanges, OfflineConfig, SyncConfig};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use disk_store::DiskCacheStore;
pub use error::{OfflineError, Result};
pub use fallback::OfflineFallback;
pub use fetcher::{Fetcher, HttpFetcher};
pub use lifecycle::{ClientId, ClientRegistry, InstallReport, LifecycleManager, LifecycleState};
pub use metrics::{MetricsSnapshot, OfflineMetrics};
pub use metrics_endpoint::MetricsEndpoint;
pub use models::{
    InterceptedRequest, PendingOperation, ResourceCategory, ResponseSnapshot, ResponseSource, Strategy,
};
pub use server::OfflineServer;
pub use strategy::{Served, StrategyExecutor};
pub use sync_queue::{SyncQueue, SyncReport};
pub use worker::{ControlMessage, EventOutcome, OfflineRuntime, OfflineWorker, WorkerEvent};
