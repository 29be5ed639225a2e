//! Offline cache server
//!
//! Loads the configuration, installs the configured cache generation and serves
//! the web application through the offline cache engine.

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use washcache::{
    CacheStore, ConnectivityMonitor, DiskCacheStore, HttpFetcher, MemoryCacheStore,
    MetricsEndpoint, OfflineConfig, OfflineMetrics, OfflineRuntime, OfflineServer, SyncQueue,
    WorkerEvent,
};

/// Main entry point for the offline cache server
///
/// # Usage
/// ```bash
/// # Start with default config (washcache.yaml)
/// washcache
///
/// # Start with custom config
/// washcache /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting offline cache server");

    let config_path = PathBuf::from(
        env::args()
            .nth(1)
            .unwrap_or_else(|| "washcache.yaml".to_string()),
    );
    info!("Loading configuration from: {}", config_path.display());

    let config = OfflineConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    info!("Configuration loaded successfully");
    info!("  - Origin: {}", config.origin);
    info!("  - Primary partition: {}", config.primary_cache_name());
    info!("  - Offline partition: {}", config.offline_cache_name());
    info!("  - Precache URLs: {}", config.precache_urls.len());
    info!("  - Fetch timeout: {} seconds", config.fetch_timeout_secs);

    let metrics = OfflineMetrics::new().context("failed to register metrics")?;
    let fetcher = Arc::new(
        HttpFetcher::with_timeout(config.fetch_timeout()).context("failed to create HTTP client")?,
    );

    let store: Arc<dyn CacheStore> = match config.cache_dir {
        Some(ref dir) => Arc::new(
            DiskCacheStore::new(dir)
                .await
                .with_context(|| format!("failed to open cache directory {}", dir))?,
        ),
        None => {
            info!("No cache_dir configured, keeping the cache in memory");
            Arc::new(MemoryCacheStore::new())
        }
    };

    let origin = config.origin_url()?;
    let sync_queue = Arc::new(match config.sync.queue_path {
        Some(ref path) => SyncQueue::open(
            path,
            fetcher.clone(),
            origin.clone(),
            config.sync.tag.clone(),
            metrics.clone(),
        )
        .await
        .with_context(|| format!("failed to open sync queue {}", path))?,
        None => SyncQueue::in_memory(
            fetcher.clone(),
            origin.clone(),
            config.sync.tag.clone(),
            metrics.clone(),
        ),
    });

    let runtime = Arc::new(OfflineRuntime::new(
        store,
        fetcher.clone(),
        sync_queue,
        metrics.clone(),
    ));

    match runtime.dispatch(WorkerEvent::Install(config.clone())).await {
        Ok(outcome) => info!("Install finished: {:?}", outcome),
        Err(e) => {
            warn!("Install of {} failed: {}", config.primary_cache_name(), e);
            match runtime.resume(config.clone()).await {
                Ok(()) => info!("Serving {} from an earlier run", config.primary_cache_name()),
                Err(e) => warn!("No cached generation to serve: {}", e),
            }
        }
    }

    if let Some(ref endpoint) = config.metrics_endpoint {
        if endpoint.enabled {
            let addr: SocketAddr = endpoint
                .address
                .parse()
                .with_context(|| format!("invalid metrics address {}", endpoint.address))?;
            let server = MetricsEndpoint::new(metrics.clone(), addr);
            tokio::spawn(async move {
                if let Err(e) = server.start().await {
                    error!("Metrics endpoint stopped: {}", e);
                }
            });
        }
    }

    if config.connectivity.enabled {
        let monitor = Arc::new(ConnectivityMonitor::new(
            Arc::clone(&runtime),
            fetcher,
            config.resolve(&config.connectivity.probe_path)?,
            std::time::Duration::from_secs(config.connectivity.interval_secs),
            config.sync.tag.clone(),
        ));
        tokio::spawn(monitor.run());
    }

    let addr: SocketAddr = config
        .listen_address
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen_address))?;
    let server = Arc::new(OfflineServer::new(runtime, &config, Some(config_path))?);
    server
        .start(addr)
        .await
        .with_context(|| format!("server on {} stopped", addr))?;

    Ok(())
}
