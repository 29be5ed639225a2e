//! Caching strategy executors
//!
//! Each executor answers a request from the primary partition and/or the
//! network. An `Err` from any of them means both sources are exhausted; the worker
//! turns it into a fallback response.

use crate::cache_store::CacheStore;
use crate::error::{OfflineError, Result};
use crate::fetcher::Fetcher;
use crate::metrics::OfflineMetrics;
use crate::models::{InterceptedRequest, ResponseSnapshot, ResponseSource, Strategy};
use http::Method;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A response produced by a strategy
#[derive(Debug)]
pub struct Served {
    pub response: ResponseSnapshot,
    pub source: ResponseSource,
    /// Background refresh started by stale-while-revalidate on a cache hit
    pub revalidation: Option<JoinHandle<()>>,
}

impl Served {
    fn network(response: ResponseSnapshot) -> Self {
        Served {
            response,
            source: ResponseSource::Network,
            revalidation: None,
        }
    }

    fn cache(response: ResponseSnapshot) -> Self {
        Served {
            response,
            source: ResponseSource::Cache,
            revalidation: None,
        }
    }
}

/// Runs the caching strategies against one primary partition
#[derive(Clone)]
pub struct StrategyExecutor {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    partition: String,
    metrics: OfflineMetrics,
}

impl StrategyExecutor {
    /// Create a new executor
    ///
    /// # Arguments
    /// * `store` - Shared cache store
    /// * `fetcher` - Network access
    /// * `partition` - Name of the primary partition reads and writes go to
    /// * `metrics` - Metrics of the owning runtime
    pub fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        partition: impl Into<String>,
        metrics: OfflineMetrics,
    ) -> Self {
        StrategyExecutor {
            store,
            fetcher,
            partition: partition.into(),
            metrics,
        }
    }

    /// Primary partition name
    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Run the given strategy for a request
    pub async fn execute(&self, strategy: Strategy, request: &InterceptedRequest) -> Result<Served> {
        let start = Instant::now();
        let result = match strategy {
            Strategy::CacheFirst => self.cache_first(request).await,
            Strategy::NetworkFirst => self.network_first(request).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
        };
        self.metrics.record_duration(strategy.as_str(), start.elapsed());
        result
    }

    /// Serve from the primary partition, going to the network only on a miss
    ///
    /// # Logic
    /// 1. Hit → return the entry without touching the network
    /// 2. Miss → fetch; 2xx is stored then returned, other statuses are returned as-is
    /// 3. Transport failure on a miss → `Err`
    pub async fn cache_first(&self, request: &InterceptedRequest) -> Result<Served> {
        let key = request.cache_key();
        if let Some(cached) = self.lookup(&key).await {
            debug!("Cache-first hit: url={}", request.url);
            return Ok(Served::cache(cached));
        }

        debug!("Cache-first miss, fetching: url={}", request.url);
        let response = self.fetch(request).await?;
        self.store_copy(request, &response).await;
        Ok(Served::network(response))
    }

    /// Try the network first, falling back to the primary partition
    ///
    /// Only a transport failure reaches the cache. A 4xx/5xx answer is returned
    /// as-is and leaves the cache untouched.
    pub async fn network_first(&self, request: &InterceptedRequest) -> Result<Served> {
        match self.fetch(request).await {
            Ok(response) => {
                self.store_copy(request, &response).await;
                Ok(Served::network(response))
            }
            Err(e) => {
                debug!("Network-first falling back to cache: url={}, error={}", request.url, e);
                match self.lookup(&request.cache_key()).await {
                    Some(cached) => Ok(Served::cache(cached)),
                    None => Err(e),
                }
            }
        }
    }

    /// Answer from cache immediately while refreshing the entry in the background
    ///
    /// The network fetch is started before the cache lookup. On a hit the fetch
    /// keeps running detached and its handle is returned in
    /// [`Served::revalidation`]; on a miss the in-flight fetch is awaited.
    pub async fn stale_while_revalidate(&self, request: &InterceptedRequest) -> Result<Served> {
        let (tx, rx) = oneshot::channel();
        let executor = self.clone();
        let background_request = request.clone();
        let revalidation = tokio::spawn(async move {
            let result = executor.fetch(&background_request).await;
            match result {
                Ok(ref response) => executor.store_copy(&background_request, response).await,
                Err(ref e) => {
                    debug!(
                        "Background revalidation failed: url={}, error={}",
                        background_request.url, e
                    );
                }
            }
            // The receiver is gone when the cached copy was served
            let _ = tx.send(result);
        });

        if let Some(cached) = self.lookup(&request.cache_key()).await {
            debug!("Serving stale copy while revalidating: url={}", request.url);
            return Ok(Served {
                response: cached,
                source: ResponseSource::Cache,
                revalidation: Some(revalidation),
            });
        }

        let response = rx.await.map_err(|_| {
            OfflineError::Transport(format!("revalidation of {} was aborted", request.url))
        })??;
        Ok(Served::network(response))
    }

    /// Fetch a URL and store it in the primary partition when it answers 2xx
    ///
    /// Used for `CACHE_URLS` control messages.
    pub async fn prefetch(&self, request: &InterceptedRequest) -> Result<bool> {
        let response = self.fetch(request).await?;
        let stored = response.is_success();
        self.store_copy(request, &response).await;
        Ok(stored)
    }

    async fn fetch(&self, request: &InterceptedRequest) -> Result<ResponseSnapshot> {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.metrics.record_fetch(Some(response.status));
                Ok(response)
            }
            Err(e) => {
                self.metrics.record_fetch(None);
                Err(e)
            }
        }
    }

    async fn lookup(&self, key: &str) -> Option<ResponseSnapshot> {
        let found = match self.store.get(&self.partition, key).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Cache lookup failed, treating as miss: key={}, error={}", key, e);
                None
            }
        };
        self.metrics.record_cache_lookup(found.is_some());
        found
    }

    /// Store a 2xx GET response; anything else is left out of the cache
    async fn store_copy(&self, request: &InterceptedRequest, response: &ResponseSnapshot) {
        if request.method != Method::GET || !response.is_success() {
            return;
        }
        let key = request.cache_key();
        match self.store.put(&self.partition, &key, response.clone()).await {
            Ok(()) => info!("Cached response: partition={}, key={}", self.partition, key),
            Err(e) => {
                self.metrics.record_cache_write_failure();
                warn!("Failed to cache response: key={}, error={}", key, e);
            }
        }
    }
}
