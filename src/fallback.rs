//! Last-resort responses for requests the network and the primary partition
//! could not answer

use crate::cache_store::CacheStore;
use crate::error::OfflineError;
use crate::metrics::OfflineMetrics;
use crate::models::{cache_key_for, InterceptedRequest, ResponseSnapshot, ResponseSource};
use reqwest::Url;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Message carried by the synthesized 503 body
pub const OFFLINE_MESSAGE: &str = "Content not available offline";

/// Produces a response for a request that could not be served otherwise
pub struct OfflineFallback {
    store: Arc<dyn CacheStore>,
    offline_partition: String,
    offline_page: Url,
    metrics: OfflineMetrics,
}

impl OfflineFallback {
    /// Create a new fallback handler
    ///
    /// # Arguments
    /// * `store` - Shared cache store
    /// * `offline_partition` - Partition holding the offline page
    /// * `offline_page` - Absolute URL the offline page was stored under
    /// * `metrics` - Metrics of the owning runtime
    pub fn new(
        store: Arc<dyn CacheStore>,
        offline_partition: impl Into<String>,
        offline_page: Url,
        metrics: OfflineMetrics,
    ) -> Self {
        OfflineFallback {
            store,
            offline_partition: offline_partition.into(),
            offline_page,
            metrics,
        }
    }

    /// Answer the request without the network
    ///
    /// # Logic
    /// 1. HTML requests get the offline page from the offline partition
    /// 2. Any partition holding the request key (safe methods only)
    /// 3. A synthesized `503` JSON body with `"offline": true`
    ///
    /// Never fails: store errors are logged and the next step is tried.
    pub async fn respond(&self, request: &InterceptedRequest) -> (ResponseSnapshot, ResponseSource) {
        if request.accepts_html() {
            if let Some(page) = self.offline_page().await {
                debug!("Serving offline page for url={}", request.url);
                self.metrics.record_fallback("offline_page");
                return (page, ResponseSource::OfflinePage);
            }
        }

        // Cache entries only ever hold GET responses
        if request.is_safe_method() {
            match self.store.match_any(&request.cache_key()).await {
                Ok(Some(response)) => {
                    debug!("Serving cross-partition match for url={}", request.url);
                    self.metrics.record_fallback("cross_partition");
                    return (response, ResponseSource::Cache);
                }
                Ok(None) => {}
                Err(e) => warn!("Cross-partition lookup failed for url={}: {}", request.url, e),
            }
        }

        debug!("Synthesizing offline response for url={}", request.url);
        self.metrics.record_fallback("synthesized");
        (offline_response(), ResponseSource::Synthesized)
    }

    async fn offline_page(&self) -> Option<ResponseSnapshot> {
        let key = cache_key_for(&self.offline_page);
        match self.store.get(&self.offline_partition, &key).await {
            Ok(Some(page)) => Some(page),
            Ok(None) => {
                let err = OfflineError::MissingOfflinePage(self.offline_partition.clone());
                error!("{} (key={})", err, key);
                None
            }
            Err(e) => {
                error!("Failed to read offline page {}: {}", key, e);
                None
            }
        }
    }
}

/// The synthesized `503 Service Unavailable` response
pub fn offline_response() -> ResponseSnapshot {
    ResponseSnapshot::json(
        503,
        &json!({
            "error": OFFLINE_MESSAGE,
            "offline": true,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::MemoryCacheStore;

    const OFFLINE_PARTITION: &str = "autolavaggio-offline-v1";

    fn handler(store: Arc<MemoryCacheStore>) -> OfflineFallback {
        OfflineFallback::new(
            store,
            OFFLINE_PARTITION,
            Url::parse("http://localhost/offline.html").unwrap(),
            OfflineMetrics::new().unwrap(),
        )
    }

    fn page() -> ResponseSnapshot {
        ResponseSnapshot::new(200, "<h1>Offline</h1>").with_header("content-type", "text/html")
    }

    #[tokio::test]
    async fn test_html_request_gets_offline_page() {
        let store = Arc::new(MemoryCacheStore::new());
        store.put(OFFLINE_PARTITION, "http://localhost/offline.html", page()).await.unwrap();

        let request = InterceptedRequest::get("http://localhost/clienti/")
            .unwrap()
            .accepting("text/html");
        let (response, source) = handler(store).respond(&request).await;

        assert_eq!(response, page());
        assert_eq!(source, ResponseSource::OfflinePage);
    }

    #[tokio::test]
    async fn test_missing_offline_page_falls_through() {
        let store = Arc::new(MemoryCacheStore::new());
        let request = InterceptedRequest::get("http://localhost/clienti/")
            .unwrap()
            .accepting("text/html");
        let (response, source) = handler(store).respond(&request).await;

        assert_eq!(response.status, 503);
        assert_eq!(source, ResponseSource::Synthesized);
    }

    #[tokio::test]
    async fn test_cross_partition_match() {
        let store = Arc::new(MemoryCacheStore::new());
        let key = "http://localhost/static/manifest.json";
        store
            .put("autolavaggio-cache-v0", key, ResponseSnapshot::new(200, "{}"))
            .await
            .unwrap();

        let (response, source) = handler(store)
            .respond(&InterceptedRequest::get(key).unwrap())
            .await;
        assert_eq!(response.body, "{}");
        assert_eq!(source, ResponseSource::Cache);
    }

    #[tokio::test]
    async fn test_unsafe_request_skips_cached_entries() {
        let store = Arc::new(MemoryCacheStore::new());
        let key = "http://localhost/api/ordini/";
        store
            .put("autolavaggio-cache-v1", key, ResponseSnapshot::new(200, "[]"))
            .await
            .unwrap();

        let mut request = InterceptedRequest::get(key).unwrap();
        request.method = http::Method::POST;
        let (response, source) = handler(store).respond(&request).await;
        assert_eq!(response.status, 503);
        assert_eq!(source, ResponseSource::Synthesized);
    }

    #[tokio::test]
    async fn test_synthesized_503_body() {
        let store = Arc::new(MemoryCacheStore::new());
        let (response, source) = handler(store)
            .respond(&InterceptedRequest::get("http://localhost/api/ordini/").unwrap())
            .await;

        assert_eq!(source, ResponseSource::Synthesized);
        assert_eq!(response.status, 503);
        assert_eq!(response.header("content-type"), Some("application/json"));
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["offline"], true);
        assert_eq!(body["error"], OFFLINE_MESSAGE);
    }
}
