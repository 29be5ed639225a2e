//! Network access for the strategy executors
//!
//! The [`Fetcher`] trait is the seam between the cache engine and the network.
//! Its contract carries the distinction the strategies depend on: an `Err` is a
//! transport failure (unreachable, refused, timed out), while any HTTP status a
//! reachable server answers with, 4xx and 5xx included, is an `Ok` response.

use crate::error::{OfflineError, Result};
use crate::models::{InterceptedRequest, ResponseSnapshot};
use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Headers that describe a single connection rather than the resource
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| name.as_str().eq_ignore_ascii_case(h))
}

/// Performs network requests on behalf of the engine
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Send the request to the network
    ///
    /// # Returns
    /// * `Ok(ResponseSnapshot)` for any response the server produced
    /// * `Err(OfflineError)` with `is_transport() == true` if the network failed
    async fn fetch(&self, request: &InterceptedRequest) -> Result<ResponseSnapshot>;
}

/// reqwest-backed fetcher
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a new HttpFetcher with default settings
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create a new HttpFetcher with a custom timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| OfflineError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(HttpFetcher { client })
    }

    fn forward_headers(headers: &HeaderMap) -> HeaderMap {
        let mut forwarded = HeaderMap::new();
        for (name, value) in headers {
            if !is_hop_by_hop(name) {
                forwarded.append(name.clone(), value.clone());
            }
        }
        forwarded
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &InterceptedRequest) -> Result<ResponseSnapshot> {
        debug!("Fetching from network: method={}, url={}", request.method, request.url);

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(Self::forward_headers(&request.headers));
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            warn!("Network request failed for url={}: {}", request.url, e);
            OfflineError::from(e)
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response.bytes().await.map_err(|e| {
            warn!("Failed to read response body for url={}: {}", request.url, e);
            OfflineError::from(e)
        })?;

        debug!(
            "Network response: url={}, status={}, size={}",
            request.url,
            status,
            body.len()
        );

        Ok(ResponseSnapshot {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_fetcher_creation() {
        assert!(HttpFetcher::new().is_ok());
        assert!(HttpFetcher::with_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_forward_headers_drops_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("127.0.0.1:8080"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("accept", HeaderValue::from_static("text/html"));
        headers.insert("x-csrftoken", HeaderValue::from_static("abc"));

        let forwarded = HttpFetcher::forward_headers(&headers);
        assert!(forwarded.get("host").is_none());
        assert!(forwarded.get("connection").is_none());
        assert_eq!(forwarded.get("accept").unwrap(), "text/html");
        assert_eq!(forwarded.get("x-csrftoken").unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_transport_error() {
        // Bind then drop a listener so the port is known to refuse connections
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let fetcher = HttpFetcher::with_timeout(Duration::from_secs(2)).unwrap();
        let request = InterceptedRequest::get(&format!("http://{}/api/ordini/", addr)).unwrap();
        let err = fetcher.fetch(&request).await.unwrap_err();
        assert!(err.is_transport());
    }
}
