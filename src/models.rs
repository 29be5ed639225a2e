//! Core data models for the offline cache engine

use crate::error::{OfflineError, Result};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use http::Method;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A request intercepted on its way to the origin
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl InterceptedRequest {
    /// Create a new request
    ///
    /// # Returns
    /// * `Ok(InterceptedRequest)` for http and https URLs
    /// * `Err(OfflineError::InvalidUrl)` for any other scheme
    pub fn new(method: Method, url: Url) -> Result<Self> {
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(OfflineError::InvalidUrl(format!(
                "only http(s) requests can be intercepted, got {}",
                url
            )));
        }
        Ok(InterceptedRequest {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        })
    }

    /// Create a GET request for an absolute URL
    pub fn get(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| OfflineError::InvalidUrl(format!("{}: {}", url, e)))?;
        Self::new(Method::GET, url)
    }

    /// Set the Accept header
    pub fn accepting(mut self, accept: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(accept) {
            self.headers.insert(ACCEPT, value);
        }
        self
    }

    /// Attach a request body
    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.headers.insert(CONTENT_TYPE, value);
        }
        self.body = Some(body.into());
        self
    }

    /// Whether the declared Accept header asks for HTML
    pub fn accepts_html(&self) -> bool {
        self.headers
            .get_all(ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.contains("text/html"))
    }

    /// Whether the method is safe to serve from cache
    pub fn is_safe_method(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }

    /// Canonical cache key: the absolute URL without fragment
    pub fn cache_key(&self) -> String {
        cache_key_for(&self.url)
    }

    /// Path component of the URL
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Path and query, as sent in an origin-form request line
    pub fn target(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }
}

/// Point a request target (`/path?query`) at the origin
///
/// The target only replaces path and query, so a target such as
/// `//other.host/x` stays on the origin's host instead of being read as a
/// scheme-relative URL.
pub fn origin_target(origin: &Url, target: &str) -> Url {
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };
    let mut url = origin.clone();
    url.set_path(path);
    url.set_query(query);
    url.set_fragment(None);
    url
}

/// Cache key for a URL
pub fn cache_key_for(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}

/// Captured response: status, headers and body bytes
///
/// Used both for live network responses and for cache entries, so a stored
/// entry is byte-identical to the response it was captured from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ResponseSnapshot {
    /// Create a response with no headers
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        ResponseSnapshot {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Build a JSON response
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string()).with_header("content-type", "application/json")
    }

    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First header value with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Policy category assigned to a request by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceCategory {
    Api,
    Static,
    HtmlNavigation,
    Other,
}

impl ResourceCategory {
    /// Strategy that serves this category
    pub fn strategy(&self) -> Strategy {
        match self {
            ResourceCategory::Static => Strategy::CacheFirst,
            ResourceCategory::HtmlNavigation => Strategy::StaleWhileRevalidate,
            ResourceCategory::Api | ResourceCategory::Other => Strategy::NetworkFirst,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceCategory::Api => "api",
            ResourceCategory::Static => "static",
            ResourceCategory::HtmlNavigation => "html_navigation",
            ResourceCategory::Other => "other",
        }
    }
}

/// Caching policy applied to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::CacheFirst => "cache_first",
            Strategy::NetworkFirst => "network_first",
            Strategy::StaleWhileRevalidate => "stale_while_revalidate",
        }
    }
}

/// Where a served response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseSource {
    /// Live response from the network
    Network,
    /// Entry from the primary partition
    Cache,
    /// The offline fallback page
    OfflinePage,
    /// Synthesized 503 body
    Synthesized,
    /// Unsafe request queued for background sync
    Deferred,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSource::Network => "network",
            ResponseSource::Cache => "cache",
            ResponseSource::OfflinePage => "offline_page",
            ResponseSource::Synthesized => "synthesized",
            ResponseSource::Deferred => "deferred",
        }
    }
}

static OPERATION_SEQ: AtomicU64 = AtomicU64::new(0);

/// A state-changing request recorded while offline, replayed by background sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Unique id
    pub id: String,
    /// Origin request target (path and optional query) the payload is POSTed to
    pub endpoint: String,
    /// JSON payload of the operation
    pub payload: serde_json::Value,
    /// Creation time in unix milliseconds
    pub created_at: u64,
    /// Completed replay attempts
    #[serde(default)]
    pub attempts: u32,
}

impl PendingOperation {
    /// Create a new operation with a fresh id
    pub fn new(endpoint: impl Into<String>, payload: serde_json::Value) -> Self {
        let created_at = now_millis();
        let seq = OPERATION_SEQ.fetch_add(1, Ordering::Relaxed);
        PendingOperation {
            id: format!("op-{:x}-{:04x}", created_at, seq),
            endpoint: endpoint.into(),
            payload,
            created_at,
            attempts: 0,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
