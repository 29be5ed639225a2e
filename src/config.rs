//! Configuration management for the offline cache engine

use crate::error::{OfflineError, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Configuration for one cache generation of the offline engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfflineConfig {
    /// Prefix shared by every partition name (default: "autolavaggio")
    #[serde(default = "default_cache_prefix")]
    pub cache_prefix: String,

    /// Cache generation tag embedded in the primary partition name (default: "v1")
    #[serde(default = "default_generation")]
    pub generation: String,

    /// Revision of the offline-fallback partition (default: "v1").
    /// Kept apart from `generation` so that generation rotation never evicts it.
    #[serde(default = "default_generation")]
    pub offline_revision: String,

    /// Origin of the web application; relative URLs are resolved against it
    #[serde(default = "default_origin")]
    pub origin: String,

    /// Address the HTTP front listens on (default: "127.0.0.1:8080")
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// URLs fetched and stored at install time (absolute or origin-relative)
    #[serde(default = "default_precache_urls")]
    pub precache_urls: Vec<String>,

    /// Path of the offline fallback page (default: "/offline.html")
    #[serde(default = "default_offline_page")]
    pub offline_page: String,

    /// Promote a freshly installed generation without waiting for clients (default: true)
    #[serde(default = "default_true")]
    pub skip_waiting_on_install: bool,

    /// Network fetch timeout in seconds (default: 30)
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Directory of the on-disk cache store; memory-only when unset
    #[serde(default)]
    pub cache_dir: Option<String>,

    /// Path prefix of the control channel on the HTTP front (default: "/__washcache")
    #[serde(default = "default_control_path")]
    pub control_path: String,

    /// Request classification rules
    #[serde(default)]
    pub classification: ClassificationRules,

    /// Background sync settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Connectivity probing settings
    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    /// Metrics endpoint configuration (optional)
    #[serde(default)]
    pub metrics_endpoint: Option<MetricsEndpointConfig>,
}

/// Rules used by the resource classifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationRules {
    /// Path prefix of API requests (default: "/api/")
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// File extensions of static resources, with the leading dot
    #[serde(default = "default_static_extensions")]
    pub static_extensions: Vec<String>,

    /// Path prefixes of static resources (default: ["/static/"])
    #[serde(default = "default_static_prefixes")]
    pub static_prefixes: Vec<String>,

    /// Hostname substrings identifying CDN hosts (default: ["cdn."])
    #[serde(default = "default_cdn_host_patterns")]
    pub cdn_host_patterns: Vec<String>,
}

/// Background sync configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Tag a sync trigger must carry to drain the queue (default: "background-sync")
    #[serde(default = "default_sync_tag")]
    pub tag: String,

    /// Endpoint pending operations are replayed against (default: "/api/ordini/")
    #[serde(default = "default_sync_endpoint")]
    pub endpoint: String,

    /// Paths whose unsafe requests are deferred when offline
    #[serde(default = "default_deferrable_paths")]
    pub deferrable_paths: Vec<String>,

    /// JSON file persisting the queue; memory-only when unset
    #[serde(default)]
    pub queue_path: Option<String>,
}

/// Connectivity monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectivityConfig {
    /// Whether to probe the origin periodically (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path probed with a HEAD request (default: "/")
    #[serde(default = "default_probe_path")]
    pub probe_path: String,

    /// Seconds between probes (default: 15)
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
}

/// Configuration for the metrics HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEndpointConfig {
    /// Whether to enable the metrics endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics endpoint to (default: "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

// Default value functions for serde
fn default_cache_prefix() -> String {
    "autolavaggio".to_string()
}

fn default_generation() -> String {
    "v1".to_string()
}

fn default_origin() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_listen_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_precache_urls() -> Vec<String> {
    vec![
        "/".to_string(),
        "/ordini/cassa/mobile/".to_string(),
        "/static/manifest.json".to_string(),
        "/static/css/bootstrap.min.css".to_string(),
        "/static/js/bootstrap.bundle.min.js".to_string(),
        "https://cdn.jsdelivr.net/npm/bootstrap@5.3.0/dist/css/bootstrap.min.css".to_string(),
        "https://cdn.jsdelivr.net/npm/bootstrap-icons@1.10.0/font/bootstrap-icons.css"
            .to_string(),
    ]
}

fn default_offline_page() -> String {
    "/offline.html".to_string()
}

fn default_true() -> bool {
    true
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_control_path() -> String {
    "/__washcache".to_string()
}

fn default_api_prefix() -> String {
    "/api/".to_string()
}

fn default_static_extensions() -> Vec<String> {
    [
        ".css", ".js", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".woff", ".woff2",
    ]
    .iter()
    .map(|ext| ext.to_string())
    .collect()
}

fn default_static_prefixes() -> Vec<String> {
    vec!["/static/".to_string()]
}

fn default_cdn_host_patterns() -> Vec<String> {
    vec!["cdn.".to_string()]
}

fn default_sync_tag() -> String {
    "background-sync".to_string()
}

fn default_sync_endpoint() -> String {
    "/api/ordini/".to_string()
}

fn default_deferrable_paths() -> Vec<String> {
    vec!["/api/ordini/".to_string()]
}

fn default_probe_path() -> String {
    "/".to_string()
}

fn default_probe_interval() -> u64 {
    15
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for ClassificationRules {
    fn default() -> Self {
        Self {
            api_prefix: default_api_prefix(),
            static_extensions: default_static_extensions(),
            static_prefixes: default_static_prefixes(),
            cdn_host_patterns: default_cdn_host_patterns(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tag: default_sync_tag(),
            endpoint: default_sync_endpoint(),
            deferrable_paths: default_deferrable_paths(),
            queue_path: None,
        }
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            probe_path: default_probe_path(),
            interval_secs: default_probe_interval(),
        }
    }
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl Default for OfflineConfig {
    fn default() -> Self {
        OfflineConfig {
            cache_prefix: default_cache_prefix(),
            generation: default_generation(),
            offline_revision: default_generation(),
            origin: default_origin(),
            listen_address: default_listen_address(),
            precache_urls: default_precache_urls(),
            offline_page: default_offline_page(),
            skip_waiting_on_install: default_true(),
            fetch_timeout_secs: default_fetch_timeout(),
            cache_dir: None,
            control_path: default_control_path(),
            classification: ClassificationRules::default(),
            sync: SyncConfig::default(),
            connectivity: ConnectivityConfig::default(),
            metrics_endpoint: None,
        }
    }
}

impl OfflineConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(OfflineConfig)` if loading and validation succeed
    /// * `Err(OfflineError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            OfflineError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let config: OfflineConfig = serde_yaml::from_str(&content).map_err(|e| {
            OfflineError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - cache_prefix, generation and offline_revision must be non-empty and contain no '/'
    /// - origin must be an absolute http(s) URL
    /// - primary and offline partition names must differ
    /// - offline_page, api_prefix and control_path must be absolute paths
    /// - fetch_timeout_secs must be > 0
    /// - static extensions must start with '.'
    /// - sync tag and endpoint must be non-empty
    /// - metrics address must parse when the endpoint is enabled
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("cache_prefix", &self.cache_prefix),
            ("generation", &self.generation),
            ("offline_revision", &self.offline_revision),
        ] {
            if value.is_empty() || value.contains('/') {
                return Err(OfflineError::ConfigError(format!(
                    "{} must be non-empty and must not contain '/', got '{}'",
                    field, value
                )));
            }
        }

        self.origin_url()?;

        if self.primary_cache_name() == self.offline_cache_name() {
            return Err(OfflineError::ConfigError(format!(
                "primary and offline partitions must have distinct names, both are '{}'",
                self.primary_cache_name()
            )));
        }

        for (field, value) in [
            ("offline_page", &self.offline_page),
            ("classification.api_prefix", &self.classification.api_prefix),
            ("control_path", &self.control_path),
        ] {
            if !value.starts_with('/') {
                return Err(OfflineError::ConfigError(format!(
                    "{} must start with '/', got '{}'",
                    field, value
                )));
            }
        }

        if self.fetch_timeout_secs == 0 {
            return Err(OfflineError::ConfigError(
                "fetch_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if let Some(ext) = self
            .classification
            .static_extensions
            .iter()
            .find(|ext| !ext.starts_with('.'))
        {
            return Err(OfflineError::ConfigError(format!(
                "static extension '{}' must start with '.'",
                ext
            )));
        }

        if self.sync.tag.is_empty() {
            return Err(OfflineError::ConfigError(
                "sync.tag must not be empty".to_string(),
            ));
        }

        if self.sync.endpoint.is_empty() {
            return Err(OfflineError::ConfigError(
                "sync.endpoint must not be empty".to_string(),
            ));
        }

        if self.connectivity.enabled && self.connectivity.interval_secs == 0 {
            return Err(OfflineError::ConfigError(
                "connectivity.interval_secs must be greater than 0".to_string(),
            ));
        }

        if let Some(ref endpoint) = self.metrics_endpoint {
            if endpoint.enabled && endpoint.address.parse::<SocketAddr>().is_err() {
                return Err(OfflineError::ConfigError(format!(
                    "Invalid metrics_endpoint address '{}'",
                    endpoint.address
                )));
            }
        }

        Ok(())
    }

    /// Name of the primary partition of this generation
    pub fn primary_cache_name(&self) -> String {
        format!("{}-cache-{}", self.cache_prefix, self.generation)
    }

    /// Name of the offline-fallback partition
    pub fn offline_cache_name(&self) -> String {
        format!("{}-offline-{}", self.cache_prefix, self.offline_revision)
    }

    /// Parsed origin URL
    pub fn origin_url(&self) -> Result<Url> {
        let url = Url::parse(&self.origin)
            .map_err(|e| OfflineError::ConfigError(format!("Invalid origin '{}': {}", self.origin, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(OfflineError::ConfigError(format!(
                "origin must be an http(s) URL, got '{}'",
                self.origin
            )));
        }
        Ok(url)
    }

    /// Resolve an absolute or origin-relative URL
    pub fn resolve(&self, url: &str) -> Result<Url> {
        self.origin_url()?
            .join(url)
            .map_err(|e| OfflineError::InvalidUrl(format!("{}: {}", url, e)))
    }

    /// Network fetch timeout
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Update configuration from another config
    ///
    /// Applies every field of `new_config` and reports what changed. Changes that
    /// alter what gets seeded (see [`ConfigChanges::requires_reinstall`]) only take
    /// effect once a new generation is installed with the updated config.
    ///
    /// # Returns
    /// * `Ok(ConfigChanges)` - Description of what changed
    /// * `Err(OfflineError)` - If the new configuration is invalid
    pub fn update_from(&mut self, new_config: &OfflineConfig) -> Result<ConfigChanges> {
        new_config.validate()?;

        let changes = ConfigChanges {
            generation_changed: self.cache_prefix != new_config.cache_prefix
                || self.generation != new_config.generation,
            offline_changed: self.offline_revision != new_config.offline_revision
                || self.offline_page != new_config.offline_page,
            origin_changed: self.origin != new_config.origin,
            precache_changed: self.precache_urls != new_config.precache_urls,
            classification_changed: self.classification != new_config.classification,
            sync_changed: self.sync != new_config.sync,
            fetch_timeout_changed: self.fetch_timeout_secs != new_config.fetch_timeout_secs,
            connectivity_changed: self.connectivity != new_config.connectivity,
            metrics_endpoint_changed: self.metrics_endpoint != new_config.metrics_endpoint,
        };

        *self = new_config.clone();
        Ok(changes)
    }

    /// Reload configuration from file and apply changes
    pub fn reload_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<ConfigChanges> {
        let new_config = Self::from_file(path)?;
        self.update_from(&new_config)
    }
}

/// Description of configuration changes after hot reload
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigChanges {
    pub generation_changed: bool,
    pub offline_changed: bool,
    pub origin_changed: bool,
    pub precache_changed: bool,
    pub classification_changed: bool,
    pub sync_changed: bool,
    pub fetch_timeout_changed: bool,
    pub connectivity_changed: bool,
    pub metrics_endpoint_changed: bool,
}

impl ConfigChanges {
    /// Check if any changes were made
    pub fn has_changes(&self) -> bool {
        !self.summary().is_empty()
    }

    /// Check if the change needs a new generation to be installed
    pub fn requires_reinstall(&self) -> bool {
        self.generation_changed
            || self.offline_changed
            || self.origin_changed
            || self.precache_changed
    }

    /// Get a summary of changes
    pub fn summary(&self) -> Vec<&'static str> {
        [
            (self.generation_changed, "generation"),
            (self.offline_changed, "offline_page"),
            (self.origin_changed, "origin"),
            (self.precache_changed, "precache_urls"),
            (self.classification_changed, "classification"),
            (self.sync_changed, "sync"),
            (self.fetch_timeout_changed, "fetch_timeout_secs"),
            (self.connectivity_changed, "connectivity"),
            (self.metrics_endpoint_changed, "metrics_endpoint"),
        ]
        .into_iter()
        .filter_map(|(changed, name)| changed.then_some(name))
        .collect()
    }
}
