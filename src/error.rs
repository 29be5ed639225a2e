//! Error types for the offline cache engine

use thiserror::Error;

/// Result type alias for offline cache operations
pub type Result<T> = std::result::Result<T, OfflineError>;

/// Error types that can occur in the offline cache engine
#[derive(Error, Debug, Clone)]
pub enum OfflineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Network unreachable: {0}")]
    Transport(String),

    #[error("Network timeout: {0}")]
    Timeout(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Seeding failed for {url}: {reason}")]
    SeedingFailed { url: String, reason: String },

    #[error("Offline page missing from partition {0}")]
    MissingOfflinePage(String),

    #[error("Replay of pending operation {id} failed: {reason}")]
    ReplayFailed { id: String, reason: String },

    #[error("Invalid lifecycle state: {0}")]
    InvalidState(String),

    #[error("No active generation is installed")]
    NotInstalled,
}

impl From<std::io::Error> for OfflineError {
    fn from(err: std::io::Error) -> Self {
        OfflineError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for OfflineError {
    fn from(err: serde_json::Error) -> Self {
        OfflineError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for OfflineError {
    fn from(err: serde_yaml::Error) -> Self {
        OfflineError::ConfigError(err.to_string())
    }
}

impl From<bincode::Error> for OfflineError {
    fn from(err: bincode::Error) -> Self {
        OfflineError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for OfflineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OfflineError::Timeout(err.to_string())
        } else {
            OfflineError::Transport(err.to_string())
        }
    }
}

impl OfflineError {
    /// Whether this error means the network could not be reached at all.
    ///
    /// Only transport-level failures make the strategies fall back to the cache.
    /// A reachable server answering 4xx/5xx is never reported as an error.
    pub fn is_transport(&self) -> bool {
        matches!(self, OfflineError::Transport(_) | OfflineError::Timeout(_))
    }

    /// Map the error to an HTTP status code for responses synthesized by the front
    pub fn to_http_status(&self) -> u16 {
        match self {
            OfflineError::Transport(_) => 503,
            OfflineError::Timeout(_) => 504,
            OfflineError::InvalidUrl(_) => 400,
            OfflineError::SeedingFailed { .. } => 502,
            OfflineError::ReplayFailed { .. } => 502,
            OfflineError::NotInstalled => 503,
            OfflineError::InvalidState(_) => 409,
            OfflineError::ConfigError(_)
            | OfflineError::CacheError(_)
            | OfflineError::IoError(_)
            | OfflineError::Serialization(_)
            | OfflineError::MissingOfflinePage(_) => 500,
        }
    }

    /// Build a seeding failure for the given URL
    pub fn seeding_failed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        OfflineError::SeedingFailed {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Build a replay failure for the given pending operation id
    pub fn replay_failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        OfflineError::ReplayFailed {
            id: id.into(),
            reason: reason.into(),
        }
    }
}
