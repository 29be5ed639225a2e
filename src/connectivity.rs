//! Origin connectivity monitor
//!
//! Probes the origin periodically and fires a background sync when the
//! connection comes back. The origin counts as offline until the first probe
//! answers, so operations persisted by an earlier process are replayed as soon
//! as the origin is reachable.

use crate::error::Result;
use crate::fetcher::Fetcher;
use crate::models::InterceptedRequest;
use crate::worker::{EventOutcome, OfflineRuntime, WorkerEvent};
use http::Method;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Reachability of the origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Connectivity::Online => "online",
            Connectivity::Offline => "offline",
        }
    }
}

/// Watches the origin and triggers sync on an offline → online transition
pub struct ConnectivityMonitor {
    runtime: Arc<OfflineRuntime>,
    fetcher: Arc<dyn Fetcher>,
    probe_url: Url,
    interval: Duration,
    sync_tag: String,
    status: RwLock<Connectivity>,
}

impl ConnectivityMonitor {
    /// Create a new monitor
    ///
    /// # Arguments
    /// * `runtime` - Runtime receiving the sync events
    /// * `fetcher` - Network access used for probes
    /// * `probe_url` - URL probed with `HEAD`
    /// * `interval` - Time between probes
    /// * `sync_tag` - Tag of the sync event fired when the origin comes back
    pub fn new(
        runtime: Arc<OfflineRuntime>,
        fetcher: Arc<dyn Fetcher>,
        probe_url: Url,
        interval: Duration,
        sync_tag: impl Into<String>,
    ) -> Self {
        ConnectivityMonitor {
            runtime,
            fetcher,
            probe_url,
            interval,
            sync_tag: sync_tag.into(),
            status: RwLock::new(Connectivity::Offline),
        }
    }

    /// Last observed connectivity
    pub async fn status(&self) -> Connectivity {
        *self.status.read().await
    }

    /// Probe the origin once
    ///
    /// Any HTTP answer counts as online; only a transport failure is offline.
    pub async fn probe(&self) -> Connectivity {
        let request = match InterceptedRequest::new(Method::HEAD, self.probe_url.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!("Invalid probe URL {}: {}", self.probe_url, e);
                return Connectivity::Offline;
            }
        };
        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                debug!("Probe answered with status {}", response.status);
                Connectivity::Online
            }
            Err(e) => {
                debug!("Probe failed: {}", e);
                Connectivity::Offline
            }
        }
    }

    /// Probe and record the result
    ///
    /// Returns the sync outcome when this check observed the origin coming back.
    pub async fn check(&self) -> Result<Option<EventOutcome>> {
        let current = self.probe().await;
        let previous = {
            let mut status = self.status.write().await;
            std::mem::replace(&mut *status, current)
        };

        if previous == current {
            return Ok(None);
        }
        info!(
            "Origin connectivity changed: {} -> {}",
            previous.as_str(),
            current.as_str()
        );

        if current == Connectivity::Online {
            let outcome = self
                .runtime
                .dispatch(WorkerEvent::Sync {
                    tag: self.sync_tag.clone(),
                })
                .await?;
            return Ok(Some(outcome));
        }
        Ok(None)
    }

    /// Check the origin forever at the configured interval
    pub async fn run(self: Arc<Self>) {
        info!(
            "Connectivity monitor probing {} every {:?}",
            self.probe_url, self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.check().await {
                warn!("Sync after reconnect failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::MemoryCacheStore;
    use crate::error::OfflineError;
    use crate::metrics::OfflineMetrics;
    use crate::models::{PendingOperation, ResponseSnapshot};
    use crate::sync_queue::SyncQueue;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Switch {
        online: AtomicBool,
    }

    #[async_trait]
    impl Fetcher for Switch {
        async fn fetch(&self, _request: &InterceptedRequest) -> Result<ResponseSnapshot> {
            if self.online.load(Ordering::SeqCst) {
                Ok(ResponseSnapshot::new(200, ""))
            } else {
                Err(OfflineError::Transport("offline".to_string()))
            }
        }
    }

    fn monitor(switch: Arc<Switch>) -> (ConnectivityMonitor, Arc<SyncQueue>) {
        let origin = Url::parse("http://localhost").unwrap();
        let metrics = OfflineMetrics::new().unwrap();
        let queue = Arc::new(SyncQueue::in_memory(
            switch.clone(),
            origin.clone(),
            "background-sync",
            metrics.clone(),
        ));
        let runtime = Arc::new(OfflineRuntime::new(
            Arc::new(MemoryCacheStore::new()),
            switch.clone(),
            queue.clone(),
            metrics,
        ));
        let monitor = ConnectivityMonitor::new(
            runtime,
            switch,
            origin,
            Duration::from_secs(15),
            "background-sync",
        );
        (monitor, queue)
    }

    #[tokio::test]
    async fn test_reconnect_triggers_sync() {
        let switch = Arc::new(Switch {
            online: AtomicBool::new(false),
        });
        let (monitor, queue) = monitor(switch.clone());
        queue
            .enqueue(PendingOperation::new("/api/ordini/", serde_json::json!({"n": 1})))
            .await
            .unwrap();

        assert!(monitor.check().await.unwrap().is_none());
        assert_eq!(monitor.status().await, Connectivity::Offline);
        assert_eq!(queue.len().await, 1);

        switch.online.store(true, Ordering::SeqCst);
        let outcome = monitor.check().await.unwrap();
        assert!(matches!(outcome, Some(EventOutcome::Synced(Some(_)))));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_first_successful_probe_replays_pending() {
        let switch = Arc::new(Switch {
            online: AtomicBool::new(true),
        });
        let (monitor, queue) = monitor(switch);
        queue
            .enqueue(PendingOperation::new("/api/ordini/", serde_json::json!({"n": 1})))
            .await
            .unwrap();

        let outcome = monitor.check().await.unwrap();
        assert!(matches!(outcome, Some(EventOutcome::Synced(Some(_)))));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_steady_state_does_nothing() {
        let switch = Arc::new(Switch {
            online: AtomicBool::new(true),
        });
        let (monitor, _) = monitor(switch);
        assert!(monitor.check().await.unwrap().is_some());
        assert!(monitor.check().await.unwrap().is_none());
        assert!(monitor.check().await.unwrap().is_none());
        assert_eq!(monitor.status().await, Connectivity::Online);
    }
}
