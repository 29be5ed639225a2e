//! Background sync queue
//!
//! State-changing operations recorded while offline are kept in a FIFO queue and
//! replayed when a sync trigger with the configured tag arrives. A replay that
//! answers 2xx removes the operation; anything else leaves it queued for the
//! next trigger.
//!
//! With a queue path configured the queue is stored as a JSON array. Every
//! change rewrites the whole file through a temporary file in the same
//! directory followed by a rename.

use crate::error::{OfflineError, Result};
use crate::fetcher::Fetcher;
use crate::metrics::OfflineMetrics;
use crate::models::{origin_target, InterceptedRequest, PendingOperation};
use http::Method;
use reqwest::Url;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of one sync run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub attempted: usize,
    pub replayed: usize,
    pub failed: usize,
    /// Operations still queued after the run
    pub remaining: usize,
}

/// Persisted FIFO of pending operations
pub struct SyncQueue {
    path: Option<PathBuf>,
    operations: Mutex<Vec<PendingOperation>>,
    // Held for the duration of a run so runs never overlap
    run_lock: Mutex<()>,
    fetcher: Arc<dyn Fetcher>,
    origin: Url,
    tag: String,
    metrics: OfflineMetrics,
}

impl SyncQueue {
    /// Create a queue kept only in memory
    pub fn in_memory(
        fetcher: Arc<dyn Fetcher>,
        origin: Url,
        tag: impl Into<String>,
        metrics: OfflineMetrics,
    ) -> Self {
        SyncQueue {
            path: None,
            operations: Mutex::new(Vec::new()),
            run_lock: Mutex::new(()),
            fetcher,
            origin,
            tag: tag.into(),
            metrics,
        }
    }

    /// Open a queue persisted at `path`, loading any operations already stored
    pub async fn open(
        path: impl AsRef<Path>,
        fetcher: Arc<dyn Fetcher>,
        origin: Url,
        tag: impl Into<String>,
        metrics: OfflineMetrics,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let operations: Vec<PendingOperation> = match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!("Opened sync queue at {:?} ({} pending)", path, operations.len());
        metrics.set_queue_depth(operations.len());

        Ok(SyncQueue {
            path: Some(path),
            operations: Mutex::new(operations),
            run_lock: Mutex::new(()),
            fetcher,
            origin,
            tag: tag.into(),
            metrics,
        })
    }

    /// Tag a sync trigger must carry to start a run
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Append an operation to the end of the queue
    pub async fn enqueue(&self, operation: PendingOperation) -> Result<()> {
        let mut operations = self.operations.lock().await;
        operations.push(operation);
        if let Err(e) = self.persist(&operations).await {
            operations.pop();
            return Err(e);
        }
        if let Some(op) = operations.last() {
            info!("Queued pending operation: id={}, endpoint={}", op.id, op.endpoint);
        }
        self.metrics.set_queue_depth(operations.len());
        Ok(())
    }

    /// Copy of the queued operations in FIFO order
    pub async fn pending(&self) -> Vec<PendingOperation> {
        self.operations.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.operations.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Replay the queue for a sync trigger
    ///
    /// # Returns
    /// * `Ok(None)` if the tag does not match or a run is already in progress
    /// * `Ok(Some(report))` after a completed run
    pub async fn run(&self, tag: &str) -> Result<Option<SyncReport>> {
        if tag != self.tag {
            debug!("Ignoring sync trigger with tag {}", tag);
            return Ok(None);
        }
        let _running = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Sync run already in progress, skipping trigger");
                return Ok(None);
            }
        };

        let snapshot = self.pending().await;
        let mut report = SyncReport {
            attempted: snapshot.len(),
            ..SyncReport::default()
        };
        if !snapshot.is_empty() {
            info!("Starting sync run: {} pending operations", snapshot.len());
        }

        let mut persist_failed = false;
        for operation in snapshot {
            let persisted = match self.replay(&operation).await {
                Ok(()) => {
                    self.metrics.record_replay(true);
                    report.replayed += 1;
                    self.remove(&operation.id).await
                }
                Err(e) => {
                    warn!("{}", e);
                    self.metrics.record_replay(false);
                    report.failed += 1;
                    self.bump_attempts(&operation.id).await
                }
            };
            if let Err(e) = persisted {
                warn!("Failed to persist sync queue after {}: {}", operation.id, e);
                persist_failed = true;
            }
        }

        // Bring the file back in line with memory once the run is over
        if persist_failed {
            let operations = self.operations.lock().await;
            self.persist(&operations).await?;
        }

        report.remaining = self.len().await;
        info!(
            "Sync run finished: replayed={}, failed={}, remaining={}",
            report.replayed, report.failed, report.remaining
        );
        Ok(Some(report))
    }

    /// POST one operation to its endpoint
    async fn replay(&self, operation: &PendingOperation) -> Result<()> {
        let url = origin_target(&self.origin, &operation.endpoint);
        let body = serde_json::to_vec(&operation.payload)?;
        let request = InterceptedRequest::new(Method::POST, url)?.with_body("application/json", body);

        debug!("Replaying pending operation: id={}, url={}", operation.id, request.url);
        let response = self
            .fetcher
            .fetch(&request)
            .await
            .map_err(|e| OfflineError::replay_failed(&operation.id, e.to_string()))?;

        if response.is_success() {
            Ok(())
        } else {
            Err(OfflineError::replay_failed(
                &operation.id,
                format!("status {}", response.status),
            ))
        }
    }

    /// Drop an operation from memory, then rewrite the file
    async fn remove(&self, id: &str) -> Result<()> {
        let mut operations = self.operations.lock().await;
        operations.retain(|op| op.id != id);
        self.metrics.set_queue_depth(operations.len());
        self.persist(&operations).await
    }

    async fn bump_attempts(&self, id: &str) -> Result<()> {
        let mut operations = self.operations.lock().await;
        if let Some(op) = operations.iter_mut().find(|op| op.id == id) {
            op.attempts += 1;
        }
        self.persist(&operations).await
    }

    async fn persist(&self, operations: &[PendingOperation]) -> Result<()> {
        let path = match self.path {
            Some(ref path) => path.clone(),
            None => return Ok(()),
        };
        let data = serde_json::to_vec_pretty(operations)?;
        tokio::task::spawn_blocking(move || write_queue_file(&path, &data))
            .await
            .map_err(|e| OfflineError::IoError(format!("queue writer task failed: {}", e)))?
    }
}

fn write_queue_file(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| OfflineError::IoError(format!("Failed to persist {}: {}", path.display(), e)))?;
    Ok(())
}
