//! On-disk cache store
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/partitions.json          partition names in creation order
//! <base>/<partition>/<xxh3>.entry bincode-encoded key + response
//! ```
//!
//! Each entry is written to a temporary file and renamed into place, so a reader
//! sees either the previous entry or the new one, never a torn write.

use crate::cache_store::CacheStore;
use crate::error::{OfflineError, Result};
use crate::models::ResponseSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

const INDEX_FILE: &str = "partitions.json";
const ENTRY_EXTENSION: &str = "entry";

#[derive(Serialize, Deserialize)]
struct DiskEntry {
    key: String,
    response: ResponseSnapshot,
}

/// Cache store persisting partitions under a directory
pub struct DiskCacheStore {
    base_path: PathBuf,
    // Serializes read-modify-write cycles of the partition index
    index_lock: Mutex<()>,
}

impl DiskCacheStore {
    /// Open (or create) a store rooted at `base_path`
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await.map_err(|e| {
            OfflineError::CacheError(format!(
                "Failed to create cache directory {}: {}",
                base_path.display(),
                e
            ))
        })?;
        info!("Opened disk cache store at {:?}", base_path);
        Ok(DiskCacheStore {
            base_path,
            index_lock: Mutex::new(()),
        })
    }

    fn validate_partition(partition: &str) -> Result<()> {
        if partition.is_empty()
            || partition.starts_with('.')
            || partition.contains('/')
            || partition.contains('\\')
            || partition == INDEX_FILE
        {
            return Err(OfflineError::CacheError(format!(
                "Invalid partition name '{}'",
                partition
            )));
        }
        Ok(())
    }

    fn partition_path(&self, partition: &str) -> PathBuf {
        self.base_path.join(partition)
    }

    fn entry_path(&self, partition: &str, key: &str) -> PathBuf {
        self.partition_path(partition)
            .join(format!("{:016x}.{}", xxh3_64(key.as_bytes()), ENTRY_EXTENSION))
    }

    async fn read_index(&self) -> Result<Vec<String>> {
        match fs::read(self.base_path.join(INDEX_FILE)).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_index(&self, names: &[String]) -> Result<()> {
        let data = serde_json::to_vec(names)?;
        write_atomic(&self.base_path.join(INDEX_FILE), &data).await
    }

    async fn read_entry(path: &Path) -> Result<Option<DiskEntry>> {
        match fs::read(path).await {
            Ok(data) => match bincode::deserialize::<DiskEntry>(&data) {
                Ok(entry) => Ok(Some(entry)),
                Err(e) => {
                    warn!("Discarding unreadable cache entry {}: {}", path.display(), e);
                    let _ = fs::remove_file(path).await;
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp_path = path.with_extension(format!("{}.tmp", seq));
    fs::write(&tmp_path, data).await.map_err(|e| {
        OfflineError::CacheError(format!("Failed to write {}: {}", tmp_path.display(), e))
    })?;
    fs::rename(&tmp_path, path).await.map_err(|e| {
        OfflineError::CacheError(format!("Failed to rename {}: {}", tmp_path.display(), e))
    })?;
    Ok(())
}

#[async_trait]
impl CacheStore for DiskCacheStore {
    async fn open(&self, partition: &str) -> Result<()> {
        Self::validate_partition(partition)?;
        let _guard = self.index_lock.lock().await;

        fs::create_dir_all(self.partition_path(partition)).await?;
        let mut names = self.read_index().await?;
        if !names.iter().any(|n| n == partition) {
            debug!("Creating partition on disk: {}", partition);
            names.push(partition.to_string());
            self.write_index(&names).await?;
        }
        Ok(())
    }

    async fn has_partition(&self, partition: &str) -> Result<bool> {
        Ok(self.read_index().await?.iter().any(|n| n == partition))
    }

    async fn partitions(&self) -> Result<Vec<String>> {
        self.read_index().await
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool> {
        Self::validate_partition(partition)?;
        let _guard = self.index_lock.lock().await;

        let mut names = self.read_index().await?;
        let existed = names.iter().any(|n| n == partition);
        if existed {
            names.retain(|n| n != partition);
            self.write_index(&names).await?;
        }

        match fs::remove_dir_all(self.partition_path(partition)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to remove partition directory {}: {}", partition, e);
            }
        }
        Ok(existed)
    }

    async fn get(&self, partition: &str, key: &str) -> Result<Option<ResponseSnapshot>> {
        Self::validate_partition(partition)?;
        let path = self.entry_path(partition, key);
        match Self::read_entry(&path).await? {
            Some(entry) if entry.key == key => {
                debug!("Disk cache hit: partition={}, key={}", partition, key);
                Ok(Some(entry.response))
            }
            Some(entry) => {
                debug!(
                    "Disk cache hash collision: partition={}, key={}, stored={}",
                    partition, key, entry.key
                );
                Ok(None)
            }
            None => {
                debug!("Disk cache miss: partition={}, key={}", partition, key);
                Ok(None)
            }
        }
    }

    async fn put(&self, partition: &str, key: &str, response: ResponseSnapshot) -> Result<()> {
        self.open(partition).await?;
        let entry = DiskEntry {
            key: key.to_string(),
            response,
        };
        let data = bincode::serialize(&entry)?;
        write_atomic(&self.entry_path(partition, key), &data).await?;
        debug!(
            "Wrote disk cache entry: partition={}, key={}, size={}",
            partition,
            key,
            data.len()
        );
        Ok(())
    }

    async fn delete(&self, partition: &str, key: &str) -> Result<bool> {
        Self::validate_partition(partition)?;
        match fs::remove_file(self.entry_path(partition, key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, partition: &str) -> Result<Vec<String>> {
        Self::validate_partition(partition)?;
        let mut dir = match fs::read_dir(self.partition_path(partition)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(dirent) = dir.next_entry().await? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            if let Some(entry) = Self::read_entry(&path).await? {
                keys.push(entry.key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn page(body: &str) -> ResponseSnapshot {
        ResponseSnapshot::new(200, body.to_string()).with_header("content-type", "text/css")
    }

    #[tokio::test]
    async fn test_put_and_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).await.unwrap();

        store.put("autolavaggio-cache-v1", "http://localhost/a.css", page("a{}")).await.unwrap();
        let cached = store.get("autolavaggio-cache-v1", "http://localhost/a.css").await.unwrap();
        assert_eq!(cached, Some(page("a{}")));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = DiskCacheStore::new(dir.path()).await.unwrap();
            store.put("p1", "k", page("x")).await.unwrap();
            store.open("p2").await.unwrap();
        }

        let store = DiskCacheStore::new(dir.path()).await.unwrap();
        assert_eq!(store.partitions().await.unwrap(), vec!["p1", "p2"]);
        assert_eq!(store.get("p1", "k").await.unwrap(), Some(page("x")));
        assert_eq!(store.keys("p1").await.unwrap(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_partition_removes_entries() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).await.unwrap();
        store.put("old", "k", page("x")).await.unwrap();

        assert!(store.delete_partition("old").await.unwrap());
        assert!(!store.has_partition("old").await.unwrap());
        assert!(store.get("old", "k").await.unwrap().is_none());
        assert!(!store.delete_partition("old").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_path_like_partition_names() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).await.unwrap();

        assert!(store.open("../escape").await.is_err());
        assert!(store.open(".hidden").await.is_err());
        assert!(store.open(INDEX_FILE).await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).await.unwrap();
        store.put("p", "k", page("x")).await.unwrap();

        fs::write(store.entry_path("p", "k"), b"garbage").await.unwrap();
        assert!(store.get("p", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_match_any_across_disk_partitions() {
        let dir = TempDir::new().unwrap();
        let store = DiskCacheStore::new(dir.path()).await.unwrap();
        store.put("offline", "http://localhost/offline.html", page("offline")).await.unwrap();
        store.open("primary").await.unwrap();

        let found = store.match_any("http://localhost/offline.html").await.unwrap();
        assert_eq!(found, Some(page("offline")));
    }
}
