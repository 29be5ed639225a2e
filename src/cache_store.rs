//! Cache store abstraction
//!
//! The store is a set of named partitions, each mapping a request key to a
//! captured [`ResponseSnapshot`]. Every operation is atomic on its own; there is
//! no transaction spanning several keys. A put for an existing key replaces the
//! previous entry (last write wins).
//!
//! Two backends are provided:
//! - [`MemoryCacheStore`]: in-process maps, used by tests and memory-only setups
//! - [`DiskCacheStore`](crate::disk_store::DiskCacheStore): one directory per partition

use crate::error::{OfflineError, Result};
use crate::models::ResponseSnapshot;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::debug;

/// Key-value store of request → response entries, partitioned by name
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Create the partition if it does not exist yet
    async fn open(&self, partition: &str) -> Result<()>;

    /// Whether the partition exists
    async fn has_partition(&self, partition: &str) -> Result<bool>;

    /// Names of all partitions, in creation order
    async fn partitions(&self) -> Result<Vec<String>>;

    /// Delete a partition and every entry in it
    ///
    /// Returns `true` if the partition existed.
    async fn delete_partition(&self, partition: &str) -> Result<bool>;

    /// Look up an entry
    async fn get(&self, partition: &str, key: &str) -> Result<Option<ResponseSnapshot>>;

    /// Store an entry, creating the partition if needed
    async fn put(&self, partition: &str, key: &str, response: ResponseSnapshot) -> Result<()>;

    /// Delete an entry. Returns `true` if it existed.
    async fn delete(&self, partition: &str, key: &str) -> Result<bool>;

    /// Keys stored in a partition (empty if the partition does not exist)
    async fn keys(&self, partition: &str) -> Result<Vec<String>>;

    /// Look a key up across all partitions, oldest partition first
    async fn match_any(&self, key: &str) -> Result<Option<ResponseSnapshot>> {
        for partition in self.partitions().await? {
            if let Some(response) = self.get(&partition, key).await? {
                debug!("Cross-partition match: key={}, partition={}", key, partition);
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    /// Store several entries into one partition
    async fn put_all(&self, partition: &str, entries: Vec<(String, ResponseSnapshot)>) -> Result<()> {
        self.open(partition).await?;
        for (key, response) in entries {
            self.put(partition, &key, response).await?;
        }
        Ok(())
    }
}

struct Partition {
    name: String,
    entries: HashMap<String, ResponseSnapshot>,
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub partitions: usize,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// In-memory cache store
#[derive(Default)]
pub struct MemoryCacheStore {
    partitions: RwLock<Vec<Partition>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn poisoned<E>(_: E) -> OfflineError {
    OfflineError::CacheError("cache store lock poisoned".to_string())
}

impl MemoryCacheStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get cache statistics
    pub fn get_stats(&self) -> CacheStats {
        let (partitions, entries) = match self.partitions.read() {
            Ok(storage) => (
                storage.len(),
                storage.iter().map(|p| p.entries.len()).sum(),
            ),
            Err(_) => (0, 0),
        };
        CacheStats {
            partitions,
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn open(&self, partition: &str) -> Result<()> {
        let mut storage = self.partitions.write().map_err(poisoned)?;
        if !storage.iter().any(|p| p.name == partition) {
            debug!("Creating partition: {}", partition);
            storage.push(Partition {
                name: partition.to_string(),
                entries: HashMap::new(),
            });
        }
        Ok(())
    }

    async fn has_partition(&self, partition: &str) -> Result<bool> {
        let storage = self.partitions.read().map_err(poisoned)?;
        Ok(storage.iter().any(|p| p.name == partition))
    }

    async fn partitions(&self) -> Result<Vec<String>> {
        let storage = self.partitions.read().map_err(poisoned)?;
        Ok(storage.iter().map(|p| p.name.clone()).collect())
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool> {
        let mut storage = self.partitions.write().map_err(poisoned)?;
        let before = storage.len();
        storage.retain(|p| p.name != partition);
        Ok(storage.len() != before)
    }

    async fn get(&self, partition: &str, key: &str) -> Result<Option<ResponseSnapshot>> {
        let result = {
            let storage = self.partitions.read().map_err(poisoned)?;
            storage
                .iter()
                .find(|p| p.name == partition)
                .and_then(|p| p.entries.get(key).cloned())
        };

        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit: partition={}, key={}", partition, key);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Cache miss: partition={}, key={}", partition, key);
        }
        Ok(result)
    }

    async fn put(&self, partition: &str, key: &str, response: ResponseSnapshot) -> Result<()> {
        let mut storage = self.partitions.write().map_err(poisoned)?;
        let size = response.body.len();
        match storage.iter_mut().find(|p| p.name == partition) {
            Some(p) => {
                p.entries.insert(key.to_string(), response);
            }
            None => {
                let mut entries = HashMap::new();
                entries.insert(key.to_string(), response);
                storage.push(Partition {
                    name: partition.to_string(),
                    entries,
                });
            }
        }
        debug!("Stored entry: partition={}, key={}, size={}", partition, key, size);
        Ok(())
    }

    async fn delete(&self, partition: &str, key: &str) -> Result<bool> {
        let mut storage = self.partitions.write().map_err(poisoned)?;
        Ok(storage
            .iter_mut()
            .find(|p| p.name == partition)
            .map(|p| p.entries.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn keys(&self, partition: &str) -> Result<Vec<String>> {
        let storage = self.partitions.read().map_err(poisoned)?;
        let mut keys: Vec<String> = storage
            .iter()
            .find(|p| p.name == partition)
            .map(|p| p.entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}
