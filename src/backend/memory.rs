//! In-memory blob storage
//!
//! Entries expire after an optional TTL and the least recently used entries
//! are evicted once the optional byte budget is exceeded. Usable both as an
//! original/result cache and as a loader.

use super::{Loader, Storage, StoredBlob};
use crate::blob::Blob;
use crate::error::{Result, RelayError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};
use tracing::debug;

#[derive(Clone)]
struct Entry {
    data: Bytes,
    content_type: Option<String>,
    modified: SystemTime,
    expires_at: Option<SystemTime>,
    last_accessed: SystemTime,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    current_size_bytes: usize,
    hits: u64,
    misses: u64,
}

/// Storage statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStorageStats {
    pub total_entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Blob storage held in process memory
pub struct MemoryStorage {
    name: String,
    inner: RwLock<Inner>,
    ttl: Option<Duration>,
    max_size_bytes: Option<usize>,
}

impl MemoryStorage {
    /// Unbounded storage without expiry
    pub fn new() -> Self {
        MemoryStorage {
            name: "memory".to_string(),
            inner: RwLock::new(Inner::default()),
            ttl: None,
            max_size_bytes: None,
        }
    }

    /// Expire entries `ttl` after they were written
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = if ttl.is_zero() { None } else { Some(ttl) };
        self
    }

    /// Cap total stored bytes, evicting least recently used entries
    pub fn with_max_size(mut self, max_size_bytes: usize) -> Self {
        self.max_size_bytes = Some(max_size_bytes);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Store a blob with an explicit modification time
    pub async fn insert(&self, key: &str, blob: &Blob, modified: SystemTime) -> Result<()> {
        let data = blob.as_bytes().await?;
        let data_size = data.len();

        if let Some(max_size) = self.max_size_bytes {
            if data_size > max_size {
                return Err(RelayError::BackendWrite(format!(
                    "{}: entry of {} bytes exceeds capacity of {} bytes",
                    self.name, data_size, max_size
                )));
            }
        }

        let now = SystemTime::now();
        let mut inner = self.write()?;

        if let Some(old) = inner.entries.remove(key) {
            inner.current_size_bytes = inner.current_size_bytes.saturating_sub(old.data.len());
        }

        if let Some(max_size) = self.max_size_bytes {
            while inner.current_size_bytes + data_size > max_size && !inner.entries.is_empty() {
                let lru_key = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_accessed)
                    .map(|(k, _)| k.clone());
                match lru_key.and_then(|k| inner.entries.remove(&k).map(|e| (k, e))) {
                    Some((evicted, entry)) => {
                        inner.current_size_bytes =
                            inner.current_size_bytes.saturating_sub(entry.data.len());
                        debug!("Evicted LRU entry: storage={}, key={}", self.name, evicted);
                    }
                    None => break,
                }
            }
        }

        inner.entries.insert(
            key.to_string(),
            Entry {
                data,
                content_type: blob.declared_content_type().map(str::to_string),
                modified,
                expires_at: self.ttl.map(|ttl| now + ttl),
                last_accessed: now,
            },
        );
        inner.current_size_bytes += data_size;

        debug!(
            "Stored entry: storage={}, key={}, size={}",
            self.name, key, data_size
        );
        Ok(())
    }

    /// Remove an entry, returning whether it existed
    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.entries.remove(key) {
            Some(entry) => {
                inner.current_size_bytes =
                    inner.current_size_bytes.saturating_sub(entry.data.len());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn stats(&self) -> MemoryStorageStats {
        match self.inner.read() {
            Ok(inner) => MemoryStorageStats {
                total_entries: inner.entries.len(),
                total_bytes: inner.current_size_bytes,
                hits: inner.hits,
                misses: inner.misses,
            },
            Err(_) => MemoryStorageStats::default(),
        }
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| RelayError::InternalError(format!("{}: lock poisoned", self.name)))
    }

    fn lookup(&self, key: &str) -> Result<Option<Entry>> {
        let now = SystemTime::now();
        let mut guard = self.write()?;
        let inner = &mut *guard;

        let expired = match inner.entries.get_mut(key) {
            Some(entry) if entry.expires_at.map_or(true, |at| at > now) => {
                entry.last_accessed = now;
                let found = entry.clone();
                inner.hits += 1;
                return Ok(Some(found));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            if let Some(entry) = inner.entries.remove(key) {
                inner.current_size_bytes =
                    inner.current_size_bytes.saturating_sub(entry.data.len());
            }
            debug!("Entry expired: storage={}, key={}", self.name, key);
        }
        inner.misses += 1;
        Ok(None)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<StoredBlob>> {
        Ok(self.lookup(key)?.map(|entry| StoredBlob {
            blob: Blob::from_bytes(entry.data, entry.content_type.as_deref()),
            modified: Some(entry.modified),
        }))
    }

    async fn put(&self, key: &str, blob: &Blob) -> Result<()> {
        self.insert(key, blob, SystemTime::now()).await
    }

    async fn stat(&self, key: &str) -> Result<Option<SystemTime>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| RelayError::InternalError(format!("{}: lock poisoned", self.name)))?;
        Ok(inner.entries.get(key).map(|entry| entry.modified))
    }
}

#[async_trait]
impl Loader for MemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, key: &str) -> Result<Blob> {
        match Storage::get(self, key).await? {
            Some(stored) => Ok(stored.blob),
            None => Err(RelayError::NotFound(key.to_string())),
        }
    }

    async fn stat(&self, key: &str) -> Result<Option<SystemTime>> {
        Storage::stat(self, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_miss() {
        let storage = MemoryStorage::new();
        assert!(storage.get("missing").await.unwrap().is_none());
        assert_eq!(storage.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let storage = MemoryStorage::new();
        let blob = Blob::from_bytes(&b"hello"[..], Some("image/png"));
        storage.put("a", &blob).await.unwrap();

        let stored = storage.get("a").await.unwrap().unwrap();
        assert_eq!(stored.blob.as_bytes().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(stored.blob.content_type(), "image/png");
        assert!(stored.modified.is_some());

        let stats = storage.stats();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.total_bytes, 5);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_expiration() {
        let storage = MemoryStorage::new().with_ttl(Duration::from_millis(50));
        storage.put("a", &Blob::from_bytes(&b"x"[..], None)).await.unwrap();
        assert!(storage.get("a").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(storage.get("a").await.unwrap().is_none());
        assert_eq!(storage.stats().total_entries, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let storage = MemoryStorage::new().with_max_size(1024);
        storage.put("one", &Blob::from_bytes(vec![1u8; 512], None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        storage.put("two", &Blob::from_bytes(vec![2u8; 512], None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        storage.put("three", &Blob::from_bytes(vec![3u8; 512], None)).await.unwrap();

        assert!(storage.get("one").await.unwrap().is_none());
        assert!(storage.get("two").await.unwrap().is_some());
        assert!(storage.get("three").await.unwrap().is_some());
        assert_eq!(storage.stats().total_bytes, 1024);
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected() {
        let storage = MemoryStorage::new().with_max_size(4);
        let err = storage
            .put("big", &Blob::from_bytes(vec![0u8; 8], None))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::BackendWrite(_)));
    }

    #[tokio::test]
    async fn test_loader_not_found() {
        let storage = MemoryStorage::new();
        let err = storage.load("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
