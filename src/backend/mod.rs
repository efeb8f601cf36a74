//! Loader and storage capabilities
//!
//! Originals are fetched through [`Loader`]s; originals and transformed
//! results are cached through [`Storage`]s. Any number of each may be
//! registered with the orchestrator and they are always tried in registration
//! order.
//!
//! Built-in implementations:
//! - [`MemoryStorage`]: in-process map with TTL and LRU eviction
//! - [`FileStorage`]: directory on the local filesystem
//! - [`HttpLoader`]: fetches originals from an HTTP origin

pub mod file;
pub mod http;
pub mod memory;

use crate::blob::Blob;
use crate::error::Result;
use async_trait::async_trait;
use std::time::SystemTime;

pub use file::FileStorage;
pub use self::http::{HttpLoader, RetryPolicy};
pub use memory::{MemoryStorage, MemoryStorageStats};

/// Fetches original resources by key
///
/// A loader that does not have the resource must fail with an error for which
/// [`RelayError::is_not_found`](crate::RelayError::is_not_found) is true, so the
/// next loader gets a chance.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Short name used in logs and metrics
    fn name(&self) -> &str;

    async fn load(&self, key: &str) -> Result<Blob>;

    /// Last-modified time of the resource, when the backend knows it
    async fn stat(&self, _key: &str) -> Result<Option<SystemTime>> {
        Ok(None)
    }
}

/// A blob read back from a storage, with its write time if known
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub blob: Blob,
    pub modified: Option<SystemTime>,
}

/// Persists and retrieves blobs by key
#[async_trait]
pub trait Storage: Send + Sync {
    /// Short name used in logs and metrics
    fn name(&self) -> &str;

    /// `Ok(None)` when the key is absent or expired
    async fn get(&self, key: &str) -> Result<Option<StoredBlob>>;

    async fn put(&self, key: &str, blob: &Blob) -> Result<()>;

    /// Modification time of a stored entry, when the backend knows it
    async fn stat(&self, _key: &str) -> Result<Option<SystemTime>> {
        Ok(None)
    }
}
