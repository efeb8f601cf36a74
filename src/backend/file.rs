//! Filesystem blob storage
//!
//! Keys map to paths under a base directory. Writes go to a temporary file
//! first and are renamed into place, so readers never observe partial files.

use super::{Loader, Storage, StoredBlob};
use crate::blob::Blob;
use crate::error::{Result, RelayError};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Blob storage rooted at a directory
pub struct FileStorage {
    name: String,
    base_dir: PathBuf,
    expiration: Option<Duration>,
    tmp_counter: AtomicU64,
}

impl FileStorage {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        FileStorage {
            name: "file".to_string(),
            base_dir: base_dir.as_ref().to_path_buf(),
            expiration: None,
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// Treat files older than `expiration` as absent
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = if expiration.is_zero() { None } else { Some(expiration) };
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a key to a path inside the base directory
    ///
    /// Rejects keys that are empty, absolute, or climb out with `..`.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        let mut path = self.base_dir.clone();
        let mut depth = 0usize;

        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                _ => {
                    return Err(RelayError::InvalidRequest(format!(
                        "invalid storage key '{}'",
                        key
                    )))
                }
            }
        }

        if depth == 0 {
            return Err(RelayError::InvalidRequest("empty storage key".to_string()));
        }
        Ok(path)
    }

    async fn modified(&self, path: &Path) -> Result<Option<SystemTime>> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(meta.modified().ok()),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RelayError::IoError(format!("stat {}: {}", path.display(), e))),
        }
    }

    fn is_expired(&self, modified: Option<SystemTime>) -> bool {
        match (self.expiration, modified) {
            (Some(expiration), Some(modified)) => modified + expiration <= SystemTime::now(),
            _ => false,
        }
    }
}

#[async_trait]
impl Storage for FileStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<StoredBlob>> {
        let path = self.path_for(key)?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RelayError::IoError(format!("open {}: {}", path.display(), e)))
            }
        };

        // Time and content both come from the opened handle
        let modified = match file.metadata().await {
            Ok(meta) if meta.is_file() => meta.modified().ok(),
            Ok(_) => return Ok(None),
            Err(e) => {
                return Err(RelayError::IoError(format!("stat {}: {}", path.display(), e)))
            }
        };

        if self.is_expired(modified) {
            debug!("File entry expired: storage={}, key={}", self.name, key);
            return Ok(None);
        }

        let blob = Blob::from_open_file(file, path, None).await?;
        Ok(Some(StoredBlob { blob, modified }))
    }

    async fn put(&self, key: &str, blob: &Blob) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                RelayError::BackendWrite(format!("create {}: {}", parent.display(), e))
            })?;
        }

        let seq = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp_path = path.with_file_name(format!(
            ".{}.tmp-{}-{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("blob"),
            std::process::id(),
            seq
        ));

        let result = async {
            let mut file = fs::File::create(&tmp_path).await?;
            let (mut reader, _) = blob.new_stream().await?;
            tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            fs::rename(&tmp_path, &path).await?;
            Ok::<(), RelayError>(())
        }
        .await;

        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_file(&tmp_path).await {
                warn!("Failed to remove temp file {}: {}", tmp_path.display(), cleanup);
            }
            return Err(RelayError::BackendWrite(format!("{}: {}", key, e)));
        }

        debug!(
            "Stored file: storage={}, key={}, size={}",
            self.name,
            key,
            blob.size()
        );
        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<Option<SystemTime>> {
        let path = self.path_for(key)?;
        self.modified(&path).await
    }
}

#[async_trait]
impl Loader for FileStorage {
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
