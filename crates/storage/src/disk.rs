//! Local filesystem repository backend
//!
//! Provides async file I/O with atomic writes to prevent partial/corrupt files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use keepsake_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::Repository;

/// Local filesystem repository
///
/// Stores data in a local directory with support for:
/// - Atomic writes (write to .tmp, then rename)
/// - Automatic directory creation
/// - Recursive deletes of directory keys
#[derive(Debug)]
pub struct DiskRepository {
    /// Base path for all repository keys
    root: PathBuf,
    transfers: Semaphore,
}

impl DiskRepository {
    /// Create a repository rooted at `root`
    ///
    /// The directory is created lazily on first write.
    pub fn new<P: AsRef<Path>>(root: P, transfer_concurrency: usize) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            transfers: Semaphore::new(transfer_concurrency.max(1)),
        }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to an absolute path
    fn resolve_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Generate a unique temporary file path next to `full_path`
    fn temp_path(full_path: &Path) -> PathBuf {
        let temp_name = format!(
            ".{}.{}.tmp",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        full_path.with_file_name(temp_name)
    }

    async fn ensure_parent(&self, path: &str, full_path: &Path) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::write(path, format!("failed to create {:?}: {}", parent, e)))?;
        }
        Ok(())
    }

    /// Rename a fully written temp file over the target
    async fn commit(&self, path: &str, temp_path: &Path, full_path: &Path) -> Result<()> {
        if let Err(e) = fs::rename(temp_path, full_path).await {
            let _ = fs::remove_file(temp_path).await;
            return Err(Error::write(
                path,
                format!("failed to rename {:?} to {:?}: {}", temp_path, full_path, e),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for DiskRepository {
    fn root_url(&self) -> String {
        format!("file://{}", self.root.display())
    }

    fn transfers(&self) -> &Semaphore {
        &self.transfers
    }

    #[instrument(skip(self), fields(backend = "disk"))]
    async fn get(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve_path(path);
        debug!(?full_path, "Reading file");

        match fs::read(&full_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::does_not_exist(path)),
            Err(e) => Err(Error::read(path, e)),
        }
    }

    #[instrument(skip(self, data), fields(backend = "disk", size = data.len()))]
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        let full_path = self.resolve_path(path);
        let temp_path = Self::temp_path(&full_path);

        debug!(?full_path, ?temp_path, size = data.len(), "Writing file atomically");
        self.ensure_parent(path, &full_path).await?;

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::write(path, format!("failed to create temp file: {}", e)))?;
        let written = async {
            file.write_all(&data).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::write(path, e));
        }

        self.commit(path, &temp_path, &full_path).await
    }

    #[instrument(skip(self), fields(backend = "disk"))]
    async fn put_file(&self, path: &str, local: &Path) -> Result<()> {
        let full_path = self.resolve_path(path);
        let temp_path = Self::temp_path(&full_path);

        self.ensure_parent(path, &full_path).await?;
        if let Err(e) = fs::copy(local, &temp_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::write(path, format!("failed to copy {:?}: {}", local, e)));
        }

        self.commit(path, &temp_path, &full_path).await?;
        debug!(?full_path, "File copied into repository");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "disk"))]
    async fn get_file(&self, path: &str, local: &Path) -> Result<()> {
        let full_path = self.resolve_path(path);
        match fs::copy(&full_path, local).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !full_path.exists() => {
                Err(Error::does_not_exist(path))
            }
            Err(e) => Err(Error::read(path, e)),
        }
    }

    #[instrument(skip(self), fields(backend = "disk"))]
    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.resolve_path(path);
        match fs::metadata(&full_path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::read(path, e)),
        }
    }

    #[instrument(skip(self), fields(backend = "disk"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve_path(prefix);
        let prefix = prefix.trim_matches('/');
        let mut results = Vec::new();

        match fs::metadata(&dir).await {
            Ok(m) if m.is_dir() => {}
            Ok(_) => return Ok(results),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(Error::read(prefix, e)),
        }
        let mut entries = fs::read_dir(&dir).await.map_err(|e| Error::read(prefix, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::read(prefix, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') && name.ends_with(".tmp") {
                continue;
            }
            let metadata = match fs::metadata(entry.path()).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if metadata.is_file() {
                results.push(if prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", prefix, name)
                });
            }
        }

        results.sort();
        debug!(count = results.len(), "Found files");
        Ok(results)
    }

    #[instrument(skip(self), fields(backend = "disk"))]
    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path);
        debug!(?full_path, "Deleting");

        let metadata = match fs::symlink_metadata(&full_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::does_not_exist(path))
            }
            Err(e) => return Err(Error::write(path, e)),
        };

        let removed = if metadata.is_dir() {
            fs::remove_dir_all(&full_path).await
        } else {
            fs::remove_file(&full_path).await
        };
        removed.map_err(|e| Error::write(path, e))
    }
}
