//! Repository trait definition
//!
//! Defines the async interface that all repository backends must implement,
//! plus the directory upload and tarball primitives built on top of it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, TryStreamExt};
use keepsake_core::{Error, Result};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info};

use crate::archive;

/// Async trait for repository backends
///
/// Keys are `/`-separated paths relative to the repository root. Every
/// backend exposes the same key space so records written by one daemon are
/// readable through any other backend pointed at the same data.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Canonical URL of the repository root (`file://…`, `s3://…`, `gs://…`)
    fn root_url(&self) -> String;

    /// Pool bounding concurrent file transfers on this repository
    fn transfers(&self) -> &Semaphore;

    /// Read the blob at `path`
    ///
    /// # Errors
    /// `DoesNotExist` when the key is absent, `ReadError` on transport failure
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Create or overwrite the blob at `path`
    ///
    /// Each write is atomic: readers see the old or the new content, never a
    /// partial blob.
    ///
    /// # Errors
    /// `WriteError` on transport failure
    async fn put(&self, path: &str, data: Bytes) -> Result<()>;

    /// Upload a local file to `path`
    async fn put_file(&self, path: &str, local: &Path) -> Result<()>;

    /// Download the blob at `path` into a local file
    async fn get_file(&self, path: &str, local: &Path) -> Result<()>;

    /// Check if a key exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List file-like keys directly under `prefix`
    ///
    /// Does not recurse and does not return directory markers. An absent
    /// prefix yields an empty list.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete the key at `path`
    ///
    /// Disk backends return `DoesNotExist` for absent paths; object stores
    /// treat them as already deleted.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Recursively upload a local directory under `dest_prefix`
    ///
    /// Honors `.keepsakeignore` and the built-in denylist. Upload order is
    /// unspecified; concurrency is bounded by [`Repository::transfers`].
    async fn put_path(&self, src: &Path, dest_prefix: &str) -> Result<()> {
        let root = src.to_path_buf();
        let files = run_blocking(move || archive::collect_files(&root, "")).await?;
        let prefix = dest_prefix.trim_end_matches('/').to_string();
        let count = files.len();

        stream::iter(files.into_iter().map(Ok))
            .try_for_each_concurrent(None, |file| {
                let key = if prefix.is_empty() {
                    file.relative.clone()
                } else {
                    format!("{}/{}", prefix, file.relative)
                };
                async move {
                    let _permit = acquire(self.transfers()).await?;
                    self.put_file(&key, &file.absolute).await
                }
            })
            .await?;

        debug!(src = %src.display(), dest_prefix, count, "Uploaded directory");
        Ok(())
    }

    /// Pack `src/include_path` into a gzip tarball stored at `tar_key`
    ///
    /// Entries live under a top-level directory named after the tar key's
    /// basename, so extraction strips exactly one component.
    async fn put_path_tar(&self, src: &Path, tar_key: &str, include_path: &str) -> Result<()> {
        let root = src.to_path_buf();
        let include = include_path.to_string();
        let top_dir = archive::tar_basename(tar_key);
        let packed = run_blocking(move || archive::pack_to_tempfile(&root, &include, &top_dir)).await?;

        let _permit = acquire(self.transfers()).await?;
        self.put_file(tar_key, packed.path()).await?;

        info!(
            src = %src.display(),
            tar_key,
            include_path,
            "Uploaded tarball"
        );
        Ok(())
    }

    /// Download the tarball at `tar_key` and extract it into `dst`
    ///
    /// # Errors
    /// `DoesNotExist` when the key is absent, `UnsafeArchivePath` when an
    /// entry would land outside `dst`
    async fn get_path_tar(&self, tar_key: &str, dst: &Path, overwrite: bool) -> Result<Vec<PathBuf>> {
        let download = tempfile::NamedTempFile::new()?;
        {
            let _permit = acquire(self.transfers()).await?;
            self.get_file(tar_key, download.path()).await?;
        }

        let dst = dst.to_path_buf();
        let written = run_blocking(move || archive::unpack_file(download.path(), &dst, overwrite)).await?;
        debug!(tar_key, files = written.len(), "Extracted tarball");
        Ok(written)
    }
}

async fn acquire(pool: &Semaphore) -> Result<SemaphorePermit<'_>> {
    pool.acquire().await.map_err(|_| Error::Cancelled {
        operation: "repository transfer".to_string(),
    })
}

/// Run blocking filesystem work off the async executor
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal {
            message: format!("blocking task failed: {}", e),
        })?
}
