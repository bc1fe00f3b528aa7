//! Repository URL parsing and backend selection

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keepsake_core::{Error, Result, StorageConfig};
use tracing::info;

use crate::{DiskRepository, Repository};

/// A parsed repository URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryUrl {
    /// `file://<path>` or a bare path
    Disk { root: PathBuf },
    /// `s3://<bucket>[/<root>]`
    S3 { bucket: String, root: String },
    /// `gs://<bucket>[/<root>]`
    Gcs { bucket: String, root: String },
}

impl RepositoryUrl {
    /// Parse a repository URL
    ///
    /// Relative disk paths are resolved against `project_dir`.
    pub fn parse(url: &str, project_dir: &Path) -> Result<Self> {
        let (scheme, rest) = match url.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("", url),
        };
        let (netloc, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };

        match scheme {
            "" | "file" => {
                if rest.is_empty() {
                    return Err(config_error(url, "missing path"));
                }
                let root = PathBuf::from(rest);
                let root = if root.is_absolute() {
                    root
                } else {
                    project_dir.join(root)
                };
                Ok(RepositoryUrl::Disk { root })
            }
            "s3" | "gs" => {
                if netloc.is_empty() {
                    return Err(config_error(url, "missing bucket name"));
                }
                let bucket = netloc.to_string();
                let root = path.trim_matches('/').to_string();
                Ok(if scheme == "s3" {
                    RepositoryUrl::S3 { bucket, root }
                } else {
                    RepositoryUrl::Gcs { bucket, root }
                })
            }
            other => Err(config_error(
                url,
                &format!("unknown scheme {:?}, expected file, s3 or gs", other),
            )),
        }
    }
}

impl fmt::Display for RepositoryUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryUrl::Disk { root } => write!(f, "file://{}", root.display()),
            RepositoryUrl::S3 { bucket, root } if root.is_empty() => write!(f, "s3://{}", bucket),
            RepositoryUrl::S3 { bucket, root } => write!(f, "s3://{}/{}", bucket, root),
            RepositoryUrl::Gcs { bucket, root } if root.is_empty() => write!(f, "gs://{}", bucket),
            RepositoryUrl::Gcs { bucket, root } => write!(f, "gs://{}/{}", bucket, root),
        }
    }
}

/// Open the repository named by `url`
///
/// Object store backends connect eagerly, creating their bucket if needed.
pub async fn open(
    url: &str,
    project_dir: &Path,
    config: &StorageConfig,
) -> Result<Arc<dyn Repository>> {
    let parsed = RepositoryUrl::parse(url, project_dir)?;
    let repository: Arc<dyn Repository> = match parsed {
        RepositoryUrl::Disk { root } => {
            Arc::new(DiskRepository::new(root, config.transfer_concurrency))
        }
        RepositoryUrl::S3 { bucket, root } => open_s3(url, &bucket, &root, config).await?,
        RepositoryUrl::Gcs { bucket, root } => open_gcs(url, &bucket, &root, config).await?,
    };

    info!(url, root = %repository.root_url(), "Opened repository");
    Ok(repository)
}

#[cfg(feature = "s3")]
async fn open_s3(
    _url: &str,
    bucket: &str,
    root: &str,
    config: &StorageConfig,
) -> Result<Arc<dyn Repository>> {
    Ok(Arc::new(crate::S3Repository::connect(bucket, root, config).await?))
}

#[cfg(not(feature = "s3"))]
async fn open_s3(
    url: &str,
    _bucket: &str,
    _root: &str,
    _config: &StorageConfig,
) -> Result<Arc<dyn Repository>> {
    Err(config_error(url, "this build does not include S3 support"))
}

#[cfg(feature = "gcs")]
async fn open_gcs(
    _url: &str,
    bucket: &str,
    root: &str,
    config: &StorageConfig,
) -> Result<Arc<dyn Repository>> {
    Ok(Arc::new(crate::GcsRepository::connect(bucket, root, config).await?))
}

#[cfg(not(feature = "gcs"))]
async fn open_gcs(
    url: &str,
    _bucket: &str,
    _root: &str,
    _config: &StorageConfig,
) -> Result<Arc<dyn Repository>> {
    Err(config_error(url, "this build does not include Google Cloud Storage support"))
}

fn config_error(url: &str, reason: &str) -> Error {
    Error::RepositoryConfiguration {
        message: format!("invalid repository URL {:?}: {}", url, reason),
    }
}
