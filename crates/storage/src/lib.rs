//! Keepsake Storage - Repository backends for the experiment tracking daemon
//!
//! Provides async blob storage with support for:
//! - Local filesystem
//! - Amazon S3 (with `s3` feature)
//! - Google Cloud Storage (with `gcs` feature)
//!
//! plus the gzip tarball pipeline used to snapshot source and artifact trees.
//!
//! # Example
//!
//! ```no_run
//! use keepsake_storage::{open, Repository};
//! use keepsake_core::StorageConfig;
//! use bytes::Bytes;
//! use std::path::Path;
//!
//! # async fn example() -> keepsake_core::Result<()> {
//! let repository = open("file://.keepsake", Path::new("."), &StorageConfig::default()).await?;
//! repository.put("repository.json", Bytes::from(r#"{"version": 1}"#)).await?;
//! let data = repository.get("repository.json").await?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
mod backend;
mod disk;
pub mod filter;
mod open;
pub mod retry;

#[cfg(feature = "gcs")]
mod gcs;
#[cfg(feature = "s3")]
mod s3;

pub use backend::Repository;
pub use disk::DiskRepository;
pub use open::{open, RepositoryUrl};

#[cfg(feature = "gcs")]
pub use gcs::{GcsRepository, CREDENTIALS_ENV};
#[cfg(feature = "s3")]
pub use s3::S3Repository;
