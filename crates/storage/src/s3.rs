//! S3 repository backend
//!
//! Provides async S3-compatible storage with:
//! - Bucket creation and region detection on connect
//! - Concurrent multipart uploads for large files
//! - Exponential backoff retry logic

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{http::HttpResponse, Builder as S3ConfigBuilder, Region},
    error::{DisplayErrorContext, SdkError},
    operation::delete_objects::DeleteObjectsOutput,
    primitives::{ByteStream, Length},
    types::{
        BucketLocationConstraint, CompletedMultipartUpload, CompletedPart,
        CreateBucketConfiguration, Delete, ObjectIdentifier,
    },
    Client,
};
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use keepsake_core::{Error, Result, RetryConfig, StorageConfig};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::retry::{read_failure, with_retry, write_failure};
use crate::Repository;

/// Files at or above this size use multipart upload (5 MB)
const MULTIPART_THRESHOLD: u64 = 5 * 1024 * 1024;

/// Part size for multipart uploads (5 MB minimum required by S3)
const MULTIPART_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Parts of one file uploaded in parallel
const MULTIPART_CONCURRENCY: usize = 8;

/// Region used for new buckets when the environment names none
const DEFAULT_REGION: &str = "us-east-1";

const BACKEND: &str = "s3";

/// S3 repository backend
#[derive(Debug)]
pub struct S3Repository {
    client: Client,
    bucket: String,
    root: String,
    retry: RetryConfig,
    transfers: Semaphore,
}

impl S3Repository {
    /// Connect to `bucket`, creating it in the default region if missing
    ///
    /// Uses environment variables or instance profile for credentials. The
    /// client is pinned to the bucket's region after a head lookup.
    pub async fn connect(bucket: &str, root: &str, config: &StorageConfig) -> Result<Self> {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let default_region = sdk_config
            .region()
            .map(|r| r.to_string())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let probe = Client::from_conf(
            S3ConfigBuilder::from(&sdk_config)
                .region(Region::new(default_region.clone()))
                .build(),
        );

        let region = match bucket_region(&probe, bucket).await? {
            Some(region) => region.unwrap_or_else(|| default_region.clone()),
            None => {
                create_bucket(&probe, bucket, &default_region).await?;
                default_region
            }
        };
        debug!(bucket, %region, "Resolved bucket region");

        let client = Client::from_conf(
            S3ConfigBuilder::from(&sdk_config)
                .region(Region::new(region))
                .build(),
        );

        Ok(Self {
            client,
            bucket: bucket.to_string(),
            root: root.trim_matches('/').to_string(),
            retry: config.retry.clone(),
            transfers: Semaphore::new(config.transfer_concurrency.max(1)),
        })
    }

    /// Get the full S3 key for a repository path
    fn s3_key(&self, path: &str) -> String {
        join_key(&self.root, path)
    }

    /// Upload a large file in parts, several at a time
    async fn multipart_upload(&self, key: &str, local: &Path, size: u64) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_failure(e, |m| Error::write(key, m)))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::write(key, "no upload_id returned"))?
            .to_string();

        debug!(key, %upload_id, size, "Started multipart upload");

        let part_count = size.div_ceil(MULTIPART_PART_SIZE);
        let uploaded: Result<Vec<CompletedPart>> = stream::iter(0..part_count)
            .map(|index| self.upload_part(key, &upload_id, local, size, index))
            .buffer_unordered(MULTIPART_CONCURRENCY)
            .try_collect()
            .await;

        let mut parts = match uploaded {
            Ok(parts) => parts,
            Err(e) => {
                self.abort_multipart_upload(key, &upload_id).await;
                return Err(write_failure(key, e));
            }
        };
        parts.sort_by_key(|part| part.part_number());

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        let result = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .send()
            .await;
        if let Err(e) = result {
            self.abort_multipart_upload(key, &upload_id).await;
            return Err(write_failure(key, sdk_failure(e, |m| Error::write(key, m))));
        }

        debug!(key, size, parts = part_count, "Completed multipart upload");
        Ok(())
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        local: &Path,
        size: u64,
        index: u64,
    ) -> Result<CompletedPart> {
        let offset = index * MULTIPART_PART_SIZE;
        let length = MULTIPART_PART_SIZE.min(size - offset);
        let part_number = (index + 1) as i32;

        let etag = with_retry(&self.retry, "upload_part", move || async move {
            let body = ByteStream::read_from()
                .path(local)
                .offset(offset)
                .length(Length::Exact(length))
                .build()
                .await
                .map_err(|e| Error::write(key, e))?;

            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|e| sdk_failure(e, |m| Error::write(key, m)))?;
            Ok(uploaded.e_tag().map(String::from))
        })
        .await?;

        debug!(part_number, offset, length, "Uploaded part");
        Ok(CompletedPart::builder()
            .part_number(part_number)
            .set_e_tag(etag)
            .build())
    }

    /// Abort a multipart upload (best effort, for cleanup)
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        if let Err(e) = result {
            warn!(key, upload_id, error = %DisplayErrorContext(&e), "Failed to abort multipart upload");
        }
    }

    /// Every object key under `prefix`, recursively
    async fn list_recursive(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| sdk_failure(e, |m| Error::read(prefix, m)))?;
            keys.extend(response.contents().iter().filter_map(|o| o.key().map(String::from)));

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl Repository for S3Repository {
    fn root_url(&self) -> String {
        if self.root.is_empty() {
            format!("s3://{}", self.bucket)
        } else {
            format!("s3://{}/{}", self.bucket, self.root)
        }
    }

    fn transfers(&self) -> &Semaphore {
        &self.transfers
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn get(&self, path: &str) -> Result<Bytes> {
        let key = self.s3_key(path);
        let key = key.as_str();
        debug!(%key, "Reading from S3");

        with_retry(&self.retry, "get", move || async move {
            let result = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| {
                    if e.as_service_error().map(|s| s.is_no_such_key()).unwrap_or(false) {
                        Error::does_not_exist(path)
                    } else {
                        sdk_failure(e, |m| Error::read(path, m))
                    }
                })?;

            let bytes = result.body.collect().await.map_err(|e| Error::StorageUnavailable {
                backend: BACKEND.to_string(),
                message: format!("failed to read response body: {}", e),
            })?;
            Ok(bytes.into_bytes())
        })
        .await
        .map_err(|e| read_failure(path, e))
    }

    #[instrument(skip(self, data), fields(backend = "s3", bucket = %self.bucket, size = data.len()))]
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        let key = self.s3_key(path);
        let key = key.as_str();
        debug!(%key, "Writing to S3");

        with_retry(&self.retry, "put", move || {
            let data = data.clone();
            async move {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .body(ByteStream::from(data))
                    .send()
                    .await
                    .map_err(|e| sdk_failure(e, |m| Error::write(path, m)))?;
                Ok(())
            }
        })
        .await
        .map_err(|e| write_failure(path, e))
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn put_file(&self, path: &str, local: &Path) -> Result<()> {
        let key = self.s3_key(path);
        let size = tokio::fs::metadata(local).await?.len();

        if size >= MULTIPART_THRESHOLD {
            return self.multipart_upload(&key, local, size).await;
        }

        let key = key.as_str();
        with_retry(&self.retry, "put_file", move || async move {
            let body = ByteStream::from_path(local)
                .await
                .map_err(|e| Error::write(path, e))?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body)
                .send()
                .await
                .map_err(|e| sdk_failure(e, |m| Error::write(path, m)))?;
            Ok(())
        })
        .await
        .map_err(|e| write_failure(path, e))
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn get_file(&self, path: &str, local: &Path) -> Result<()> {
        let key = self.s3_key(path);
        let key = key.as_str();

        with_retry(&self.retry, "get_file", move || async move {
            let result = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| {
                    if e.as_service_error().map(|s| s.is_no_such_key()).unwrap_or(false) {
                        Error::does_not_exist(path)
                    } else {
                        sdk_failure(e, |m| Error::read(path, m))
                    }
                })?;

            let mut body = result.body;
            let mut file = tokio::fs::File::create(local).await?;
            while let Some(chunk) = body.try_next().await.map_err(|e| Error::StorageUnavailable {
                backend: BACKEND.to_string(),
                message: format!("download of {} interrupted: {}", path, e),
            })? {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok(())
        })
        .await
        .map_err(|e| read_failure(path, e))
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn exists(&self, path: &str) -> Result<bool> {
        let key = self.s3_key(path);
        let key = key.as_str();

        with_retry(&self.retry, "exists", move || async move {
            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(e) if e.as_service_error().map(|s| s.is_not_found()).unwrap_or(false) => {
                    Ok(false)
                }
                Err(e) => Err(sdk_failure(e, |m| Error::read(path, m))),
            }
        })
        .await
        .map_err(|e| read_failure(path, e))
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.s3_key(prefix.trim_matches('/'));
        let s3_prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };
        let s3_prefix = s3_prefix.as_str();

        let keys = with_retry(&self.retry, "list", move || async move {
            let mut keys = Vec::new();
            let mut continuation_token: Option<String> = None;
            loop {
                let mut request = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(s3_prefix)
                    .delimiter("/");
                if let Some(token) = continuation_token.take() {
                    request = request.continuation_token(token);
                }

                let response = request
                    .send()
                    .await
                    .map_err(|e| sdk_failure(e, |m| Error::read(prefix, m)))?;
                keys.extend(
                    response
                        .contents()
                        .iter()
                        .filter_map(|o| o.key())
                        .filter(|k| !k.ends_with('/'))
                        .map(String::from),
                );

                if response.is_truncated() == Some(true) {
                    continuation_token = response.next_continuation_token().map(String::from);
                } else {
                    break;
                }
            }
            Ok(keys)
        })
        .await
        .map_err(|e| read_failure(prefix, e))?;

        let mut results: Vec<String> = keys
            .iter()
            .map(|k| relative_key(&self.root, k).to_string())
            .collect();
        results.sort();
        debug!(count = results.len(), "Found S3 objects");
        Ok(results)
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn delete(&self, path: &str) -> Result<()> {
        let key = self.s3_key(path);
        debug!(%key, "Deleting from S3");

        let nested = format!("{}/", key);
        let nested = nested.as_str();
        let mut keys = with_retry(&self.retry, "delete_list", move || {
            self.list_recursive(nested)
        })
        .await
        .map_err(|e| write_failure(path, e))?;
        keys.push(key);

        for chunk in keys.chunks(1000) {
            let objects = chunk
                .iter()
                .map(|k| ObjectIdentifier::builder().key(k).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::Internal {
                    message: format!("invalid delete request: {}", e),
                })?;
            let request = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| Error::Internal {
                    message: format!("invalid delete request: {}", e),
                })?;
            let request = &request;

            let output = with_retry(&self.retry, "delete", move || async move {
                self.client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(request.clone())
                    .send()
                    .await
                    .map_err(|e| sdk_failure(e, |m| Error::write(path, m)))
            })
            .await
            .map_err(|e| write_failure(path, e))?;
            check_deleted(path, &output)?;
        }
        Ok(())
    }
}

/// Quiet mode reports only the objects that could not be deleted
fn check_deleted(path: &str, output: &DeleteObjectsOutput) -> Result<()> {
    let Some(failed) = output.errors().first() else {
        return Ok(());
    };
    let message = format!(
        "{} object(s) not deleted, first {}: {} {}",
        output.errors().len(),
        failed.key().unwrap_or("<unknown key>"),
        failed.code().unwrap_or("UnknownError"),
        failed.message().unwrap_or("")
    );
    Err(Error::write(path, message.trim_end()))
}

/// Look up the region of `bucket`
///
/// Returns `None` when the bucket does not exist and `Some(None)` when it
/// exists but S3 did not report a region.
async fn bucket_region(client: &Client, bucket: &str) -> Result<Option<Option<String>>> {
    match client.head_bucket().bucket(bucket).send().await {
        Ok(output) => Ok(Some(output.bucket_region().map(String::from))),
        Err(e) => {
            if e.as_service_error().map(|s| s.is_not_found()).unwrap_or(false) {
                return Ok(None);
            }
            let redirected = e
                .raw_response()
                .and_then(|r| r.headers().get("x-amz-bucket-region"))
                .map(String::from);
            if let Some(region) = redirected {
                return Ok(Some(Some(region)));
            }
            Err(sdk_failure(e, |m| Error::RepositoryConfiguration {
                message: format!("cannot access bucket {}: {}", bucket, m),
            }))
        }
    }
}

async fn create_bucket(client: &Client, bucket: &str, region: &str) -> Result<()> {
    let mut request = client.create_bucket().bucket(bucket);
    if region != DEFAULT_REGION {
        request = request.create_bucket_configuration(
            CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region))
                .build(),
        );
    }
    request.send().await.map_err(|e| {
        sdk_failure(e, |m| Error::RepositoryConfiguration {
            message: format!("failed to create bucket {}: {}", bucket, m),
        })
    })?;
    info!(bucket, region, "Created bucket");
    Ok(())
}

/// Classify an SDK failure as transient or permanent
fn sdk_failure<E>(err: SdkError<E, HttpResponse>, permanent: impl FnOnce(String) -> Error) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(context) => context.raw().status().is_server_error(),
        _ => false,
    };
    let message = DisplayErrorContext(&err).to_string();
    if transient {
        Error::StorageUnavailable {
            backend: BACKEND.to_string(),
            message,
        }
    } else {
        permanent(message)
    }
}

/// Object key for a repository path under `root`
fn join_key(root: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if root.is_empty() {
        path.to_string()
    } else if path.is_empty() {
        root.to_string()
    } else {
        format!("{}/{}", root, path)
    }
}

/// Repository path of an object key under `root`
fn relative_key<'a>(root: &str, key: &'a str) -> &'a str {
    if root.is_empty() {
        return key;
    }
    key.strip_prefix(root)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_key_with_root() {
        assert_eq!(join_key("training", "repository.json"), "training/repository.json");
        assert_eq!(
            join_key("a/b", "checkpoints/abc.tar.gz"),
            "a/b/checkpoints/abc.tar.gz"
        );
        assert_eq!(join_key("training", ""), "training");
    }

    #[test]
    fn test_join_key_without_root() {
        assert_eq!(join_key("", "repository.json"), "repository.json");
        assert_eq!(join_key("", "/metadata/x.json"), "metadata/x.json");
    }

    #[test]
    fn test_relative_key() {
        assert_eq!(
            relative_key("root", "root/metadata/experiments/a.json"),
            "metadata/experiments/a.json"
        );
        assert_eq!(relative_key("", "metadata/a.json"), "metadata/a.json");
        assert_eq!(relative_key("root", "rootless/a.json"), "rootless/a.json");
    }

    #[test]
    fn test_partial_delete_is_write_error() {
        let output = DeleteObjectsOutput::builder()
            .errors(
                aws_sdk_s3::types::Error::builder()
                    .key("root/checkpoints/abc.tar.gz")
                    .code("AccessDenied")
                    .message("Access Denied")
                    .build(),
            )
            .build();
        let err = check_deleted("checkpoints/abc.tar.gz", &output).unwrap_err();
        assert_eq!(err.kind(), keepsake_core::ErrorKind::WriteError);
        assert!(err.to_string().contains("AccessDenied"));
        assert!(err.to_string().contains("root/checkpoints/abc.tar.gz"));

        let clean = DeleteObjectsOutput::builder().build();
        assert!(check_deleted("checkpoints/abc.tar.gz", &clean).is_ok());
    }

    #[test]
    fn test_part_count() {
        assert_eq!((MULTIPART_THRESHOLD).div_ceil(MULTIPART_PART_SIZE), 1);
        assert_eq!((MULTIPART_THRESHOLD + 1).div_ceil(MULTIPART_PART_SIZE), 2);
        assert_eq!((3 * MULTIPART_PART_SIZE).div_ceil(MULTIPART_PART_SIZE), 3);
    }
}
