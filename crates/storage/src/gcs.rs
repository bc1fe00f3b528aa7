//! Google Cloud Storage repository backend
//!
//! Talks to the GCS JSON API over HTTPS. Credentials come from
//! `KEEPSAKE_GCP_CREDENTIALS_BASE64` when set, otherwise from the ambient
//! Google environment.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::{Engine, BASE64_STANDARD};
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use gcp_auth::{CustomServiceAccount, TokenProvider};
use keepsake_core::{Error, Result, RetryConfig, StorageConfig};
use reqwest::{Body, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};

use crate::retry::{read_failure, with_retry, write_failure};
use crate::Repository;

/// Environment variable holding a base64-encoded service account JSON key
pub const CREDENTIALS_ENV: &str = "KEEPSAKE_GCP_CREDENTIALS_BASE64";

const API_ROOT: &str = "https://storage.googleapis.com";
const SCOPES: &[&str] = &["https://www.googleapis.com/auth/devstorage.read_write"];
const DELETE_CONCURRENCY: usize = 16;
const BACKEND: &str = "gcs";

/// GCS repository backend
pub struct GcsRepository {
    http: reqwest::Client,
    auth: Arc<dyn TokenProvider>,
    bucket: String,
    root: String,
    retry: RetryConfig,
    transfers: Semaphore,
}

impl std::fmt::Debug for GcsRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsRepository")
            .field("bucket", &self.bucket)
            .field("root", &self.root)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectEntry {
    name: String,
}

impl GcsRepository {
    /// Connect to `bucket`, creating it if missing
    pub async fn connect(bucket: &str, root: &str, config: &StorageConfig) -> Result<Self> {
        let auth = credentials().await?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::RepositoryConfiguration {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        let repository = Self {
            http,
            auth,
            bucket: bucket.to_string(),
            root: root.trim_matches('/').to_string(),
            retry: config.retry.clone(),
            transfers: Semaphore::new(config.transfer_concurrency.max(1)),
        };
        repository.ensure_bucket().await?;
        Ok(repository)
    }

    fn object_key(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if self.root.is_empty() {
            path.to_string()
        } else if path.is_empty() {
            self.root.clone()
        } else {
            format!("{}/{}", self.root, path)
        }
    }

    fn relative<'a>(&self, name: &'a str) -> &'a str {
        if self.root.is_empty() {
            return name;
        }
        name.strip_prefix(self.root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(name)
    }

    async fn request(&self, method: Method, url: Url) -> Result<RequestBuilder> {
        let token = self.auth.token(SCOPES).await.map_err(|e| Error::StorageUnavailable {
            backend: BACKEND.to_string(),
            message: format!("failed to obtain access token: {}", e),
        })?;
        Ok(self.http.request(method, url).bearer_auth(token.as_str()))
    }

    async fn ensure_bucket(&self) -> Result<()> {
        let url = bucket_url(&self.bucket)?;
        let response = self.request(Method::GET, url).await?.send().await;
        let response = response.map_err(|e| Error::RepositoryConfiguration {
            message: format!("cannot reach bucket {}: {}", self.bucket, e),
        })?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => self.create_bucket().await,
            status => Err(Error::RepositoryConfiguration {
                message: format!(
                    "cannot access bucket {}: {} {}",
                    self.bucket,
                    status,
                    response.text().await.unwrap_or_default()
                ),
            }),
        }
    }

    async fn create_bucket(&self) -> Result<()> {
        let project = self.auth.project_id().await.map_err(|e| Error::RepositoryConfiguration {
            message: format!("cannot determine GCP project to create bucket {}: {}", self.bucket, e),
        })?;

        let mut url = api_url(&["storage", "v1", "b"])?;
        url.query_pairs_mut().append_pair("project", &project);

        let response = self
            .request(Method::POST, url)
            .await?
            .json(&serde_json::json!({ "name": self.bucket }))
            .send()
            .await
            .map_err(|e| Error::RepositoryConfiguration {
                message: format!("failed to create bucket {}: {}", self.bucket, e),
            })?;

        match response.status() {
            status if status.is_success() => {
                info!(bucket = %self.bucket, %project, "Created bucket");
                Ok(())
            }
            // Lost a creation race with another daemon
            StatusCode::CONFLICT => Ok(()),
            status => Err(Error::RepositoryConfiguration {
                message: format!(
                    "failed to create bucket {}: {} {}",
                    self.bucket,
                    status,
                    response.text().await.unwrap_or_default()
                ),
            }),
        }
    }

    async fn upload(&self, path: &str, body: Body) -> Result<()> {
        let mut url = api_url(&["upload", "storage", "v1", "b", &self.bucket, "o"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", &self.object_key(path));

        let response = self
            .request(Method::POST, url)
            .await?
            .body(body)
            .send()
            .await
            .map_err(transport)?;
        check(response, path, |m| Error::write(path, m)).await?;
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Response> {
        let mut url = object_url(&self.bucket, &self.object_key(path))?;
        url.query_pairs_mut().append_pair("alt", "media");

        let response = self
            .request(Method::GET, url)
            .await?
            .send()
            .await
            .map_err(transport)?;
        check(response, path, |m| Error::read(path, m)).await
    }

    async fn list_names(&self, prefix: &str, delimiter: Option<&str>) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = api_url(&["storage", "v1", "b", &self.bucket, "o"])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", prefix);
                if let Some(delimiter) = delimiter {
                    query.append_pair("delimiter", delimiter);
                }
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }

            let response = self
                .request(Method::GET, url)
                .await?
                .send()
                .await
                .map_err(transport)?;
            let response = match check(response, prefix, |m| Error::read(prefix, m)).await {
                Ok(response) => response,
                Err(e) if e.is_does_not_exist() => return Ok(names),
                Err(e) => return Err(e),
            };
            let page: ObjectList = response.json().await.map_err(transport)?;
            names.extend(page.items.into_iter().map(|item| item.name));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(names)
    }

    /// Delete a single object; absent objects count as deleted
    async fn delete_object(&self, path: &str, name: &str) -> Result<()> {
        let url = object_url(&self.bucket, name)?;
        let response = self
            .request(Method::DELETE, url)
            .await?
            .send()
            .await
            .map_err(transport)?;
        match check(response, path, |m| Error::write(path, m)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_does_not_exist() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Repository for GcsRepository {
    fn root_url(&self) -> String {
        if self.root.is_empty() {
            format!("gs://{}", self.bucket)
        } else {
            format!("gs://{}/{}", self.bucket, self.root)
        }
    }

    fn transfers(&self) -> &Semaphore {
        &self.transfers
    }

    #[instrument(skip(self), fields(backend = "gcs", bucket = %self.bucket))]
    async fn get(&self, path: &str) -> Result<Bytes> {
        with_retry(&self.retry, "get", move || async move {
            let response = self.download(path).await?;
            response.bytes().await.map_err(transport)
        })
        .await
        .map_err(|e| read_failure(path, e))
    }

    #[instrument(skip(self, data), fields(backend = "gcs", bucket = %self.bucket, size = data.len()))]
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        let data = &data;
        with_retry(&self.retry, "put", move || async move {
            self.upload(path, Body::from(data.clone())).await
        })
        .await
        .map_err(|e| write_failure(path, e))
    }

    #[instrument(skip(self), fields(backend = "gcs", bucket = %self.bucket))]
    async fn put_file(&self, path: &str, local: &Path) -> Result<()> {
        with_retry(&self.retry, "put_file", move || async move {
            let file = tokio::fs::File::open(local).await?;
            self.upload(path, Body::wrap_stream(ReaderStream::new(file)))
                .await
        })
        .await
        .map_err(|e| write_failure(path, e))
    }

    #[instrument(skip(self), fields(backend = "gcs", bucket = %self.bucket))]
    async fn get_file(&self, path: &str, local: &Path) -> Result<()> {
        with_retry(&self.retry, "get_file", move || async move {
            let response = self.download(path).await?;
            let mut file = tokio::fs::File::create(local).await?;
            let mut body = Box::pin(response.bytes_stream());
            while let Some(chunk) = body.try_next().await.map_err(transport)? {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok(())
        })
        .await
        .map_err(|e| read_failure(path, e))
    }

    #[instrument(skip(self), fields(backend = "gcs", bucket = %self.bucket))]
    async fn exists(&self, path: &str) -> Result<bool> {
        with_retry(&self.retry, "exists", move || async move {
            let url = object_url(&self.bucket, &self.object_key(path))?;
            let response = self
                .request(Method::GET, url)
                .await?
                .send()
                .await
                .map_err(transport)?;
            match check(response, path, |m| Error::read(path, m)).await {
                Ok(_) => Ok(true),
                Err(e) if e.is_does_not_exist() => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| read_failure(path, e))
    }

    #[instrument(skip(self), fields(backend = "gcs", bucket = %self.bucket))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.object_key(prefix.trim_matches('/'));
        let gcs_prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };
        let gcs_prefix = gcs_prefix.as_str();

        let names = with_retry(&self.retry, "list", move || async move {
            self.list_names(gcs_prefix, Some("/")).await
        })
        .await
        .map_err(|e| read_failure(prefix, e))?;

        let mut results: Vec<String> = names
            .iter()
            .filter(|name| !name.ends_with('/'))
            .map(|name| self.relative(name).to_string())
            .collect();
        results.sort();
        debug!(count = results.len(), "Found GCS objects");
        Ok(results)
    }

    #[instrument(skip(self), fields(backend = "gcs", bucket = %self.bucket))]
    async fn delete(&self, path: &str) -> Result<()> {
        let key = self.object_key(path);
        let nested = format!("{}/", key);
        let nested = nested.as_str();

        let mut names = with_retry(&self.retry, "list", move || async move {
            self.list_names(nested, None).await
        })
        .await
        .map_err(|e| write_failure(path, e))?;
        names.push(key);

        stream::iter(names)
            .map(|name| async move {
                let name = name.as_str();
                with_retry(&self.retry, "delete", move || async move {
                    self.delete_object(path, name).await
                })
                .await
            })
            .buffer_unordered(DELETE_CONCURRENCY)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| write_failure(path, e))?;
        Ok(())
    }
}

/// Load credentials, preferring the base64 key from the environment
///
/// A key that fails to decode is reported and ignored.
async fn credentials() -> Result<Arc<dyn TokenProvider>> {
    if let Ok(encoded) = std::env::var(CREDENTIALS_ENV) {
        match decode_service_account(&encoded) {
            Ok(account) => {
                debug!("Using service account from {}", CREDENTIALS_ENV);
                return Ok(Arc::new(account));
            }
            Err(message) => {
                warn!(
                    env = CREDENTIALS_ENV,
                    error = %message,
                    "Ignoring invalid service account key, falling back to ambient credentials"
                );
            }
        }
    }

    gcp_auth::provider()
        .await
        .map_err(|e| Error::RepositoryConfiguration {
            message: format!("no Google Cloud credentials available: {}", e),
        })
}

fn decode_service_account(encoded: &str) -> std::result::Result<CustomServiceAccount, String> {
    let raw = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|e| format!("invalid base64: {}", e))?;
    let json = String::from_utf8(raw).map_err(|e| format!("invalid UTF-8: {}", e))?;
    CustomServiceAccount::from_json(&json).map_err(|e| e.to_string())
}

/// Map a response status to the repository error space
async fn check(
    response: Response,
    path: &str,
    permanent: impl FnOnce(String) -> Error,
) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(Error::does_not_exist(path));
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{} {}", status, body.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(Error::StorageUnavailable {
            backend: BACKEND.to_string(),
            message,
        })
    } else {
        Err(permanent(message))
    }
}

fn transport(err: reqwest::Error) -> Error {
    Error::StorageUnavailable {
        backend: BACKEND.to_string(),
        message: err.to_string(),
    }
}

fn api_url(segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(API_ROOT).map_err(|e| Error::Internal {
        message: format!("invalid API root: {}", e),
    })?;
    url.path_segments_mut()
        .map_err(|_| Error::Internal {
            message: "API root cannot be a base".to_string(),
        })?
        .extend(segments);
    Ok(url)
}

fn bucket_url(bucket: &str) -> Result<Url> {
    api_url(&["storage", "v1", "b", bucket])
}

/// Metadata URL of an object; the name is a single escaped path segment
fn object_url(bucket: &str, name: &str) -> Result<Url> {
    api_url(&["storage", "v1", "b", bucket, "o", name])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_escapes_slashes() {
        let url = object_url("my-bucket", "root/metadata/experiments/a.json").unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/my-bucket/o/root%2Fmetadata%2Fexperiments%2Fa.json"
        );
    }

    #[test]
    fn test_bucket_url() {
        assert_eq!(
            bucket_url("b").unwrap().as_str(),
            "https://storage.googleapis.com/storage/v1/b/b"
        );
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        let err = decode_service_account("not base64!!").unwrap_err();
        assert!(err.contains("invalid base64"));
    }

    #[test]
    fn test_decode_rejects_non_key_json() {
        let encoded = BASE64_STANDARD.encode(r#"{"hello": "world"}"#);
        assert!(decode_service_account(&encoded).is_err());
    }

    #[test]
    fn test_object_list_parsing() {
        let page: ObjectList = serde_json::from_str(
            r#"{"kind": "storage#objects", "items": [{"name": "a.json", "size": "3"}], "nextPageToken": "tok"}"#,
        )
        .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].name, "a.json");
        assert_eq!(page.next_page_token.as_deref(), Some("tok"));

        let empty: ObjectList = serde_json::from_str(r#"{"kind": "storage#objects"}"#).unwrap();
        assert!(empty.items.is_empty());
        assert!(empty.next_page_token.is_none());
    }
}
