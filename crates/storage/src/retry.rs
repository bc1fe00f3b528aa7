//! Exponential backoff for object store calls

use std::future::Future;

use keepsake_core::{Error, Result, RetryConfig};
use tracing::warn;

/// Execute an async operation, retrying transient failures
///
/// Only errors that report [`Error::is_retryable`] are retried. The final
/// transient error is returned unchanged so callers can classify it.
pub async fn with_retry<T, F, Fut>(policy: &RetryConfig, operation: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(
                    %operation,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Turn an exhausted transient failure into a read error on `path`
pub fn read_failure(path: &str, err: Error) -> Error {
    match err {
        Error::StorageUnavailable { backend, message } => {
            Error::read(path, format!("{} unavailable: {}", backend, message))
        }
        other => other,
    }
}

/// Turn an exhausted transient failure into a write error on `path`
pub fn write_failure(path: &str, err: Error) -> Error {
    match err {
        Error::StorageUnavailable { backend, message } => {
            Error::write(path, format!("{} unavailable: {}", backend, message))
        }
        other => other,
    }
}
