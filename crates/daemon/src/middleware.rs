//! Request checks and bookkeeping for the daemon service
//!
//! Provides input validation, per-method request metrics and the mapping
//! between repository errors and gRPC statuses.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Component, Path};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use keepsake_core::{id::ID_LEN, Error, ErrorKind, ParamValue, Result};
use regex::Regex;
use tonic::metadata::MetadataValue;
use tonic::{Code, Status};
use tracing::info;

/// Metadata key carrying the stable error tag of a failed call
pub const ERROR_KIND_KEY: &str = "keepsake-error-kind";

/// Turn a repository error into the status sent to the caller
pub fn error_to_status(error: &Error) -> Status {
    let kind = error.kind();
    let code = match kind {
        ErrorKind::DoesNotExist | ErrorKind::ConfigNotFound => Code::NotFound,
        ErrorKind::Validation => Code::InvalidArgument,
        ErrorKind::ReadError => Code::Unavailable,
        ErrorKind::WriteError => Code::Aborted,
        ErrorKind::RepositoryConfiguration | ErrorKind::IncompatibleRepositoryVersion => {
            Code::FailedPrecondition
        }
        ErrorKind::CorruptedRepositorySpec => Code::DataLoss,
        ErrorKind::Internal => Code::Internal,
    };
    let mut status = Status::new(code, error.to_string());
    status
        .metadata_mut()
        .insert(ERROR_KIND_KEY, MetadataValue::from_static(kind.as_str()));
    status
}

/// Turn a failed call back into an error
///
/// Statuses without a tag (transport failures) are classified by code.
pub fn status_to_error(status: Status) -> Error {
    let kind = match status
        .metadata()
        .get(ERROR_KIND_KEY)
        .and_then(|tag| tag.to_str().ok())
    {
        Some(tag) => ErrorKind::from_tag(tag),
        None => match status.code() {
            Code::NotFound => ErrorKind::DoesNotExist,
            Code::InvalidArgument => ErrorKind::Validation,
            Code::DataLoss => ErrorKind::CorruptedRepositorySpec,
            _ => ErrorKind::Internal,
        },
    };
    Error::Rpc {
        kind,
        message: status.message().to_string(),
    }
}

/// Input validator for daemon requests
pub struct InputValidator {
    /// Maximum path length
    max_path_len: usize,
    /// Maximum param or metric name length
    max_key_len: usize,
    /// Lowercase hex, at most a full ID
    id_pattern: Regex,
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl InputValidator {
    pub fn new() -> Self {
        Self {
            max_path_len: 4096,
            max_key_len: 256,
            id_pattern: Regex::new(&format!("^[0-9a-f]{{1,{}}}$", ID_LEN))
                .unwrap_or_else(|_| unreachable!("ID pattern is a valid regex")),
        }
    }

    /// Validate an experiment or checkpoint ID, or a prefix of one
    pub fn validate_id_prefix(&self, field: &str, prefix: &str) -> Result<()> {
        if prefix.is_empty() {
            return Err(Error::validation(format!("{} cannot be empty", field)));
        }

        if !self.id_pattern.is_match(prefix) {
            return Err(Error::validation(format!(
                "{} must be at most {} lowercase hex characters, got {:?}",
                field, ID_LEN, prefix
            )));
        }

        Ok(())
    }

    /// Validate a source or artifact path relative to the project directory
    pub fn validate_relative_path(&self, path: &str) -> Result<()> {
        self.validate_path(path)?;

        let path = Path::new(path);
        if path.is_absolute() {
            return Err(Error::validation(format!(
                "path {} must be relative to the project directory",
                path.display()
            )));
        }

        if path.components().any(|c| c == Component::ParentDir) {
            return Err(Error::validation(format!(
                "path {} must not leave the project directory",
                path.display()
            )));
        }

        Ok(())
    }

    /// Validate a local filesystem path
    pub fn validate_path(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(Error::validation("path cannot be empty"));
        }

        if path.len() > self.max_path_len {
            return Err(Error::validation(format!(
                "path exceeds maximum length of {} characters",
                self.max_path_len
            )));
        }

        if path.contains('\0') {
            return Err(Error::validation("path contains null bytes"));
        }

        Ok(())
    }

    /// Validate param or metric names
    pub fn validate_names(&self, field: &str, values: &BTreeMap<String, ParamValue>) -> Result<()> {
        for name in values.keys() {
            if name.is_empty() {
                return Err(Error::validation(format!("{} names cannot be empty", field)));
            }
            if name.len() > self.max_key_len {
                return Err(Error::validation(format!(
                    "{} name {:?}... exceeds maximum length of {} characters",
                    field,
                    name.chars().take(32).collect::<String>(),
                    self.max_key_len
                )));
            }
        }
        Ok(())
    }
}

/// Request metrics collector
pub struct RequestMetrics {
    /// Total requests by method
    requests: DashMap<&'static str, AtomicU64>,
    /// Errors by method
    errors: DashMap<&'static str, AtomicU64>,
    /// Recent latencies in microseconds by method
    latencies: DashMap<&'static str, VecDeque<u64>>,
    max_samples: usize,
}

impl Default for RequestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self {
            requests: DashMap::new(),
            errors: DashMap::new(),
            latencies: DashMap::new(),
            max_samples: 1000,
        }
    }

    pub fn record_request(&self, method: &'static str) {
        self.requests
            .entry(method)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, method: &'static str) {
        self.errors
            .entry(method)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, method: &'static str, latency_us: u64) {
        let mut samples = self.latencies.entry(method).or_default();
        if samples.len() >= self.max_samples {
            samples.pop_front();
        }
        samples.push_back(latency_us);
    }

    pub fn request_count(&self, method: &str) -> u64 {
        self.requests
            .get(method)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn error_count(&self, method: &str) -> u64 {
        self.errors
            .get(method)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// p99 latency for a method in microseconds
    pub fn p99_latency(&self, method: &str) -> Option<u64> {
        self.latencies.get(method).and_then(|samples| {
            if samples.is_empty() {
                return None;
            }
            let mut sorted: Vec<_> = samples.iter().copied().collect();
            sorted.sort_unstable();
            let idx = (sorted.len() as f64 * 0.99) as usize;
            sorted.get(idx.min(sorted.len() - 1)).copied()
        })
    }

    /// (requests, errors, p99 latency) by method
    pub fn summary(&self) -> HashMap<&'static str, (u64, u64, Option<u64>)> {
        self.requests
            .iter()
            .map(|entry| {
                let method = *entry.key();
                let requests = entry.value().load(Ordering::Relaxed);
                (
                    method,
                    (requests, self.error_count(method), self.p99_latency(method)),
                )
            })
            .collect()
    }

    pub fn log_summary(&self) {
        let mut summary: Vec<_> = self.summary().into_iter().collect();
        summary.sort_by_key(|(method, _)| *method);
        for (method, (requests, errors, p99)) in summary {
            info!(
                method,
                requests,
                errors,
                p99_latency_us = p99.unwrap_or(0),
                "Request summary"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_error_kind_crosses_the_wire() {
        for kind in ErrorKind::ALL {
            let error = Error::Rpc {
                kind,
                message: format!("failed with {}", kind),
            };
            let decoded = status_to_error(error_to_status(&error));
            assert_eq!(decoded.kind(), kind);
            assert_eq!(decoded.to_string(), format!("failed with {}", kind));
        }
    }

    #[test]
    fn test_status_codes() {
        let status = error_to_status(&Error::AmbiguousPrefix {
            prefix: "ab".to_string(),
            matches: 2,
        });
        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("ambiguous"));

        let status = error_to_status(&Error::IncompatibleRepositoryVersion {
            found: 9,
            supported: 1,
        });
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(
            status.metadata().get(ERROR_KIND_KEY).unwrap().to_str().unwrap(),
            "INCOMPATIBLE_REPOSITORY_VERSION"
        );
    }

    #[test]
    fn test_untagged_status_is_classified_by_code() {
        let error = status_to_error(Status::not_found("gone"));
        assert!(error.is_does_not_exist());

        let error = status_to_error(Status::unavailable("connection refused"));
        assert_eq!(error.kind(), ErrorKind::Internal);
        assert_eq!(error.to_string(), "connection refused");
    }

    #[test]
    fn test_input_validator_id_prefix() {
        let validator = InputValidator::new();

        assert!(validator.validate_id_prefix("experiment ID", "3f2a").is_ok());
        assert!(validator
            .validate_id_prefix("experiment ID", &"a".repeat(64))
            .is_ok());

        assert!(validator.validate_id_prefix("experiment ID", "").is_err());
        assert!(validator.validate_id_prefix("experiment ID", "3F2A").is_err());
        assert!(validator.validate_id_prefix("experiment ID", "../x").is_err());
        assert!(validator
            .validate_id_prefix("experiment ID", &"a".repeat(65))
            .is_err());
    }

    #[test]
    fn test_input_validator_path() {
        let validator = InputValidator::new();

        assert!(validator.validate_relative_path(".").is_ok());
        assert!(validator.validate_relative_path("weights/model.pth").is_ok());
        // Dots inside a name are not traversal
        assert!(validator.validate_relative_path("data..v2").is_ok());

        assert!(validator.validate_relative_path("/etc/passwd").is_err());
        assert!(validator.validate_relative_path("weights/../../etc").is_err());
        assert!(validator.validate_relative_path("file\0.txt").is_err());
        assert!(validator.validate_relative_path("").is_err());

        assert!(validator.validate_path("/tmp/checkout").is_ok());
    }

    #[test]
    fn test_input_validator_names() {
        let validator = InputValidator::new();
        let mut metrics = BTreeMap::new();
        metrics.insert("loss".to_string(), ParamValue::Float(0.1));
        assert!(validator.validate_names("metric", &metrics).is_ok());

        metrics.insert(String::new(), ParamValue::Int(1));
        assert!(validator.validate_names("metric", &metrics).is_err());
    }

    #[test]
    fn test_request_metrics() {
        let metrics = RequestMetrics::new();

        metrics.record_request("CreateCheckpoint");
        metrics.record_request("CreateCheckpoint");
        metrics.record_error("CreateCheckpoint");
        metrics.record_latency("CreateCheckpoint", 1000);
        metrics.record_latency("CreateCheckpoint", 2000);

        assert_eq!(metrics.request_count("CreateCheckpoint"), 2);
        assert_eq!(metrics.error_count("CreateCheckpoint"), 1);
        assert_eq!(metrics.p99_latency("CreateCheckpoint"), Some(2000));
        assert_eq!(metrics.request_count("ListExperiments"), 0);
        assert_eq!(metrics.summary()["CreateCheckpoint"].0, 2);
    }

    #[test]
    fn test_latency_samples_are_bounded() {
        let metrics = RequestMetrics::new();
        for i in 0..1500 {
            metrics.record_latency("GetExperiment", i);
        }
        assert_eq!(metrics.latencies.get("GetExperiment").unwrap().len(), 1000);
    }
}
