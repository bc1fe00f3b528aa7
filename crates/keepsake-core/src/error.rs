//! Error types for the experiment tracking engine

use std::fmt;

use thiserror::Error;

/// Result type alias using the core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type shared by the repository, metadata store and daemon
#[derive(Error, Debug)]
pub enum Error {
    // Lookup errors
    #[error("Does not exist: {path}")]
    DoesNotExist { path: String },

    #[error("Prefix {prefix} is ambiguous: it matches {matches} records")]
    AmbiguousPrefix { prefix: String, matches: usize },

    // Repository transport errors
    #[error("Failed to read {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Failed to write {path}: {message}")]
    WriteError { path: String, message: String },

    #[error("Storage backend unavailable: {backend} - {message}")]
    StorageUnavailable { backend: String, message: String },

    // Repository configuration errors
    #[error("Repository configuration error: {message}")]
    RepositoryConfiguration { message: String },

    #[error(
        "Repository version {found} is newer than this daemon supports ({supported}); upgrade keepsake"
    )]
    IncompatibleRepositoryVersion { found: u32, supported: u32 },

    #[error("Repository spec at repository.json is corrupted: {message}")]
    CorruptedRepositorySpec { message: String },

    #[error("Config not found: {message}")]
    ConfigNotFound { message: String },

    // Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Archive entry escapes destination: {path}")]
    UnsafeArchivePath { path: String },

    #[error("Checkout would overwrite modified files:\n{summary}")]
    CheckoutConflict { summary: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Wire protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Error decoded from a daemon reply
    #[error("{message}")]
    Rpc { kind: ErrorKind, message: String },

    // Cancellation and timeout errors
    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Operation timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Stable error classification carried across the RPC boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DoesNotExist,
    ReadError,
    WriteError,
    RepositoryConfiguration,
    IncompatibleRepositoryVersion,
    CorruptedRepositorySpec,
    ConfigNotFound,
    Validation,
    Internal,
}

impl ErrorKind {
    /// All kinds, in tag order
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::DoesNotExist,
        ErrorKind::ReadError,
        ErrorKind::WriteError,
        ErrorKind::RepositoryConfiguration,
        ErrorKind::IncompatibleRepositoryVersion,
        ErrorKind::CorruptedRepositorySpec,
        ErrorKind::ConfigNotFound,
        ErrorKind::Validation,
        ErrorKind::Internal,
    ];

    /// Wire tag for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DoesNotExist => "DOES_NOT_EXIST",
            ErrorKind::ReadError => "READ_ERROR",
            ErrorKind::WriteError => "WRITE_ERROR",
            ErrorKind::RepositoryConfiguration => "REPOSITORY_CONFIGURATION_ERROR",
            ErrorKind::IncompatibleRepositoryVersion => "INCOMPATIBLE_REPOSITORY_VERSION",
            ErrorKind::CorruptedRepositorySpec => "CORRUPTED_REPOSITORY_SPEC",
            ErrorKind::ConfigNotFound => "CONFIG_NOT_FOUND",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// Parse a wire tag. Unknown tags are treated as internal errors.
    pub fn from_tag(tag: &str) -> ErrorKind {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == tag)
            .unwrap_or(ErrorKind::Internal)
    }

    /// Process exit code used by command-line front-ends
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::DoesNotExist => 1,
            ErrorKind::WriteError => 2,
            ErrorKind::IncompatibleRepositoryVersion => 3,
            _ => 4,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Stable classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DoesNotExist { .. } | Error::AmbiguousPrefix { .. } => ErrorKind::DoesNotExist,
            Error::ReadError { .. } => ErrorKind::ReadError,
            Error::WriteError { .. } | Error::CheckoutConflict { .. } => ErrorKind::WriteError,
            Error::RepositoryConfiguration { .. } => ErrorKind::RepositoryConfiguration,
            Error::IncompatibleRepositoryVersion { .. } => {
                ErrorKind::IncompatibleRepositoryVersion
            }
            Error::CorruptedRepositorySpec { .. } => ErrorKind::CorruptedRepositorySpec,
            Error::ConfigNotFound { .. } => ErrorKind::ConfigNotFound,
            Error::Validation { .. } | Error::UnsafeArchivePath { .. } => ErrorKind::Validation,
            Error::Rpc { kind, .. } => *kind,
            Error::StorageUnavailable { .. }
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Protocol { .. }
            | Error::Cancelled { .. }
            | Error::Timeout { .. }
            | Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns true if this error indicates the path or record is absent
    pub fn is_does_not_exist(&self) -> bool {
        matches!(self, Error::DoesNotExist { .. })
            || matches!(
                self,
                Error::Rpc {
                    kind: ErrorKind::DoesNotExist,
                    ..
                }
            )
    }

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StorageUnavailable { .. } | Error::Timeout { .. }
        )
    }

    /// Returns a retry delay hint in milliseconds, if applicable
    pub fn retry_delay_hint_ms(&self) -> Option<u64> {
        match self {
            Error::StorageUnavailable { .. } => Some(100),
            Error::Timeout { .. } => Some(1000),
            _ => None,
        }
    }

    /// Shorthand for a `DoesNotExist` error on `path`
    pub fn does_not_exist(path: impl Into<String>) -> Self {
        Error::DoesNotExist { path: path.into() }
    }

    /// Shorthand for a `ReadError` on `path`
    pub fn read(path: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::ReadError {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Shorthand for a `WriteError` on `path`
    pub fn write(path: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::WriteError {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Shorthand for a `Validation` error
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
