//! Keepsake Core - Foundation for the experiment tracking daemon
//!
//! Provides the repository records, error handling, timestamp codec,
//! identifiers and configuration shared by the storage, tracking and
//! daemon crates.

pub mod config;
pub mod error;
pub mod id;
pub mod time;
pub mod types;
pub mod value;

pub use config::{DaemonConfig, HeartbeatConfig, ProjectConfig, RetryConfig, ServerConfig, StorageConfig};
pub use error::{Error, ErrorKind, Result};
pub use types::*;
pub use value::ParamValue;
