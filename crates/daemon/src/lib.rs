//! Keepsake daemon - local RPC server for experiment tracking
//!
//! This crate provides the long-lived process that trainer libraries talk to:
//! - **Experiments**: creation, source snapshots, heartbeats, deletion
//! - **Checkpoints**: artifact snapshots, auto-incremented steps, primary metrics
//! - **Checkout**: restoring recorded trees into a working directory
//! - **Transport**: gRPC over a Unix socket (`proto/keepsake.proto`)
//! - **Security**: input validation, request metrics
//!
//! # Example
//!
//! ```no_run
//! use keepsake_core::DaemonConfig;
//! use keepsake_daemon::{DaemonClient, DaemonServer};
//!
//! # async fn example() -> keepsake_core::Result<()> {
//! let config = DaemonConfig {
//!     repository: Some("file://.keepsake".to_string()),
//!     ..Default::default()
//! };
//! tokio::spawn(DaemonServer::new(config, "/tmp/keepsake.sock").run());
//!
//! let mut client = DaemonClient::connect("/tmp/keepsake.sock").await?;
//! for experiment in client.list_experiments().await? {
//!     println!("{} {}", experiment.short_id(), experiment.command);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod convert;
pub mod middleware;
pub mod server;
pub mod service;

pub mod proto {
    tonic::include_proto!("keepsake");
}

pub use client::DaemonClient;
pub use server::{shutdown_signal, DaemonServer};
pub use service::KeepsakeService;
