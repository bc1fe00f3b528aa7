//! Experiment tracking on top of a repository
//!
//! Provides the metadata store, per-experiment heartbeats and checkout of
//! recorded source and artifact trees.

pub mod checkout;
pub mod heartbeat;
pub mod store;

pub use checkout::{checkout, CheckoutSummary};
pub use heartbeat::{experiment_is_running, HeartbeatService};
pub use store::{MetadataStore, Resolved};
