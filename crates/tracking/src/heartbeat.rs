//! Liveness records for running experiments
//!
//! Each live experiment owned by a daemon gets one background task that
//! rewrites `metadata/heartbeats/<id>.json` every refresh interval. Readers
//! decide whether an experiment is running from the age of that record.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use keepsake_core::{
    heartbeat_metadata_path, time, ExperimentId, ExperimentStatus, Heartbeat, HeartbeatConfig,
    Result,
};
use keepsake_storage::Repository;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct RunningHeartbeat {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the heartbeat tasks of one daemon
pub struct HeartbeatService {
    repository: Arc<dyn Repository>,
    config: HeartbeatConfig,
    tasks: DashMap<ExperimentId, RunningHeartbeat>,
}

impl HeartbeatService {
    pub fn new(repository: Arc<dyn Repository>, config: HeartbeatConfig) -> Self {
        Self {
            repository,
            config,
            tasks: DashMap::new(),
        }
    }

    /// Start refreshing the heartbeat of `experiment_id`
    ///
    /// Starting an experiment that already has a task is a no-op.
    pub fn start(&self, experiment_id: &str) {
        let Entry::Vacant(slot) = self.tasks.entry(experiment_id.to_string()) else {
            return;
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            self.repository.clone(),
            experiment_id.to_string(),
            self.config.refresh_interval,
            cancel.clone(),
        ));
        slot.insert(RunningHeartbeat { cancel, task });
        debug!(experiment_id, "Started heartbeat");
    }

    /// Stop the heartbeat and delete its record
    ///
    /// Stopping an experiment without a record succeeds.
    pub async fn stop(&self, experiment_id: &str) -> Result<()> {
        self.cancel(experiment_id).await;
        match self
            .repository
            .delete(&heartbeat_metadata_path(experiment_id))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_does_not_exist() => {}
            Err(e) => return Err(e),
        }
        info!(experiment_id, "Stopped heartbeat");
        Ok(())
    }

    /// Stop refreshing without deleting the record
    ///
    /// The record goes stale and readers see the experiment as stopped once
    /// the staleness threshold passes.
    pub async fn abandon(&self, experiment_id: &str) {
        self.cancel(experiment_id).await;
    }

    /// Cancel every heartbeat task, leaving records in place
    pub async fn shutdown(&self) {
        let ids: Vec<ExperimentId> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.cancel(id).await;
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "Cancelled heartbeats");
        }
    }

    /// Returns true if this daemon is refreshing `experiment_id`
    pub fn is_tracking(&self, experiment_id: &str) -> bool {
        self.tasks.contains_key(experiment_id)
    }

    /// Status of `experiment_id` as seen through its heartbeat record
    pub async fn status(&self, experiment_id: &str) -> Result<ExperimentStatus> {
        let running = experiment_is_running(
            self.repository.as_ref(),
            experiment_id,
            self.config.staleness_threshold(),
        )
        .await?;
        Ok(if running {
            ExperimentStatus::Running
        } else {
            ExperimentStatus::Stopped
        })
    }

    async fn cancel(&self, experiment_id: &str) {
        if let Some((_, running)) = self.tasks.remove(experiment_id) {
            running.cancel.cancel();
            if let Err(e) = running.task.await {
                warn!(experiment_id, error = %e, "Heartbeat task ended abnormally");
            }
        }
    }
}

/// Decide liveness from the heartbeat record of `experiment_id`
///
/// Absent or malformed records mean the experiment is not running.
pub async fn experiment_is_running(
    repository: &dyn Repository,
    experiment_id: &str,
    threshold: Duration,
) -> Result<bool> {
    let data = match repository.get(&heartbeat_metadata_path(experiment_id)).await {
        Ok(data) => data,
        Err(e) if e.is_does_not_exist() => return Ok(false),
        Err(e) => return Err(e),
    };
    let heartbeat: Heartbeat = match serde_json::from_slice(&data) {
        Ok(heartbeat) => heartbeat,
        Err(e) => {
            debug!(experiment_id, error = %e, "Ignoring malformed heartbeat");
            return Ok(false);
        }
    };
    Ok(is_fresh(&heartbeat, time::now(), threshold))
}

/// Returns true if `heartbeat` is younger than `threshold` at `now`
pub fn is_fresh(heartbeat: &Heartbeat, now: DateTime<Utc>, threshold: Duration) -> bool {
    let Ok(threshold) = chrono::Duration::from_std(threshold) else {
        return true;
    };
    now.signed_duration_since(heartbeat.last_heartbeat) < threshold
}

async fn run(
    repository: Arc<dyn Repository>,
    experiment_id: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let path = heartbeat_metadata_path(&experiment_id);
    let mut last: Option<DateTime<Utc>> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = beat(repository.as_ref(), &experiment_id, &path, &mut last) => {
                if let Err(e) = result {
                    warn!(experiment_id = %experiment_id, error = %e, "Failed to write heartbeat");
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!(experiment_id = %experiment_id, "Heartbeat task stopped");
}

async fn beat(
    repository: &dyn Repository,
    experiment_id: &str,
    path: &str,
    last: &mut Option<DateTime<Utc>>,
) -> Result<()> {
    // Never move backwards, even if the wall clock does
    let now = match *last {
        Some(previous) => previous.max(time::now()),
        None => time::now(),
    };
    let heartbeat = Heartbeat {
        experiment_id: experiment_id.to_string(),
        last_heartbeat: now,
    };
    repository
        .put(path, Bytes::from(serde_json::to_vec(&heartbeat)?))
        .await?;
    *last = Some(now);
    Ok(())
}
