//! Shared harness: a daemon served on a socket inside a temp directory

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

use anyhow::Result;
use keepsake_core::{DaemonConfig, HeartbeatConfig, ParamValue, ServerConfig};
use keepsake_daemon::convert::param_to_proto;
use keepsake_daemon::proto::{self, ParamType};
use keepsake_daemon::{DaemonClient, DaemonServer};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

static TRACING: Once = Once::new();

/// Route daemon logs into the test output
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

pub struct TestDaemon {
    pub socket: PathBuf,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<keepsake_core::Result<()>>>,
}

impl TestDaemon {
    /// Start a daemon for `project_dir` and wait until it accepts connections
    pub async fn start(config: DaemonConfig, socket: PathBuf) -> Result<(Self, DaemonClient)> {
        init_tracing();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(DaemonServer::new(config, socket.clone()).run_until(async {
            let _ = stopped.await;
        }));
        let client = DaemonClient::connect(&socket).await?;
        Ok((
            Self {
                socket,
                stop: Some(stop),
                handle: Some(handle),
            },
            client,
        ))
    }

    /// Signal shutdown and wait for the server to finish
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.await??;
        }
        Ok(())
    }
}

/// Daemon config for a project, with fast heartbeats and a short drain
pub fn config(project_dir: &Path, repository: Option<String>) -> DaemonConfig {
    DaemonConfig {
        repository,
        project_dir: project_dir.to_path_buf(),
        heartbeat: HeartbeatConfig {
            refresh_interval: Duration::from_millis(100),
            miss_tolerance: 3,
        },
        server: ServerConfig {
            shutdown_grace: Duration::from_secs(2),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A small training project: a script and a weights directory
pub fn write_project(dir: &Path) -> Result<()> {
    std::fs::write(dir.join("train.py"), "import keepsake\ntrain()\n")?;
    std::fs::create_dir_all(dir.join("weights"))?;
    std::fs::write(dir.join("weights/model.pth"), "epoch-0")?;
    Ok(())
}

pub fn values(pairs: &[(&str, ParamValue)]) -> HashMap<String, ParamType> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), param_to_proto(value)))
        .collect()
}

pub fn experiment_request(path: Option<&str>) -> proto::CreateExperimentRequest {
    proto::CreateExperimentRequest {
        path: path.map(String::from),
        params: values(&[("lr", ParamValue::Float(0.01))]),
        command: "train.py".to_string(),
        python_version: "3.11.4".to_string(),
        user: "tester".to_string(),
        quiet: true,
        ..Default::default()
    }
}

pub fn checkpoint_request(
    experiment_id: &str,
    step: Option<i64>,
    loss: f64,
) -> proto::CreateCheckpointRequest {
    proto::CreateCheckpointRequest {
        experiment_id: experiment_id.to_string(),
        path: Some("weights".to_string()),
        step,
        metrics: values(&[("loss", ParamValue::Float(loss))]),
        primary_metric: Some(proto::PrimaryMetric {
            name: "loss".to_string(),
            goal: "minimize".to_string(),
        }),
        quiet: true,
    }
}

/// Files under `dir`, relative and sorted
pub fn files_under(dir: &Path) -> Vec<String> {
    if !dir.exists() {
        return Vec::new();
    }
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        if let Ok(entries) = std::fs::read_dir(&current) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(dir) {
                    files.push(relative.to_string_lossy().into_owned());
                }
            }
        }
    }
    files.sort();
    files
}
