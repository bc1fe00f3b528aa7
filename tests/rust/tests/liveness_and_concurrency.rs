//! Heartbeat staleness and concurrent writers on one repository
//!
//! Simulates the two situations a single-process test cannot reach:
//! - A daemon that goes away without stopping its experiment
//! - Two trainers with their own daemons checkpointing at the same time

mod common;

use std::fs;
use std::time::Duration;

use anyhow::Result;
use keepsake_core::{
    checkpoint_tarball_path, heartbeat_metadata_path, ExperimentStatus, ParamValue,
};
use tempfile::TempDir;
use tokio::time::sleep;

use common::{checkpoint_request, config, experiment_request, write_project, TestDaemon};

#[tokio::test]
async fn test_status_goes_stale_when_daemon_dies() -> Result<()> {
    let project = TempDir::new()?;
    let repo = project.path().join("repo");
    let url = format!("file://{}", repo.display());

    let (first, mut client) =
        TestDaemon::start(config(project.path(), Some(url.clone())), project.path().join("a.sock"))
            .await?;
    let experiment = client.create_experiment(experiment_request(None)).await?;
    sleep(Duration::from_millis(150)).await;
    assert_eq!(
        client.get_experiment_status(&experiment.id).await?,
        ExperimentStatus::Running
    );

    // Shutdown cancels heartbeats but keeps the record
    drop(client);
    first.shutdown().await?;
    assert!(repo.join(heartbeat_metadata_path(&experiment.id)).exists());

    let (second, mut client) =
        TestDaemon::start(config(project.path(), Some(url)), project.path().join("b.sock")).await?;

    // refresh 100ms x (miss tolerance 3 + 1)
    sleep(Duration::from_millis(500)).await;
    assert_eq!(
        client.get_experiment_status(&experiment.id).await?,
        ExperimentStatus::Stopped
    );
    assert!(repo.join(heartbeat_metadata_path(&experiment.id)).exists());

    drop(client);
    second.shutdown().await
}

#[tokio::test]
async fn test_stop_experiment_removes_heartbeat() -> Result<()> {
    let project = TempDir::new()?;
    let repo = project.path().join("repo");
    let (daemon, mut client) = TestDaemon::start(
        config(project.path(), Some(format!("file://{}", repo.display()))),
        project.path().join("daemon.sock"),
    )
    .await?;

    let experiment = client.create_experiment(experiment_request(None)).await?;
    sleep(Duration::from_millis(150)).await;
    assert!(repo.join(heartbeat_metadata_path(&experiment.id)).exists());

    client.stop_experiment(&experiment.id).await?;
    assert!(!repo.join(heartbeat_metadata_path(&experiment.id)).exists());
    assert_eq!(
        client.get_experiment_status(&experiment.id).await?,
        ExperimentStatus::Stopped
    );

    // Stopping twice is fine
    client.stop_experiment(&experiment.id).await?;

    drop(client);
    daemon.shutdown().await
}

#[tokio::test]
async fn test_disabled_heartbeat_is_never_running() -> Result<()> {
    let project = TempDir::new()?;
    let (daemon, mut client) = TestDaemon::start(
        config(
            project.path(),
            Some(format!("file://{}", project.path().join("repo").display())),
        ),
        project.path().join("daemon.sock"),
    )
    .await?;

    let mut req = experiment_request(None);
    req.disable_heartbeat = true;
    let experiment = client.create_experiment(req).await?;
    sleep(Duration::from_millis(150)).await;
    assert_eq!(
        client.get_experiment_status(&experiment.id).await?,
        ExperimentStatus::Stopped
    );

    drop(client);
    daemon.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_trainers_share_a_repository() -> Result<()> {
    const CHECKPOINTS: i64 = 15;

    let repo_dir = TempDir::new()?;
    let url = format!("file://{}", repo_dir.path().display());

    let mut trainers = Vec::new();
    for name in ["alpha", "beta"] {
        let url = url.clone();
        trainers.push(tokio::spawn(async move {
            let project = TempDir::new()?;
            write_project(project.path())?;
            let (daemon, mut client) = TestDaemon::start(
                config(project.path(), Some(url)),
                project.path().join(format!("{}.sock", name)),
            )
            .await?;

            let mut req = experiment_request(Some("."));
            req.params = common::values(&[("trainer", ParamValue::String(name.to_string()))]);
            let experiment = client.create_experiment(req).await?;

            for step in 0..CHECKPOINTS {
                fs::write(
                    project.path().join("weights/model.pth"),
                    format!("{}-{}", name, step),
                )?;
                client
                    .create_checkpoint(checkpoint_request(&experiment.id, None, 1.0 / (step + 1) as f64))
                    .await?;
            }

            client.stop_experiment(&experiment.id).await?;
            drop(client);
            daemon.shutdown().await?;
            anyhow::Ok(experiment.id)
        }));
    }

    let mut ids = Vec::new();
    for trainer in trainers {
        ids.push(trainer.await??);
    }

    let verify = TempDir::new()?;
    let (daemon, mut client) =
        TestDaemon::start(config(verify.path(), Some(url)), verify.path().join("v.sock")).await?;
    let experiments = client.list_experiments().await?;
    assert_eq!(experiments.len(), 2);

    for experiment in &experiments {
        assert!(ids.contains(&experiment.id));
        let steps: Vec<_> = experiment.checkpoints.iter().filter_map(|c| c.step).collect();
        assert_eq!(steps, (0..CHECKPOINTS).collect::<Vec<_>>());
        for checkpoint in &experiment.checkpoints {
            assert!(
                repo_dir
                    .path()
                    .join(checkpoint_tarball_path(&checkpoint.id))
                    .exists(),
                "missing tarball for checkpoint {}",
                checkpoint.short_id()
            );
        }
        assert_eq!(
            client.get_experiment_status(&experiment.id).await?,
            ExperimentStatus::Stopped
        );
    }

    drop(client);
    daemon.shutdown().await
}
