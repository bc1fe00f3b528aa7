//! End-to-end daemon scenarios over a real Unix socket
//!
//! Each test starts a daemon on a file:// repository inside a temp
//! directory and drives it through `DaemonClient`:
//! - Create, list and get with checkpoints
//! - Delete cascade
//! - Checkout into fresh and populated directories
//! - Repository version gate
//! - Prefix resolution

mod common;

use std::fs;

use anyhow::Result;
use keepsake_core::{
    experiment_metadata_path, ErrorKind, Experiment, ParamValue, EXPERIMENT_METADATA_DIR,
    HEARTBEAT_METADATA_DIR,
};
use keepsake_daemon::{DaemonClient, DaemonServer};
use tempfile::TempDir;

use common::{checkpoint_request, config, experiment_request, files_under, write_project, TestDaemon};

/// Project with a keepsake.yaml pointing at `.keepsake`, an experiment and three checkpoints
async fn recorded_project() -> Result<(TempDir, TestDaemon, DaemonClient, Experiment)> {
    let project = TempDir::new()?;
    write_project(project.path())?;
    fs::write(
        project.path().join("keepsake.yaml"),
        "repository: file://.keepsake\n",
    )?;

    let (daemon, mut client) =
        TestDaemon::start(config(project.path(), None), project.path().join("daemon.sock")).await?;

    let experiment = client.create_experiment(experiment_request(Some("."))).await?;
    for (step, loss) in [(0, 0.9), (1, 0.5), (2, 0.1)] {
        fs::write(
            project.path().join("weights/model.pth"),
            format!("epoch-{}", step),
        )?;
        client
            .create_checkpoint(checkpoint_request(&experiment.id, Some(step), loss))
            .await?;
    }

    let experiment = client.get_experiment(&experiment.id).await?;
    Ok((project, daemon, client, experiment))
}

#[tokio::test]
async fn test_create_list_get() -> Result<()> {
    let (project, daemon, mut client, experiment) = recorded_project().await?;

    assert!(project
        .path()
        .join(".keepsake")
        .join(experiment_metadata_path(&experiment.id))
        .exists());

    let experiments = client.list_experiments().await?;
    assert_eq!(experiments.len(), 1);
    let listed = &experiments[0];
    assert_eq!(listed.id, experiment.id);
    assert_eq!(listed.params["lr"], ParamValue::Float(0.01));
    assert_eq!(listed.user, "tester");

    let steps: Vec<_> = listed.checkpoints.iter().map(|c| c.step).collect();
    assert_eq!(steps, vec![Some(0), Some(1), Some(2)]);
    assert!(listed
        .checkpoints
        .iter()
        .all(|c| c.experiment_id == experiment.id));

    let best = listed.best().expect("best checkpoint");
    assert_eq!(best.metrics["loss"], ParamValue::Float(0.1));
    assert_eq!(listed.latest().and_then(|c| c.step), Some(2));

    let by_prefix = client.get_experiment(&experiment.id[..7]).await?;
    assert_eq!(by_prefix, *listed);

    daemon.shutdown().await
}

#[tokio::test]
async fn test_delete_cascade() -> Result<()> {
    let (project, daemon, mut client, experiment) = recorded_project().await?;
    let repo = project.path().join(".keepsake");
    assert!(!files_under(&repo.join("checkpoints")).is_empty());

    client.delete_experiment(&experiment.id).await?;

    for dir in [EXPERIMENT_METADATA_DIR, HEARTBEAT_METADATA_DIR, "checkpoints", "experiments"] {
        let leftovers: Vec<_> = files_under(&repo.join(dir))
            .into_iter()
            .filter(|f| {
                f.contains(&experiment.id)
                    || experiment.checkpoints.iter().any(|c| f.contains(&c.id))
            })
            .collect();
        assert!(leftovers.is_empty(), "{} still holds {:?}", dir, leftovers);
    }
    assert!(client.list_experiments().await?.is_empty());

    let err = client.delete_experiment(&experiment.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DoesNotExist);

    daemon.shutdown().await
}

#[tokio::test]
async fn test_checkout_refuses_then_forces() -> Result<()> {
    let (_project, daemon, mut client, experiment) = recorded_project().await?;
    let out = TempDir::new()?;
    let out_dir = out.path().to_string_lossy().into_owned();
    let last = &experiment.checkpoints[2];

    let reply = client.checkout_checkpoint(&last.id[..8], &out_dir, false).await?;
    assert_eq!(reply.experiment_id, experiment.id);
    assert_eq!(reply.checkpoint_id.as_deref(), Some(last.id.as_str()));
    assert_eq!(fs::read_to_string(out.path().join("train.py"))?, "import keepsake\ntrain()\n");
    assert_eq!(fs::read_to_string(out.path().join("weights/model.pth"))?, "epoch-2");

    fs::write(out.path().join("weights/model.pth"), "edited by hand")?;
    let err = client
        .checkout_checkpoint(&last.id[..8], &out_dir, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteError);
    assert!(err.to_string().contains("weights/model.pth"));
    assert_eq!(fs::read_to_string(out.path().join("weights/model.pth"))?, "edited by hand");

    client.checkout_checkpoint(&last.id[..8], &out_dir, true).await?;
    assert_eq!(fs::read_to_string(out.path().join("weights/model.pth"))?, "epoch-2");

    daemon.shutdown().await
}

#[tokio::test]
async fn test_checkout_of_experiment_uses_latest_checkpoint() -> Result<()> {
    let (_project, daemon, mut client, experiment) = recorded_project().await?;
    let out = TempDir::new()?;

    let reply = client
        .checkout_checkpoint(&experiment.id[..8], &out.path().to_string_lossy(), false)
        .await?;
    assert_eq!(
        reply.checkpoint_id.as_deref(),
        Some(experiment.checkpoints[2].id.as_str())
    );
    assert_eq!(fs::read_to_string(out.path().join("weights/model.pth"))?, "epoch-2");

    daemon.shutdown().await
}

#[tokio::test]
async fn test_deleted_checkpoint_stays_listed_but_cannot_be_checked_out() -> Result<()> {
    let (_project, daemon, mut client, experiment) = recorded_project().await?;
    let first = &experiment.checkpoints[0];

    client.delete_checkpoint(&first.id).await?;

    let reloaded = client.get_experiment(&experiment.id).await?;
    assert_eq!(reloaded.checkpoints.len(), 3);

    let out = TempDir::new()?;
    let err = client
        .checkout_checkpoint(&first.id, &out.path().to_string_lossy(), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DoesNotExist);
    assert!(files_under(out.path()).is_empty());

    daemon.shutdown().await
}

#[tokio::test]
async fn test_version_gate_leaves_no_socket() -> Result<()> {
    let project = TempDir::new()?;
    let repo = project.path().join("repo");
    fs::create_dir_all(&repo)?;
    fs::write(repo.join("repository.json"), r#"{"version": 99999}"#)?;
    let socket = project.path().join("daemon.sock");

    let err = DaemonServer::new(
        config(project.path(), Some(format!("file://{}", repo.display()))),
        &socket,
    )
    .run_until(std::future::pending())
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::IncompatibleRepositoryVersion);
    assert_eq!(err.kind().exit_code(), 3);
    assert!(!socket.exists());
    Ok(())
}

#[tokio::test]
async fn test_corrupted_repository_spec() -> Result<()> {
    let project = TempDir::new()?;
    let repo = project.path().join("repo");
    fs::create_dir_all(&repo)?;
    fs::write(repo.join("repository.json"), "{not json")?;

    let err = DaemonServer::new(
        config(project.path(), Some(format!("file://{}", repo.display()))),
        project.path().join("daemon.sock"),
    )
    .run_until(std::future::pending())
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptedRepositorySpec);
    Ok(())
}

#[tokio::test]
async fn test_prefix_resolution() -> Result<()> {
    let project = TempDir::new()?;
    let repo = project.path().join("repo");
    let (daemon, mut client) = TestDaemon::start(
        config(project.path(), Some(format!("file://{}", repo.display()))),
        project.path().join("daemon.sock"),
    )
    .await?;

    let template = client.create_experiment(experiment_request(None)).await?;
    client.stop_experiment(&template.id).await?;
    client.delete_experiment(&template.id).await?;

    for last in ['1', '2'] {
        let mut experiment = template.clone();
        experiment.id = format!("{}{}", "a".repeat(63), last);
        client.save_experiment(&experiment, true).await?;
    }

    let unique = client.get_experiment(&format!("{}2", "a".repeat(63))).await?;
    assert!(unique.id.ends_with('2'));

    let ambiguous = client.get_experiment("aaaa").await.unwrap_err();
    assert_eq!(ambiguous.kind(), ErrorKind::DoesNotExist);
    assert!(ambiguous.to_string().contains("ambiguous"));

    let missing = client.get_experiment("bbbb").await.unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::DoesNotExist);

    let invalid = client.get_experiment("not-hex").await.unwrap_err();
    assert_eq!(invalid.kind(), ErrorKind::Validation);

    daemon.shutdown().await
}

#[tokio::test]
async fn test_auto_increment_step_over_rpc() -> Result<()> {
    let project = TempDir::new()?;
    write_project(project.path())?;
    let (daemon, mut client) = TestDaemon::start(
        config(
            project.path(),
            Some(format!("file://{}", project.path().join("repo").display())),
        ),
        project.path().join("daemon.sock"),
    )
    .await?;

    let experiment = client.create_experiment(experiment_request(None)).await?;
    let mut steps = Vec::new();
    for step in [None, None, None, Some(7), None] {
        let mut req = checkpoint_request(&experiment.id, step, 0.5);
        req.path = None;
        steps.push(client.create_checkpoint(req).await?.step);
    }
    assert_eq!(steps, vec![Some(0), Some(1), Some(2), Some(7), Some(8)]);

    daemon.shutdown().await
}
