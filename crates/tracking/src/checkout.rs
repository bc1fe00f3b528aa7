//! Reproduce an experiment's files on the local filesystem
//!
//! Tarballs are extracted into a staging directory inside the output
//! directory first, then compared with what is already there. Nothing in
//! the output directory changes unless every staged file can be placed.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use keepsake_core::{
    checkpoint_tarball_path, experiment_tarball_path, Checkpoint, Error, Experiment, Result,
};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::store::{MetadataStore, Resolved};

/// Conflicting paths listed in a refusal before the rest are counted
const MAX_LISTED_CONFLICTS: usize = 20;

/// Result of a checkout
#[derive(Debug, Clone)]
pub struct CheckoutSummary {
    pub experiment_id: String,
    pub checkpoint_id: Option<String>,
    /// Files written, relative to the output directory
    pub files: Vec<PathBuf>,
}

/// Check out the experiment or checkpoint named by `prefix` into `output_dir`
///
/// An experiment prefix restores its source tree and latest checkpoint; a
/// checkpoint prefix restores its experiment's source tree overlaid with the
/// checkpoint's artifacts.
///
/// # Errors
/// `DoesNotExist` when the prefix matches nothing or a tarball is gone,
/// `CheckoutConflict` when existing files differ and `force` is not set
pub async fn checkout(
    store: &MetadataStore,
    prefix: &str,
    output_dir: &Path,
    force: bool,
) -> Result<CheckoutSummary> {
    let (experiment, checkpoint) = match store.resolve(prefix, true).await? {
        Resolved::Experiment(experiment) => {
            let latest = experiment.latest().cloned();
            (experiment, latest)
        }
        Resolved::Checkpoint(experiment, checkpoint) => (experiment, Some(checkpoint)),
    };

    tokio::fs::create_dir_all(output_dir).await?;
    let staging = tempfile::Builder::new()
        .prefix(".keepsake-checkout-")
        .tempdir_in(output_dir)?;

    extract(store, &experiment, checkpoint.as_ref(), staging.path()).await?;

    let staging_path = staging.path().to_path_buf();
    let output = output_dir.to_path_buf();
    let files = tokio::task::spawn_blocking(move || place(&staging_path, &output, force))
        .await
        .map_err(|e| Error::Internal {
            message: format!("checkout task failed: {}", e),
        })??;
    drop(staging);

    info!(
        experiment_id = %experiment.short_id(),
        checkpoint_id = checkpoint.as_ref().map(|c| c.short_id()).unwrap_or(""),
        output_dir = %output_dir.display(),
        files = files.len(),
        "Checked out"
    );
    Ok(CheckoutSummary {
        experiment_id: experiment.id.clone(),
        checkpoint_id: checkpoint.map(|c| c.id),
        files,
    })
}

/// Download the source tarball, then the checkpoint tarball over it
async fn extract(
    store: &MetadataStore,
    experiment: &Experiment,
    checkpoint: Option<&Checkpoint>,
    staging: &Path,
) -> Result<()> {
    let repository = store.repository();
    if experiment.path.is_some() {
        repository
            .get_path_tar(&experiment_tarball_path(&experiment.id), staging, true)
            .await?;
    }
    if let Some(checkpoint) = checkpoint {
        if checkpoint.path.is_some() {
            repository
                .get_path_tar(&checkpoint_tarball_path(&checkpoint.id), staging, true)
                .await?;
        }
    }
    Ok(())
}

/// Move staged files into `output`, refusing to clobber modified files
fn place(staging: &Path, output: &Path, force: bool) -> Result<Vec<PathBuf>> {
    let mut staged = Vec::new();
    for entry in WalkDir::new(staging).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(io::Error::other(e)))?;
        if entry.file_type().is_file() {
            if let Ok(relative) = entry.path().strip_prefix(staging) {
                staged.push(relative.to_path_buf());
            }
        }
    }

    let mut conflicts = Vec::new();
    for relative in &staged {
        let target = output.join(relative);
        if target.is_dir() {
            return Err(Error::write(
                target.display().to_string(),
                "a directory is in the way",
            ));
        }
        if target.exists() && !same_contents(&staging.join(relative), &target)? {
            conflicts.push(relative.clone());
        }
    }

    if !conflicts.is_empty() {
        if !force {
            return Err(Error::CheckoutConflict {
                summary: conflict_summary(&conflicts),
            });
        }
        debug!(count = conflicts.len(), "Overwriting modified files");
    }

    // Directories first, so a blocked parent fails before any file moves
    for relative in &staged {
        if let Some(parent) = output.join(relative).parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::write(parent.display().to_string(), e))?;
        }
    }
    for relative in &staged {
        let target = output.join(relative);
        fs::rename(staging.join(relative), &target)
            .map_err(|e| Error::write(target.display().to_string(), e))?;
    }
    Ok(staged)
}

fn same_contents(a: &Path, b: &Path) -> Result<bool> {
    let (meta_a, meta_b) = (fs::metadata(a)?, fs::metadata(b)?);
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }

    let mut file_a = io::BufReader::new(fs::File::open(a)?);
    let mut file_b = io::BufReader::new(fs::File::open(b)?);
    let mut buf_a = [0u8; 8192];
    let mut buf_b = [0u8; 8192];
    loop {
        let n = file_a.read(&mut buf_a)?;
        if n == 0 {
            return Ok(true);
        }
        file_b.read_exact(&mut buf_b[..n])?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}

/// Human-readable list of files a checkout would overwrite
pub fn conflict_summary(conflicts: &[PathBuf]) -> String {
    let mut lines: Vec<String> = conflicts
        .iter()
        .take(MAX_LISTED_CONFLICTS)
        .map(|path| format!("  modified: {}", path.display()))
        .collect();
    if conflicts.len() > MAX_LISTED_CONFLICTS {
        lines.push(format!(
            "  ... and {} more",
            conflicts.len() - MAX_LISTED_CONFLICTS
        ));
    }
    lines.push("Re-run with force to overwrite them.".to_string());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use keepsake_core::{id, time};
    use keepsake_storage::{DiskRepository, Repository};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _repo_dir: TempDir,
        project: TempDir,
        store: MetadataStore,
        experiment: Experiment,
    }

    async fn fixture() -> Fixture {
        let repo_dir = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let repository: Arc<dyn Repository> = Arc::new(DiskRepository::new(repo_dir.path(), 4));
        let store = MetadataStore::new(repository.clone(), 4);

        fs::write(project.path().join("train.py"), "train()").unwrap();
        fs::create_dir_all(project.path().join("weights")).unwrap();
        fs::write(project.path().join("weights/model.pth"), "epoch-1").unwrap();

        let mut experiment = Experiment {
            id: id::random_id(),
            created: time::now(),
            params: BTreeMap::new(),
            user: String::new(),
            host: String::new(),
            command: "train.py".to_string(),
            config: Default::default(),
            path: Some(".".to_string()),
            python_packages: BTreeMap::new(),
            python_version: String::new(),
            keepsake_version: String::new(),
            checkpoints: Vec::new(),
        };
        repository
            .put_path_tar(
                project.path(),
                &experiment_tarball_path(&experiment.id),
                ".",
            )
            .await
            .unwrap();

        for epoch in 1..=2 {
            fs::write(
                project.path().join("weights/model.pth"),
                format!("epoch-{}", epoch),
            )
            .unwrap();
            let checkpoint = Checkpoint {
                id: id::random_id(),
                created: time::now(),
                path: Some("weights".to_string()),
                metrics: BTreeMap::new(),
                primary_metric: None,
                step: Some(epoch),
                experiment_id: experiment.id.clone(),
            };
            repository
                .put_path_tar(
                    project.path(),
                    &checkpoint_tarball_path(&checkpoint.id),
                    "weights",
                )
                .await
                .unwrap();
            experiment.checkpoints.push(checkpoint);
        }
        store.save_experiment(&experiment).await.unwrap();

        Fixture {
            _repo_dir: repo_dir,
            project,
            store,
            experiment,
        }
    }

    #[tokio::test]
    async fn test_checkout_checkpoint_into_fresh_dir() {
        let f = fixture().await;
        let out = TempDir::new().unwrap();
        let first = &f.experiment.checkpoints[0];

        let summary = checkout(&f.store, &first.id[..8], out.path(), false)
            .await
            .unwrap();
        assert_eq!(summary.checkpoint_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(fs::read_to_string(out.path().join("train.py")).unwrap(), "train()");
        assert_eq!(
            fs::read_to_string(out.path().join("weights/model.pth")).unwrap(),
            "epoch-1"
        );

        let leftovers: Vec<_> = fs::read_dir(out.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".keepsake-checkout-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_checkout_experiment_uses_latest_checkpoint() {
        let f = fixture().await;
        let out = TempDir::new().unwrap();

        let summary = checkout(&f.store, &f.experiment.id[..8], out.path(), false)
            .await
            .unwrap();
        assert_eq!(summary.checkpoint_id, Some(f.experiment.checkpoints[1].id.clone()));
        assert_eq!(
            fs::read_to_string(out.path().join("weights/model.pth")).unwrap(),
            "epoch-2"
        );
    }

    #[tokio::test]
    async fn test_checkout_refuses_modified_files() {
        let f = fixture().await;
        let out = TempDir::new().unwrap();
        let latest = f.experiment.checkpoints[1].id.clone();

        checkout(&f.store, &latest, out.path(), false).await.unwrap();
        // Identical files are not conflicts
        checkout(&f.store, &latest, out.path(), false).await.unwrap();

        fs::write(out.path().join("weights/model.pth"), "hand edited").unwrap();
        let err = checkout(&f.store, &latest, out.path(), false)
            .await
            .unwrap_err();
        match &err {
            Error::CheckoutConflict { summary } => assert!(summary.contains("model.pth")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            fs::read_to_string(out.path().join("weights/model.pth")).unwrap(),
            "hand edited"
        );

        checkout(&f.store, &latest, out.path(), true).await.unwrap();
        assert_eq!(
            fs::read_to_string(out.path().join("weights/model.pth")).unwrap(),
            "epoch-2"
        );
    }

    #[tokio::test]
    async fn test_checkout_deleted_checkpoint() {
        let f = fixture().await;
        let out = TempDir::new().unwrap();
        let first = f.experiment.checkpoints[0].id.clone();

        f.store.delete_checkpoint(&first).await.unwrap();
        let err = checkout(&f.store, &first, out.path(), false)
            .await
            .unwrap_err();
        assert!(err.is_does_not_exist());
        assert!(!out.path().join("train.py").exists());
        drop(f.project);
    }

    #[test]
    fn test_blocked_directory_moves_nothing() {
        let staging = TempDir::new().unwrap();
        fs::write(staging.path().join("a.txt"), "a").unwrap();
        fs::create_dir_all(staging.path().join("weights")).unwrap();
        fs::write(staging.path().join("weights/model.pth"), "w").unwrap();

        // A plain file where the checkout needs a directory
        let output = TempDir::new().unwrap();
        fs::write(output.path().join("weights"), "not a directory").unwrap();

        let err = place(staging.path(), output.path(), true).unwrap_err();
        assert_eq!(err.kind(), keepsake_core::ErrorKind::WriteError);
        assert!(!output.path().join("a.txt").exists());
        assert!(staging.path().join("a.txt").exists());
    }

    #[test]
    fn test_conflict_summary_truncates() {
        let conflicts: Vec<PathBuf> = (0..25).map(|i| PathBuf::from(format!("f{}", i))).collect();
        let summary = conflict_summary(&conflicts);
        assert!(summary.contains("f19"));
        assert!(!summary.contains("f20"));
        assert!(summary.contains("and 5 more"));
    }
}
