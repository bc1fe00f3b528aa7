//! Typed access to the JSON records in a repository

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use keepsake_core::{
    checkpoint_tarball_path, experiment_metadata_path, experiment_tarball_path,
    heartbeat_metadata_path, id, Checkpoint, Error, Experiment, ProjectSpec, Result,
    EXPERIMENT_METADATA_DIR, PROJECT_SPEC_PATH, SUPPORTED_VERSION,
};
use keepsake_storage::Repository;
use tracing::{debug, info, warn};

/// What an ID prefix refers to
#[derive(Debug, Clone)]
pub enum Resolved {
    Experiment(Experiment),
    Checkpoint(Experiment, Checkpoint),
}

/// Metadata store over a repository
///
/// Reads and writes experiment, heartbeat and project spec records. Each
/// write is a single atomic put at the backend; there is no locking across
/// keys.
#[derive(Clone)]
pub struct MetadataStore {
    repository: Arc<dyn Repository>,
    list_concurrency: usize,
}

impl MetadataStore {
    /// Create a store that reads up to `list_concurrency` records at once
    pub fn new(repository: Arc<dyn Repository>, list_concurrency: usize) -> Self {
        Self {
            repository,
            list_concurrency: list_concurrency.max(1),
        }
    }

    /// The underlying repository
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// Write an experiment record, replacing any previous version
    pub async fn save_experiment(&self, experiment: &Experiment) -> Result<()> {
        let path = experiment_metadata_path(&experiment.id);
        let data = experiment.to_json()?;
        self.repository.put(&path, Bytes::from(data)).await?;
        debug!(
            experiment_id = %experiment.short_id(),
            checkpoints = experiment.checkpoints.len(),
            "Saved experiment"
        );
        Ok(())
    }

    /// IDs of every experiment record in the repository
    pub async fn experiment_ids(&self) -> Result<Vec<String>> {
        let keys = self.repository.list(EXPERIMENT_METADATA_DIR).await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.rsplit('/').next())
            .filter_map(|name| name.strip_suffix(".json"))
            .map(String::from)
            .collect())
    }

    /// Load the experiment whose ID starts with `prefix`
    ///
    /// # Errors
    /// `DoesNotExist` when nothing matches, `AmbiguousPrefix` when several do
    pub async fn load_experiment(&self, prefix: &str) -> Result<Experiment> {
        let ids = self.experiment_ids().await?;
        let id = id::resolve_prefix(ids.iter().map(String::as_str), prefix)?;
        self.read_experiment(&id).await
    }

    async fn read_experiment(&self, id: &str) -> Result<Experiment> {
        let path = experiment_metadata_path(id);
        let data = self.repository.get(&path).await?;
        Experiment::from_json(&data).map_err(|e| Error::read(path, e))
    }

    /// Every experiment, oldest first
    ///
    /// Records that fail to parse are skipped with a warning. Records
    /// deleted while the listing runs are skipped silently.
    pub async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        let ids = self.experiment_ids().await?;
        let results: Vec<(String, Result<Bytes>)> = stream::iter(ids)
            .map(|id| async move {
                let result = self.repository.get(&experiment_metadata_path(&id)).await;
                (id, result)
            })
            .buffer_unordered(self.list_concurrency)
            .collect()
            .await;

        let mut experiments = Vec::with_capacity(results.len());
        for (id, result) in results {
            let data = match result {
                Ok(data) => data,
                Err(e) if e.is_does_not_exist() => continue,
                Err(e) => return Err(e),
            };
            match Experiment::from_json(&data) {
                Ok(experiment) => experiments.push(experiment),
                Err(e) => {
                    warn!(experiment_id = %id, error = %e, "Skipping corrupt experiment record");
                }
            }
        }
        experiments.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(experiments)
    }

    /// Delete an experiment and everything it references
    ///
    /// Every object is attempted even after a failure; the first failure is
    /// returned once all of them have been tried. Checkpoint tarballs go
    /// first and the metadata record last.
    pub async fn delete_experiment(&self, prefix: &str) -> Result<()> {
        let experiment = self.load_experiment(prefix).await?;

        let mut paths: Vec<String> = experiment
            .checkpoints
            .iter()
            .map(|checkpoint| checkpoint_tarball_path(&checkpoint.id))
            .collect();
        paths.push(heartbeat_metadata_path(&experiment.id));
        paths.push(experiment_tarball_path(&experiment.id));
        paths.push(experiment_metadata_path(&experiment.id));

        let mut first_error = None;
        for path in &paths {
            if let Err(e) = self.delete_if_present(path).await {
                warn!(path = %path, error = %e, "Failed to delete experiment object");
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        info!(
            experiment_id = %experiment.short_id(),
            checkpoints = experiment.checkpoints.len(),
            "Deleted experiment"
        );
        Ok(())
    }

    /// Find the checkpoint whose ID starts with `prefix`, and its experiment
    pub async fn find_checkpoint(&self, prefix: &str) -> Result<(Experiment, Checkpoint)> {
        match self.resolve(prefix, false).await? {
            Resolved::Checkpoint(experiment, checkpoint) => Ok((experiment, checkpoint)),
            Resolved::Experiment(_) => Err(Error::does_not_exist(prefix)),
        }
    }

    /// Resolve `prefix` against experiment IDs and checkpoint IDs
    ///
    /// Exactly one record across both kinds must match.
    pub async fn resolve(&self, prefix: &str, include_experiments: bool) -> Result<Resolved> {
        let experiments = self.list_experiments().await?;

        let mut matches: Vec<Resolved> = Vec::new();
        for experiment in &experiments {
            if include_experiments && experiment.id.starts_with(prefix) {
                matches.push(Resolved::Experiment(experiment.clone()));
            }
            for checkpoint in &experiment.checkpoints {
                if checkpoint.id.starts_with(prefix) {
                    matches.push(Resolved::Checkpoint(experiment.clone(), checkpoint.clone()));
                }
            }
        }

        match matches.len() {
            0 => Err(Error::does_not_exist(prefix)),
            1 => Ok(matches.remove(0)),
            n => Err(Error::AmbiguousPrefix {
                prefix: prefix.to_string(),
                matches: n,
            }),
        }
    }

    /// Delete the artifact tarball of a checkpoint
    ///
    /// The checkpoint stays listed in its experiment's record.
    pub async fn delete_checkpoint(&self, prefix: &str) -> Result<()> {
        let (experiment, checkpoint) = self.find_checkpoint(prefix).await?;
        self.delete_if_present(&checkpoint_tarball_path(&checkpoint.id))
            .await?;
        info!(
            experiment_id = %experiment.short_id(),
            checkpoint_id = %checkpoint.short_id(),
            "Deleted checkpoint tarball"
        );
        Ok(())
    }

    /// Read the repository format marker, if there is one
    ///
    /// # Errors
    /// `CorruptedRepositorySpec` when the record is not valid JSON
    pub async fn read_project_spec(&self) -> Result<Option<ProjectSpec>> {
        let data = match self.repository.get(PROJECT_SPEC_PATH).await {
            Ok(data) => data,
            Err(e) if e.is_does_not_exist() => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| Error::CorruptedRepositorySpec {
                message: e.to_string(),
            })
    }

    /// Write the repository format marker
    pub async fn write_project_spec(&self, version: u32) -> Result<()> {
        let data = serde_json::to_vec_pretty(&ProjectSpec { version })?;
        self.repository.put(PROJECT_SPEC_PATH, Bytes::from(data)).await
    }

    /// Fail if the repository was written by a newer format version
    pub async fn check_project_spec(&self) -> Result<Option<ProjectSpec>> {
        let spec = self.read_project_spec().await?;
        if let Some(spec) = spec {
            if spec.version > SUPPORTED_VERSION {
                return Err(Error::IncompatibleRepositoryVersion {
                    found: spec.version,
                    supported: SUPPORTED_VERSION,
                });
            }
        }
        Ok(spec)
    }

    /// Check the format marker and write one if the repository has none
    pub async fn ensure_project_spec(&self) -> Result<ProjectSpec> {
        match self.check_project_spec().await? {
            Some(spec) => Ok(spec),
            None => {
                self.write_project_spec(SUPPORTED_VERSION).await?;
                debug!(version = SUPPORTED_VERSION, "Wrote repository spec");
                Ok(ProjectSpec::default())
            }
        }
    }

    async fn delete_if_present(&self, path: &str) -> Result<()> {
        match self.repository.delete(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_does_not_exist() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
