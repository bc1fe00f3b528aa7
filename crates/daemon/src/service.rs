//! RPC service implementation for the daemon
//!
//! Implements the [`KeepsakeDaemon`] gRPC service on top of the metadata
//! store, the heartbeat service and the tarball pipeline.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use keepsake_core::{
    checkpoint_tarball_path, experiment_metadata_path, experiment_tarball_path, id, time,
    Checkpoint, Config, DaemonConfig, Error, Experiment, ExperimentId, ExperimentStatus,
    ProjectSpec, Result, Step,
};
use keepsake_storage::Repository;
use keepsake_tracking::{checkout, HeartbeatService, MetadataStore};
use tokio::sync::Mutex;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::convert;
use crate::middleware::{error_to_status, InputValidator, RequestMetrics};
use crate::proto::{self, keepsake_daemon_server::KeepsakeDaemon};

type RpcResult<T> = std::result::Result<Response<T>, Status>;

/// Log at info, or at debug when the caller asked for quiet
macro_rules! progress {
    ($quiet:expr, $($arg:tt)+) => {
        if $quiet {
            debug!($($arg)+);
        } else {
            info!($($arg)+);
        }
    };
}

/// In-memory view of an experiment this daemon writes to
struct ExperimentState {
    experiment: Experiment,
    /// Step of the newest checkpoint created through this daemon
    last_step: Option<Step>,
}

/// Daemon RPC service
///
/// One per daemon. Saves to the same experiment are serialised through its
/// state lock; different experiments proceed concurrently.
pub struct KeepsakeService {
    store: MetadataStore,
    heartbeats: HeartbeatService,

    /// Directory that source and artifact paths are relative to
    project_dir: PathBuf,

    /// Experiments created or checkpointed through this daemon
    experiments: DashMap<ExperimentId, Arc<Mutex<ExperimentState>>>,

    validator: InputValidator,
    metrics: RequestMetrics,
}

impl KeepsakeService {
    pub fn new(repository: Arc<dyn Repository>, config: &DaemonConfig) -> Self {
        Self {
            store: MetadataStore::new(repository.clone(), config.storage.list_concurrency),
            heartbeats: HeartbeatService::new(repository, config.heartbeat.clone()),
            project_dir: config.project_dir.clone(),
            experiments: DashMap::new(),
            validator: InputValidator::new(),
            metrics: RequestMetrics::new(),
        }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn metrics(&self) -> &RequestMetrics {
        &self.metrics
    }

    /// Refuse repositories written by a newer format version
    pub async fn check_repository_version(&self) -> Result<Option<ProjectSpec>> {
        self.store.check_project_spec().await
    }

    /// Run one call, recording its metrics and mapping failures to a status
    async fn observe<T, F>(&self, method: &'static str, call: F) -> RpcResult<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        self.metrics.record_request(method);

        let result = call.await;
        self.metrics
            .record_latency(method, started.elapsed().as_micros() as u64);

        match result {
            Ok(reply) => Ok(Response::new(reply)),
            Err(e) => {
                self.metrics.record_error(method);
                debug!(method, kind = %e.kind(), error = %e, "Request failed");
                Err(error_to_status(&e))
            }
        }
    }

    /// Record a new experiment, snapshot its source tree and start its heartbeat
    pub async fn create_experiment(&self, req: proto::CreateExperimentRequest) -> Result<Experiment> {
        if let Some(path) = &req.path {
            self.validator.validate_relative_path(path)?;
        }
        let params = convert::params_from_proto(req.params)?;
        self.validator.validate_names("param", &params)?;

        self.store.ensure_project_spec().await?;

        let user = if req.user.is_empty() {
            std::env::var("USER").unwrap_or_default()
        } else {
            req.user
        };
        let experiment = Experiment {
            id: id::random_id(),
            created: time::now(),
            params,
            user,
            host: String::new(),
            command: req.command,
            config: Config {
                repository: self.store.repository().root_url(),
            },
            path: req.path,
            python_packages: req.python_packages.into_iter().collect(),
            python_version: req.python_version,
            keepsake_version: req.keepsake_version,
            checkpoints: Vec::new(),
        };

        if let Some(path) = &experiment.path {
            self.upload(&experiment_tarball_path(&experiment.id), path).await?;
        }
        self.store.save_experiment(&experiment).await?;

        if !req.disable_heartbeat {
            self.heartbeats.start(&experiment.id);
        }
        self.experiments.insert(
            experiment.id.clone(),
            Arc::new(Mutex::new(ExperimentState {
                experiment: experiment.clone(),
                last_step: None,
            })),
        );

        progress!(
            req.quiet,
            experiment_id = %experiment.short_id(),
            path = experiment.path.as_deref().unwrap_or(""),
            "Created experiment"
        );
        Ok(experiment)
    }

    /// Record a checkpoint, snapshot its artifacts and re-save its experiment
    ///
    /// An invalid primary metric is dropped with a warning; the checkpoint is
    /// still recorded.
    pub async fn create_checkpoint(&self, req: proto::CreateCheckpointRequest) -> Result<Checkpoint> {
        self.validator
            .validate_id_prefix("experiment ID", &req.experiment_id)?;
        if let Some(path) = &req.path {
            self.validator.validate_relative_path(path)?;
        }
        let metrics = convert::params_from_proto(req.metrics)?;
        self.validator.validate_names("metric", &metrics)?;

        let primary_metric = match req.primary_metric {
            Some(metric) => match convert::primary_metric_from_proto(metric, &metrics) {
                Ok(metric) => Some(metric),
                Err(e) => {
                    warn!(experiment_id = %req.experiment_id, error = %e, "Ignoring primary metric");
                    None
                }
            },
            None => None,
        };

        let state = self.experiment_state(&req.experiment_id).await?;
        let mut state = state.lock().await;
        let experiment_id = state.experiment.id.clone();

        if !self
            .store
            .repository()
            .exists(&experiment_metadata_path(&experiment_id))
            .await?
        {
            self.experiments.remove(&experiment_id);
            return Err(Error::does_not_exist(experiment_metadata_path(&experiment_id)));
        }

        let step = req
            .step
            .unwrap_or_else(|| state.last_step.map(|s| s + 1).unwrap_or(0));
        let checkpoint = Checkpoint {
            id: id::random_id(),
            created: time::now(),
            path: req.path,
            metrics,
            primary_metric,
            step: Some(step),
            experiment_id: experiment_id.clone(),
        };

        if let Some(path) = &checkpoint.path {
            self.upload(&checkpoint_tarball_path(&checkpoint.id), path).await?;
        }

        state.experiment.checkpoints.push(checkpoint.clone());
        if let Err(e) = self.store.save_experiment(&state.experiment).await {
            state.experiment.checkpoints.pop();
            return Err(e);
        }
        state.last_step = Some(step);

        progress!(
            req.quiet,
            experiment_id = %state.experiment.short_id(),
            checkpoint_id = %checkpoint.short_id(),
            step,
            "Created checkpoint"
        );
        Ok(checkpoint)
    }

    /// Overwrite an experiment record with the caller's copy
    pub async fn save_experiment(&self, experiment: Experiment, quiet: bool) -> Result<()> {
        self.validator.validate_id_prefix("experiment ID", &experiment.id)?;
        if experiment.id.len() != id::ID_LEN {
            return Err(Error::validation("SaveExperiment needs a full experiment ID"));
        }

        let state = self.experiments.get(&experiment.id).map(|s| s.value().clone());
        match state {
            Some(state) => {
                let mut state = state.lock().await;
                self.store.save_experiment(&experiment).await?;
                if let Some(step) = experiment.last_step() {
                    state.last_step = Some(step);
                }
                state.experiment = experiment;
            }
            None => self.store.save_experiment(&experiment).await?,
        }

        progress!(quiet, "Saved experiment");
        Ok(())
    }

    /// Stop the heartbeat of an experiment and forget its state
    pub async fn stop_experiment(&self, experiment_id: &str) -> Result<()> {
        self.validator.validate_id_prefix("experiment ID", experiment_id)?;
        self.heartbeats.stop(experiment_id).await?;
        self.experiments.remove(experiment_id);
        Ok(())
    }

    pub async fn get_experiment(&self, prefix: &str) -> Result<Experiment> {
        self.validator.validate_id_prefix("experiment ID", prefix)?;
        self.store.load_experiment(prefix).await
    }

    /// Delete an experiment with its tarballs and heartbeat
    pub async fn delete_experiment(&self, prefix: &str) -> Result<()> {
        self.validator.validate_id_prefix("experiment ID", prefix)?;
        let experiment = self.store.load_experiment(prefix).await?;

        self.heartbeats.abandon(&experiment.id).await;
        self.store.delete_experiment(&experiment.id).await?;
        self.experiments.remove(&experiment.id);

        info!(experiment_id = %experiment.short_id(), "Deleted experiment");
        Ok(())
    }

    /// Current liveness of an experiment, found by ID prefix
    pub async fn status(&self, experiment_id: &str) -> Result<ExperimentStatus> {
        self.validator.validate_id_prefix("experiment ID", experiment_id)?;
        let experiment = self.store.load_experiment(experiment_id).await?;
        self.heartbeats.status(&experiment.id).await
    }

    /// Restore a recorded tree under the project directory
    pub async fn checkout(
        &self,
        req: proto::CheckoutCheckpointRequest,
    ) -> Result<proto::CheckoutCheckpointReply> {
        self.validator
            .validate_id_prefix("checkpoint ID", &req.checkpoint_id_prefix)?;
        self.validator.validate_path(&req.output_directory)?;

        let output_dir = self.project_dir.join(&req.output_directory);
        let summary = checkout(&self.store, &req.checkpoint_id_prefix, &output_dir, req.force).await?;

        progress!(
            req.quiet,
            output_dir = %output_dir.display(),
            files = summary.files.len(),
            "Checked out checkpoint"
        );
        Ok(proto::CheckoutCheckpointReply {
            experiment_id: summary.experiment_id,
            checkpoint_id: summary.checkpoint_id,
            files: summary
                .files
                .iter()
                .map(|f| f.to_string_lossy().into_owned())
                .collect(),
        })
    }

    /// Stop every heartbeat without deleting records and report request totals
    pub async fn shutdown(&self) {
        self.heartbeats.shutdown().await;
        self.metrics.log_summary();
    }

    async fn experiment_state(&self, experiment_id: &str) -> Result<Arc<Mutex<ExperimentState>>> {
        if let Some(state) = self.experiments.get(experiment_id) {
            return Ok(state.value().clone());
        }

        let experiment = self.store.load_experiment(experiment_id).await?;
        let last_step = experiment.last_step();
        let state = self
            .experiments
            .entry(experiment.id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ExperimentState {
                    experiment,
                    last_step,
                }))
            })
            .value()
            .clone();
        Ok(state)
    }

    async fn upload(&self, tar_key: &str, include_path: &str) -> Result<()> {
        let started = Instant::now();
        self.store
            .repository()
            .put_path_tar(&self.project_dir, tar_key, include_path)
            .await?;
        debug!(
            key = tar_key,
            path = include_path,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Uploaded tarball"
        );
        Ok(())
    }
}

#[tonic::async_trait]
impl KeepsakeDaemon for KeepsakeService {
    async fn create_experiment(
        &self,
        request: Request<proto::CreateExperimentRequest>,
    ) -> RpcResult<proto::CreateExperimentReply> {
        self.observe("CreateExperiment", async {
            let experiment = KeepsakeService::create_experiment(self, request.into_inner()).await?;
            Ok::<_, Error>(proto::CreateExperimentReply {
                experiment: Some(convert::experiment_to_proto(&experiment)),
            })
        })
        .await
    }

    async fn create_checkpoint(
        &self,
        request: Request<proto::CreateCheckpointRequest>,
    ) -> RpcResult<proto::CreateCheckpointReply> {
        self.observe("CreateCheckpoint", async {
            let checkpoint = KeepsakeService::create_checkpoint(self, request.into_inner()).await?;
            Ok::<_, Error>(proto::CreateCheckpointReply {
                checkpoint: Some(convert::checkpoint_to_proto(&checkpoint)),
            })
        })
        .await
    }

    async fn save_experiment(
        &self,
        request: Request<proto::SaveExperimentRequest>,
    ) -> RpcResult<proto::SaveExperimentReply> {
        self.observe("SaveExperiment", async {
            let req = request.into_inner();
            let experiment = req
                .experiment
                .ok_or_else(|| Error::validation("SaveExperiment carries no experiment"))?;
            let experiment = convert::experiment_from_proto(experiment)?;
            KeepsakeService::save_experiment(self, experiment, req.quiet).await?;
            Ok::<_, Error>(proto::SaveExperimentReply {})
        })
        .await
    }

    async fn stop_experiment(
        &self,
        request: Request<proto::StopExperimentRequest>,
    ) -> RpcResult<proto::StopExperimentReply> {
        self.observe("StopExperiment", async {
            KeepsakeService::stop_experiment(self, &request.get_ref().experiment_id).await?;
            Ok::<_, Error>(proto::StopExperimentReply {})
        })
        .await
    }

    async fn get_experiment(
        &self,
        request: Request<proto::GetExperimentRequest>,
    ) -> RpcResult<proto::GetExperimentReply> {
        self.observe("GetExperiment", async {
            let experiment =
                KeepsakeService::get_experiment(self, &request.get_ref().experiment_id_prefix)
                    .await?;
            Ok::<_, Error>(proto::GetExperimentReply {
                experiment: Some(convert::experiment_to_proto(&experiment)),
            })
        })
        .await
    }

    async fn list_experiments(
        &self,
        _request: Request<proto::ListExperimentsRequest>,
    ) -> RpcResult<proto::ListExperimentsReply> {
        self.observe("ListExperiments", async {
            let experiments = self.store.list_experiments().await?;
            Ok::<_, Error>(proto::ListExperimentsReply {
                experiments: experiments.iter().map(convert::experiment_to_proto).collect(),
            })
        })
        .await
    }

    async fn delete_experiment(
        &self,
        request: Request<proto::DeleteExperimentRequest>,
    ) -> RpcResult<proto::DeleteExperimentReply> {
        self.observe("DeleteExperiment", async {
            KeepsakeService::delete_experiment(self, &request.get_ref().experiment_id).await?;
            Ok::<_, Error>(proto::DeleteExperimentReply {})
        })
        .await
    }

    async fn delete_checkpoint(
        &self,
        request: Request<proto::DeleteCheckpointRequest>,
    ) -> RpcResult<proto::DeleteCheckpointReply> {
        self.observe("DeleteCheckpoint", async {
            let prefix = &request.get_ref().checkpoint_id_prefix;
            self.validator.validate_id_prefix("checkpoint ID", prefix)?;
            self.store.delete_checkpoint(prefix).await?;
            Ok::<_, Error>(proto::DeleteCheckpointReply {})
        })
        .await
    }

    async fn checkout_checkpoint(
        &self,
        request: Request<proto::CheckoutCheckpointRequest>,
    ) -> RpcResult<proto::CheckoutCheckpointReply> {
        self.observe("CheckoutCheckpoint", self.checkout(request.into_inner()))
            .await
    }

    async fn get_experiment_status(
        &self,
        request: Request<proto::GetExperimentStatusRequest>,
    ) -> RpcResult<proto::GetExperimentStatusReply> {
        self.observe("GetExperimentStatus", async {
            let status = self.status(&request.get_ref().experiment_id).await?;
            Ok::<_, Error>(proto::GetExperimentStatusReply {
                status: convert::status_to_proto(status) as i32,
            })
        })
        .await
    }
}
