//! Repository record definitions

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::SHORT_ID_LEN;
use crate::time::rfc3339_micros;
use crate::{Error, ParamValue, Result};

/// Unique identifier types
pub type ExperimentId = String;
pub type CheckpointId = String;

/// Training step counter
pub type Step = i64;

/// Highest repository format version this build can write to
pub const SUPPORTED_VERSION: u32 = 1;

/// Repository keys
pub const PROJECT_SPEC_PATH: &str = "repository.json";
pub const EXPERIMENT_METADATA_DIR: &str = "metadata/experiments";
pub const HEARTBEAT_METADATA_DIR: &str = "metadata/heartbeats";
pub const EXPERIMENT_TARBALL_DIR: &str = "experiments";
pub const CHECKPOINT_TARBALL_DIR: &str = "checkpoints";

/// Key of an experiment's metadata record
pub fn experiment_metadata_path(id: &str) -> String {
    format!("{}/{}.json", EXPERIMENT_METADATA_DIR, id)
}

/// Key of an experiment's heartbeat record
pub fn heartbeat_metadata_path(id: &str) -> String {
    format!("{}/{}.json", HEARTBEAT_METADATA_DIR, id)
}

/// Key of an experiment's source snapshot
pub fn experiment_tarball_path(id: &str) -> String {
    format!("{}/{}.tar.gz", EXPERIMENT_TARBALL_DIR, id)
}

/// Key of a checkpoint's artifact snapshot
pub fn checkpoint_tarball_path(id: &str) -> String {
    format!("{}/{}.tar.gz", CHECKPOINT_TARBALL_DIR, id)
}

/// Optimisation direction of a primary metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Goal {
    Minimize,
    Maximize,
}

impl Goal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Goal::Minimize => "minimize",
            Goal::Maximize => "maximize",
        }
    }
}

impl FromStr for Goal {
    type Err = Error;

    /// Case-insensitive
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "minimize" => Ok(Goal::Minimize),
            "maximize" => Ok(Goal::Maximize),
            other => Err(Error::validation(format!(
                "primary metric goal must be \"minimize\" or \"maximize\", got {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The metric used to pick the best checkpoint of an experiment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryMetric {
    pub name: String,
    pub goal: Goal,
}

/// Repository settings recorded with each experiment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Repository URL the experiment was written to
    #[serde(default, alias = "storage")]
    pub repository: String,
}

/// A snapshot within an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,

    #[serde(with = "rfc3339_micros")]
    pub created: DateTime<Utc>,

    /// Path of the artifact tree relative to the project directory
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub metrics: BTreeMap<String, ParamValue>,

    #[serde(default)]
    pub primary_metric: Option<PrimaryMetric>,

    #[serde(default)]
    pub step: Option<Step>,

    /// Owning experiment, set on load and never persisted
    #[serde(skip)]
    pub experiment_id: ExperimentId,
}

impl Checkpoint {
    pub fn short_id(&self) -> &str {
        short(&self.id)
    }

    /// Value of the primary metric, if this checkpoint has a numeric one
    pub fn primary_metric_value(&self) -> Option<f64> {
        let pm = self.primary_metric.as_ref()?;
        self.metrics.get(&pm.name)?.as_f64()
    }
}

/// One run of a training script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,

    #[serde(with = "rfc3339_micros")]
    pub created: DateTime<Utc>,

    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub command: String,

    #[serde(default)]
    pub config: Config,

    /// Path of the source tree relative to the project directory
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub python_packages: BTreeMap<String, String>,

    #[serde(default)]
    pub python_version: String,

    #[serde(default, alias = "replicate_version")]
    pub keepsake_version: String,

    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
}

impl Experiment {
    /// Parse a metadata record and attach checkpoints to this experiment
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let mut experiment: Experiment = serde_json::from_slice(data)?;
        experiment.attach_checkpoints();
        Ok(experiment)
    }

    /// Pretty-printed metadata record
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Point every checkpoint back at this experiment
    pub fn attach_checkpoints(&mut self) {
        for checkpoint in &mut self.checkpoints {
            checkpoint.experiment_id = self.id.clone();
        }
    }

    pub fn short_id(&self) -> &str {
        short(&self.id)
    }

    /// Most recently created checkpoint
    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// Best checkpoint according to the first declared primary metric
    ///
    /// Checkpoints without a numeric value for that metric are skipped.
    /// Ties keep the earliest checkpoint.
    pub fn best(&self) -> Option<&Checkpoint> {
        let primary = self
            .checkpoints
            .iter()
            .find_map(|c| c.primary_metric.as_ref())?;

        let mut best: Option<(&Checkpoint, f64)> = None;
        for checkpoint in &self.checkpoints {
            let Some(value) = checkpoint
                .metrics
                .get(&primary.name)
                .and_then(ParamValue::as_f64)
            else {
                continue;
            };
            if value.is_nan() {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, current)) => match primary.goal {
                    Goal::Minimize => value < current,
                    Goal::Maximize => value > current,
                },
            };
            if better {
                best = Some((checkpoint, value));
            }
        }
        best.map(|(checkpoint, _)| checkpoint)
    }

    /// Find a checkpoint by ID prefix
    pub fn checkpoint(&self, prefix: &str) -> Result<&Checkpoint> {
        let id = crate::id::resolve_prefix(self.checkpoints.iter().map(|c| c.id.as_str()), prefix)?;
        self.checkpoints
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::does_not_exist(prefix.to_string()))
    }

    /// Largest explicit step recorded so far
    pub fn last_step(&self) -> Option<Step> {
        self.checkpoints.iter().filter_map(|c| c.step).max()
    }
}

/// Liveness record of a running experiment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub experiment_id: ExperimentId,

    #[serde(with = "rfc3339_micros")]
    pub last_heartbeat: DateTime<Utc>,
}

/// Repository-wide format marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub version: u32,
}

impl Default for ProjectSpec {
    fn default() -> Self {
        Self {
            version: SUPPORTED_VERSION,
        }
    }
}

/// Status of an experiment as observed through its heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Running,
    Stopped,
}

fn short(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}
