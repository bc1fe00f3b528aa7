//! Conversions between wire messages and repository records

use std::collections::{BTreeMap, HashMap};

use keepsake_core::{
    time, Checkpoint, Config, Error, Experiment, ExperimentStatus, Goal, ParamValue,
    PrimaryMetric, Result,
};
use serde_json::Value;
use tracing::warn;

use crate::proto::{self, get_experiment_status_reply::Status, param_type};

pub fn param_to_proto(value: &ParamValue) -> proto::ParamType {
    let value = match value {
        ParamValue::Bool(b) => param_type::Value::BoolValue(*b),
        ParamValue::Int(i) => param_type::Value::IntValue(*i),
        ParamValue::Float(f) => param_type::Value::FloatValue(*f),
        ParamValue::String(s) => param_type::Value::StringValue(s.clone()),
        ParamValue::Json(v) => param_type::Value::ObjectValueJson(v.to_string()),
    };
    proto::ParamType { value: Some(value) }
}

/// A missing value decodes as JSON null
pub fn param_from_proto(name: &str, value: proto::ParamType) -> Result<ParamValue> {
    Ok(match value.value {
        Some(param_type::Value::BoolValue(b)) => ParamValue::Bool(b),
        Some(param_type::Value::IntValue(i)) => ParamValue::Int(i),
        Some(param_type::Value::FloatValue(f)) => ParamValue::Float(f),
        Some(param_type::Value::StringValue(s)) => ParamValue::String(s),
        Some(param_type::Value::ObjectValueJson(raw)) => ParamValue::from_object_json(&raw)
            .map_err(|e| Error::validation(format!("value of {:?} is not valid JSON: {}", name, e)))?,
        None => ParamValue::Json(Value::Null),
    })
}

pub fn params_to_proto(params: &BTreeMap<String, ParamValue>) -> HashMap<String, proto::ParamType> {
    params
        .iter()
        .map(|(name, value)| (name.clone(), param_to_proto(value)))
        .collect()
}

pub fn params_from_proto(
    params: HashMap<String, proto::ParamType>,
) -> Result<BTreeMap<String, ParamValue>> {
    params
        .into_iter()
        .map(|(name, value)| {
            let value = param_from_proto(&name, value)?;
            Ok((name, value))
        })
        .collect()
}

pub fn primary_metric_to_proto(metric: &PrimaryMetric) -> proto::PrimaryMetric {
    proto::PrimaryMetric {
        name: metric.name.clone(),
        goal: metric.goal.as_str().to_string(),
    }
}

/// Check a primary metric against the metrics it refers to
pub fn primary_metric_from_proto(
    metric: proto::PrimaryMetric,
    metrics: &BTreeMap<String, ParamValue>,
) -> Result<PrimaryMetric> {
    let goal: Goal = metric.goal.parse()?;
    if !metrics.contains_key(&metric.name) {
        return Err(Error::validation(format!(
            "primary metric {:?} is not one of the recorded metrics",
            metric.name
        )));
    }
    Ok(PrimaryMetric {
        name: metric.name,
        goal,
    })
}

pub fn checkpoint_to_proto(checkpoint: &Checkpoint) -> proto::Checkpoint {
    proto::Checkpoint {
        id: checkpoint.id.clone(),
        created: time::format(&checkpoint.created),
        path: checkpoint.path.clone(),
        metrics: params_to_proto(&checkpoint.metrics),
        primary_metric: checkpoint.primary_metric.as_ref().map(primary_metric_to_proto),
        step: checkpoint.step,
    }
}

/// The owning experiment ID is left empty; [`experiment_from_proto`] fills it in
///
/// An invalid primary metric is dropped with a warning.
pub fn checkpoint_from_proto(checkpoint: proto::Checkpoint) -> Result<Checkpoint> {
    let metrics = params_from_proto(checkpoint.metrics)?;
    let primary_metric = match checkpoint.primary_metric {
        Some(metric) => match primary_metric_from_proto(metric, &metrics) {
            Ok(metric) => Some(metric),
            Err(e) => {
                warn!(checkpoint_id = %checkpoint.id, error = %e, "Ignoring primary metric");
                None
            }
        },
        None => None,
    };
    Ok(Checkpoint {
        created: time::parse(&checkpoint.created)?,
        id: checkpoint.id,
        path: checkpoint.path,
        metrics,
        primary_metric,
        step: checkpoint.step,
        experiment_id: String::new(),
    })
}

pub fn experiment_to_proto(experiment: &Experiment) -> proto::Experiment {
    proto::Experiment {
        id: experiment.id.clone(),
        created: time::format(&experiment.created),
        params: params_to_proto(&experiment.params),
        host: experiment.host.clone(),
        user: experiment.user.clone(),
        config: Some(proto::Config {
            repository: experiment.config.repository.clone(),
        }),
        command: experiment.command.clone(),
        path: experiment.path.clone(),
        python_packages: experiment
            .python_packages
            .iter()
            .map(|(name, version)| (name.clone(), version.clone()))
            .collect(),
        python_version: experiment.python_version.clone(),
        keepsake_version: experiment.keepsake_version.clone(),
        checkpoints: experiment.checkpoints.iter().map(checkpoint_to_proto).collect(),
    }
}

pub fn experiment_from_proto(experiment: proto::Experiment) -> Result<Experiment> {
    let checkpoints = experiment
        .checkpoints
        .into_iter()
        .map(checkpoint_from_proto)
        .collect::<Result<Vec<_>>>()?;
    let mut experiment = Experiment {
        created: time::parse(&experiment.created)?,
        id: experiment.id,
        params: params_from_proto(experiment.params)?,
        user: experiment.user,
        host: experiment.host,
        command: experiment.command,
        config: Config {
            repository: experiment.config.map(|c| c.repository).unwrap_or_default(),
        },
        path: experiment.path,
        python_packages: experiment.python_packages.into_iter().collect(),
        python_version: experiment.python_version,
        keepsake_version: experiment.keepsake_version,
        checkpoints,
    };
    experiment.attach_checkpoints();
    Ok(experiment)
}

pub fn status_to_proto(status: ExperimentStatus) -> Status {
    match status {
        ExperimentStatus::Running => Status::Running,
        ExperimentStatus::Stopped => Status::Stopped,
    }
}

pub fn status_from_proto(status: Status) -> ExperimentStatus {
    match status {
        Status::Running => ExperimentStatus::Running,
        Status::Stopped => ExperimentStatus::Stopped,
    }
}
