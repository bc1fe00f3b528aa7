//! Client side of the daemon socket
//!
//! Used by the trainer-side libraries and the integration tests. Wraps the
//! generated gRPC client with a Unix socket connector and converts replies
//! into repository records.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use keepsake_core::{Checkpoint, Error, Experiment, ExperimentStatus, Result, ServerConfig};
use tokio::net::UnixStream;
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

use crate::convert;
use crate::middleware::status_to_error;
use crate::proto::{self, keepsake_daemon_client::KeepsakeDaemonClient};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Placeholder authority; the connector ignores it and dials the socket
const SOCKET_URI: &str = "http://[::]:50051";

/// Connection to a running daemon
pub struct DaemonClient {
    inner: KeepsakeDaemonClient<Channel>,
}

impl DaemonClient {
    /// Connect with the default deadline and message limit
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        Self::connect_with(socket_path, &ServerConfig::default()).await
    }

    /// Connect, waiting up to `config.connect_timeout` for the daemon to bind
    pub async fn connect_with(socket_path: impl AsRef<Path>, config: &ServerConfig) -> Result<Self> {
        let path: PathBuf = socket_path.as_ref().to_path_buf();
        let timeout = config.connect_timeout;
        let timed_out = || Error::Timeout {
            operation: format!("connect to {}", path.display()),
            timeout_ms: timeout.as_millis() as u64,
        };

        let endpoint = Endpoint::from_static(SOCKET_URI).connect_timeout(timeout);
        let dial_path = path.clone();
        let connector = service_fn(move |_: Uri| {
            let path = dial_path.clone();
            async move {
                let stream = wait_for_socket(&path, Instant::now() + timeout).await?;
                Ok::<_, io::Error>(TokioIo::new(stream))
            }
        });

        let started = Instant::now();
        let channel = match endpoint.connect_with_connector(connector).await {
            Ok(channel) => channel,
            Err(_) if started.elapsed() >= timeout => return Err(timed_out()),
            Err(e) => {
                return Err(Error::Protocol {
                    message: format!("connect to {}: {}", path.display(), e),
                })
            }
        };
        debug!(socket = %path.display(), "Connected to daemon");

        let inner = KeepsakeDaemonClient::new(channel)
            .max_decoding_message_size(config.max_frame_length)
            .max_encoding_message_size(config.max_frame_length);
        Ok(Self { inner })
    }

    pub async fn create_experiment(
        &mut self,
        request: proto::CreateExperimentRequest,
    ) -> Result<Experiment> {
        let reply = self
            .inner
            .create_experiment(request)
            .await
            .map_err(status_to_error)?
            .into_inner();
        convert::experiment_from_proto(reply.experiment.ok_or_else(|| missing("experiment"))?)
    }

    pub async fn create_checkpoint(
        &mut self,
        request: proto::CreateCheckpointRequest,
    ) -> Result<Checkpoint> {
        let experiment_id = request.experiment_id.clone();
        let reply = self
            .inner
            .create_checkpoint(request)
            .await
            .map_err(status_to_error)?
            .into_inner();
        let mut checkpoint =
            convert::checkpoint_from_proto(reply.checkpoint.ok_or_else(|| missing("checkpoint"))?)?;
        checkpoint.experiment_id = experiment_id;
        Ok(checkpoint)
    }

    pub async fn save_experiment(&mut self, experiment: &Experiment, quiet: bool) -> Result<()> {
        self.inner
            .save_experiment(proto::SaveExperimentRequest {
                experiment: Some(convert::experiment_to_proto(experiment)),
                quiet,
            })
            .await
            .map_err(status_to_error)?;
        Ok(())
    }

    pub async fn stop_experiment(&mut self, experiment_id: &str) -> Result<()> {
        self.inner
            .stop_experiment(proto::StopExperimentRequest {
                experiment_id: experiment_id.to_string(),
            })
            .await
            .map_err(status_to_error)?;
        Ok(())
    }

    pub async fn get_experiment(&mut self, prefix: &str) -> Result<Experiment> {
        let reply = self
            .inner
            .get_experiment(proto::GetExperimentRequest {
                experiment_id_prefix: prefix.to_string(),
            })
            .await
            .map_err(status_to_error)?
            .into_inner();
        convert::experiment_from_proto(reply.experiment.ok_or_else(|| missing("experiment"))?)
    }

    pub async fn list_experiments(&mut self) -> Result<Vec<Experiment>> {
        self.inner
            .list_experiments(proto::ListExperimentsRequest {})
            .await
            .map_err(status_to_error)?
            .into_inner()
            .experiments
            .into_iter()
            .map(convert::experiment_from_proto)
            .collect()
    }

    pub async fn delete_experiment(&mut self, experiment_id: &str) -> Result<()> {
        self.inner
            .delete_experiment(proto::DeleteExperimentRequest {
                experiment_id: experiment_id.to_string(),
            })
            .await
            .map_err(status_to_error)?;
        Ok(())
    }

    pub async fn delete_checkpoint(&mut self, prefix: &str) -> Result<()> {
        self.inner
            .delete_checkpoint(proto::DeleteCheckpointRequest {
                checkpoint_id_prefix: prefix.to_string(),
            })
            .await
            .map_err(status_to_error)?;
        Ok(())
    }

    /// Check out an experiment or checkpoint into `output_directory`
    pub async fn checkout_checkpoint(
        &mut self,
        prefix: &str,
        output_directory: &str,
        force: bool,
    ) -> Result<proto::CheckoutCheckpointReply> {
        let reply = self
            .inner
            .checkout_checkpoint(proto::CheckoutCheckpointRequest {
                checkpoint_id_prefix: prefix.to_string(),
                output_directory: output_directory.to_string(),
                quiet: true,
                force,
            })
            .await
            .map_err(status_to_error)?;
        Ok(reply.into_inner())
    }

    pub async fn get_experiment_status(&mut self, experiment_id: &str) -> Result<ExperimentStatus> {
        let reply = self
            .inner
            .get_experiment_status(proto::GetExperimentStatusRequest {
                experiment_id: experiment_id.to_string(),
            })
            .await
            .map_err(status_to_error)?
            .into_inner();
        let status = proto::get_experiment_status_reply::Status::try_from(reply.status)
            .map_err(|_| Error::Protocol {
                message: format!("unknown experiment status {}", reply.status),
            })?;
        Ok(convert::status_from_proto(status))
    }
}

/// Dial the socket, retrying while it is not yet bound
async fn wait_for_socket(path: &Path, deadline: Instant) -> io::Result<UnixStream> {
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) =>
            {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{} was not bound in time", path.display()),
                    ));
                }
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn missing(field: &str) -> Error {
    Error::Protocol {
        message: format!("reply is missing {}", field),
    }
}
