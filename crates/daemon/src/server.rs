//! gRPC server on a Unix socket with graceful shutdown
//!
//! Startup opens the repository and checks its format version before the
//! socket is bound, so a daemon that cannot serve never leaves a socket
//! behind. Shutdown stops accepting, waits for in-flight requests up to the
//! grace period, cancels heartbeats and unlinks the socket.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keepsake_core::{DaemonConfig, Error, Result};
use tokio::net::UnixListener;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{debug, error, info, warn};

use crate::proto::keepsake_daemon_server::KeepsakeDaemonServer;
use crate::service::KeepsakeService;

/// Keepsake daemon server
pub struct DaemonServer {
    config: DaemonConfig,
    socket_path: PathBuf,
}

impl DaemonServer {
    pub fn new(config: DaemonConfig, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            config,
            socket_path: socket_path.into(),
        }
    }

    /// Run the server until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run the server until `shutdown` completes
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let url = self.config.resolve_repository()?;
        info!(repository = %url, "Starting keepsake daemon");

        let repository =
            keepsake_storage::open(&url, &self.config.project_dir, &self.config.storage).await?;
        let service = Arc::new(KeepsakeService::new(repository, &self.config));
        if let Some(spec) = service.check_repository_version().await? {
            debug!(version = spec.version, "Repository version is supported");
        }

        let listener = bind(&self.socket_path)?;
        info!(socket = %self.socket_path.display(), "Keepsake daemon listening");

        let max_message_size = self.config.server.max_frame_length;
        let grpc_service = KeepsakeDaemonServer::from_arc(service.clone())
            .max_decoding_message_size(max_message_size)
            .max_encoding_message_size(max_message_size);

        let draining = CancellationToken::new();
        let stop_accepting = {
            let draining = draining.clone();
            async move { draining.cancelled().await }
        };
        let server = Server::builder()
            .add_service(grpc_service)
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), stop_accepting);

        tokio::pin!(server);
        tokio::pin!(shutdown);
        let served = tokio::select! {
            result = &mut server => result,
            _ = &mut shutdown => {
                info!("Draining in-flight requests");
                draining.cancel();
                let grace = self.config.server.shutdown_grace;
                match tokio::time::timeout(grace, &mut server).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            grace_ms = grace.as_millis() as u64,
                            "Requests still running after the grace period, dropping them"
                        );
                        Ok(())
                    }
                }
            }
        };

        service.shutdown().await;
        remove_socket(&self.socket_path);
        served.map_err(|e| {
            error!(error = %e, "Server error");
            Error::Protocol {
                message: format!("daemon transport failed: {}", e),
            }
        })?;
        info!("Keepsake daemon shutdown complete");
        Ok(())
    }
}

/// Bind the socket, replacing a stale one left by a dead daemon
fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(UnixListener::bind(path)?)
}

fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(socket = %path.display(), error = %e, "Failed to remove socket"),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DaemonClient;
    use keepsake_core::ErrorKind;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    fn config(project: &Path, repo: &Path) -> DaemonConfig {
        DaemonConfig {
            repository: Some(format!("file://{}", repo.display())),
            project_dir: project.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_serves_and_unlinks_socket() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("daemon.sock");
        let (stop, stopped) = oneshot::channel::<()>();

        let server = DaemonServer::new(config(dir.path(), &dir.path().join("repo")), &socket);
        let handle = tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));

        let mut client = DaemonClient::connect(&socket).await.unwrap();
        assert!(client.list_experiments().await.unwrap().is_empty());
        drop(client);

        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_replaces_stale_socket() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("daemon.sock");
        std::fs::write(&socket, "stale").unwrap();

        let listener = bind(&socket).unwrap();
        drop(listener);
        remove_socket(&socket);
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_newer_repository_refused_before_bind() {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("repository.json"), r#"{"version": 99999}"#).unwrap();
        let socket = dir.path().join("daemon.sock");

        let err = DaemonServer::new(config(dir.path(), &repo), &socket)
            .run_until(std::future::pending())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleRepositoryVersion);
        assert_eq!(err.kind().exit_code(), 3);
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_idle_connection_does_not_hold_shutdown() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("daemon.sock");
        let (stop, stopped) = oneshot::channel::<()>();

        let mut config = config(dir.path(), &dir.path().join("repo"));
        config.server.shutdown_grace = Duration::from_secs(1);
        let server = DaemonServer::new(config, &socket);
        let handle = tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));

        let mut idle = DaemonClient::connect(&socket).await.unwrap();
        idle.list_experiments().await.unwrap();
        stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("shutdown waited on an idle connection")
            .unwrap()
            .unwrap();
        assert!(!socket.exists());
        drop(idle);
    }
}
