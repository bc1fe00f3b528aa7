//! Keepsake daemon binary entry point
//!
//! Serves the experiment tracking RPC on a Unix socket until SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keepsake_core::DaemonConfig;
use keepsake_daemon::DaemonServer;

#[derive(Debug, Parser)]
#[command(name = "keepsake-daemon", version, about = "Keepsake experiment tracking daemon")]
struct Args {
    /// Repository URL, e.g. s3://bucket/root (overrides keepsake.yaml)
    #[arg(short = 'R', long, value_name = "URL")]
    repository: Option<String>,

    /// Project directory that source and artifact paths are relative to
    #[arg(short = 'D', long, value_name = "DIR", default_value = ".")]
    directory: PathBuf,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    /// Socket to listen on
    socket_path: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "keepsake_daemon={level},keepsake_tracking={level},keepsake_storage={level}"
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = DaemonConfig {
        repository: args.repository,
        project_dir: args.directory,
        ..Default::default()
    };

    match DaemonServer::new(config, args.socket_path).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(kind = %e.kind(), error = %e, "Daemon failed");
            eprintln!("{}: {}", e.kind(), e);
            ExitCode::from(e.kind().exit_code() as u8)
        }
    }
}
