//! Rktlet - Kubernetes Container Runtime Interface binary.
//!
//! Serves CRI RuntimeService and ImageService over a Unix domain socket,
//! running pods as rkt sandboxes supervised by systemd.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rktlet_core::{PollConfig, RktCli, RktletConfig, SystemdRun};
use rktlet_cri::server::CriServer;

/// Rktlet CRI runtime
#[derive(Parser, Debug)]
#[command(name = "rktlet", about = "Kubernetes CRI runtime backed by rkt", version)]
struct Args {
    /// Path to the rkt binary; resolved from PATH when unset.
    #[arg(long)]
    rkt_path: Option<PathBuf>,

    /// rkt data directory.
    #[arg(long, default_value = rktlet_core::config::DEFAULT_RKT_DATA_DIR)]
    rkt_data_dir: PathBuf,

    /// Listen address of the exec streaming server.
    #[arg(long, default_value = rktlet_core::config::DEFAULT_STREAM_SERVER_ADDRESS)]
    stream_server_address: String,

    /// Path of the CRI Unix domain socket.
    #[arg(long, default_value = rktlet_core::config::DEFAULT_SOCKET_PATH)]
    listen: PathBuf,

    /// Stage1 image for sandboxes; empty uses the rkt default.
    #[arg(long, default_value = "")]
    rkt_stage1_name: String,

    /// Enable debug logging and pass --debug to rkt.
    #[arg(long)]
    debug: bool,

    /// Delay between polls while a sandbox starts, in milliseconds.
    #[arg(long, default_value_t = PollConfig::default().interval_ms)]
    poll_interval_ms: u64,

    /// Number of polls while a sandbox starts.
    #[arg(long, default_value_t = PollConfig::default().attempts)]
    poll_attempts: u32,

    /// Image of the journal log helper app added to every sandbox.
    #[arg(long)]
    logging_image: Option<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<RktletConfig> {
        let rkt_path = match self.rkt_path {
            Some(path) => path,
            None => which::which("rkt").context("rkt not found in PATH")?,
        };
        let systemd_run_path = which::which("systemd-run").context("systemd-run not found in PATH")?;
        which::which(&rkt_path).with_context(|| format!("rkt not found at {}", rkt_path.display()))?;

        Ok(RktletConfig {
            rkt_path,
            systemd_run_path,
            rkt_data_dir: self.rkt_data_dir,
            stream_server_address: self.stream_server_address,
            socket_path: self.listen,
            stage1_name: self.rkt_stage1_name,
            debug: self.debug,
            poll: PollConfig {
                interval_ms: self.poll_interval_ms,
                attempts: self.poll_attempts,
            },
            logging_image: self.logging_image,
            ..RktletConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = args.into_config()?;

    tracing::info!(
        rkt = %config.rkt_path.display(),
        data_dir = %config.rkt_data_dir.display(),
        socket = %config.socket_path.display(),
        stream_server = %config.stream_server_address,
        "Starting rktlet"
    );

    let cli = Arc::new(RktCli::new(&config.rkt_path, config.cli_config()));
    let init = Arc::new(SystemdRun::new(&config.systemd_run_path));

    let (server, streaming) = CriServer::assemble(&config, cli, init).await?;
    tokio::spawn(async move {
        if let Err(e) = streaming.serve().await {
            tracing::error!(error = %e, "Streaming server stopped");
        }
    });

    server
        .serve()
        .await
        .map_err(|e| anyhow::anyhow!("CRI server failed: {}", e))?;

    Ok(())
}
