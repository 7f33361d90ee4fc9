//! rktlet-journal2cri - copy a pod's journal into CRI log files.
//!
//! Runs as an internal app inside every sandbox when the logging helper is enabled.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rktlet-journal2cri", about = "Copy pod journal entries into CRI log files", version)]
struct Args {
    /// Directory holding the pod journal.
    journal_dir: PathBuf,

    /// Directory receiving `<name>_<attempt>.log` files.
    cri_dir: PathBuf,

    /// journalctl binary.
    #[arg(long, default_value = "journalctl")]
    journalctl: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    std::fs::create_dir_all(&args.cri_dir)?;
    rktlet_journal2cri::follow(&args.journalctl, &args.journal_dir, &args.cri_dir).await?;
    Ok(())
}
