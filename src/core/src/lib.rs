//! Rktlet Core - foundational types shared by the CRI adapter and the log tailer.
//!
//! This crate owns everything that talks to the outside world through
//! subprocesses: the `rkt` command executor, the `systemd-run` supervisor,
//! and the error vocabulary both of them report with.

pub mod cli;
pub mod config;
pub mod error;
pub mod init;
pub mod stream;

// Re-export commonly used types
pub use cli::{Cli, CliConfig, RktCli};
pub use config::{PollConfig, RktletConfig};
pub use error::{Result, RktletError};
pub use init::{Init, SystemdRun};

/// Rktlet version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
