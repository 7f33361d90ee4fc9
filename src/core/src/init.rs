//! Process supervision through `systemd-run`.
//!
//! Sandboxes are long-lived `rkt app sandbox` processes; they are handed to
//! systemd as transient units so they outlive the rktlet process and are
//! placed in the kubelet-chosen slice.

use std::path::PathBuf;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use crate::cli::execute;
use crate::error::{Result, RktletError};

/// Launches a command under a process supervisor.
#[async_trait]
pub trait Init: Send + Sync {
    /// Start `command` under `cgroup_parent`, returning the supervisor's unit name.
    async fn start_process(&self, cgroup_parent: &str, command: &[String]) -> Result<String>;
}

/// [`Init`] implementation backed by `systemd-run`.
#[derive(Debug, Clone)]
pub struct SystemdRun {
    path: PathBuf,
}

impl SystemdRun {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Arguments for `systemd-run`, without the binary itself.
    pub fn args(cgroup_parent: &str, command: &[String]) -> Result<Vec<String>> {
        let mut args = Vec::with_capacity(command.len() + 1);
        if !cgroup_parent.is_empty() {
            let slice = cgroup_parent_to_slice_name(cgroup_parent)?;
            args.push(format!("--slice={}", slice));
        }
        args.extend(command.iter().cloned());
        Ok(args)
    }
}

#[async_trait]
impl Init for SystemdRun {
    async fn start_process(&self, cgroup_parent: &str, command: &[String]) -> Result<String> {
        let args = Self::args(cgroup_parent, command)?;
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(self.path.to_string_lossy().into_owned());
        argv.extend(args.iter().cloned());

        tracing::debug!(command = ?argv, "Starting supervised process");
        let output = execute(&argv, "systemd-run", &args).await?;
        let unit = parse_unit_name(&output)?;
        tracing::info!(unit = %unit, "Supervised process started");
        Ok(unit)
    }
}

fn unit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"run-[A-Za-z0-9]+\.service").unwrap())
}

/// Extract the transient unit name from `systemd-run` output.
pub fn parse_unit_name(output: &[String]) -> Result<String> {
    output
        .iter()
        .find_map(|line| unit_re().find(line).map(|m| m.as_str().to_string()))
        .ok_or_else(|| {
            RktletError::ParseError(format!(
                "no unit name in systemd-run output: {}",
                output.join("\n")
            ))
        })
}

/// Map a cgroup parent path to the systemd slice that owns it.
///
/// The last path segment must be a `.slice` unit.
pub fn cgroup_parent_to_slice_name(cgroup_parent: &str) -> Result<String> {
    let last = cgroup_parent
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();

    if last.len() > ".slice".len() && last.ends_with(".slice") {
        Ok(last.to_string())
    } else {
        Err(RktletError::InvalidArgument(format!(
            "cgroup parent {:?} does not end in a systemd slice",
            cgroup_parent
        )))
    }
}
