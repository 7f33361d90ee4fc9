//! Command executor for the `rkt` command line.
//!
//! Every engine interaction goes through [`Cli::run_command`], which builds
//! `[rkt, <subcommand>, <global flags>..., <args>...]`, runs it and captures
//! the combined stdout/stderr as trimmed lines.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{Result, RktletError};

/// Environment variable enabling the engine's `app` subcommands.
pub const EXPERIMENT_APP_ENV: &str = "RKT_EXPERIMENT_APP";

/// Persistent global flags passed to every engine invocation.
///
/// Zero values are never rendered as flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliConfig {
    /// `--debug`
    #[serde(default)]
    pub debug: bool,
    /// `--dir`, the engine's data directory
    #[serde(default)]
    pub dir: String,
    /// `--local-config`
    #[serde(default)]
    pub local_config_dir: String,
    /// `--user-config`
    #[serde(default)]
    pub user_config_dir: String,
    /// `--system-config`
    #[serde(default)]
    pub system_config_dir: String,
    /// `--insecure-options`, joined with commas
    #[serde(default)]
    pub insecure_options: Vec<String>,
}

/// One global flag: its name, how to read it and whether an empty value is dropped.
struct FlagDescriptor {
    name: &'static str,
    value: fn(&CliConfig) -> String,
    omit_if_empty: bool,
}

fn debug_value(config: &CliConfig) -> String {
    if config.debug {
        "true".to_string()
    } else {
        String::new()
    }
}

fn dir_value(config: &CliConfig) -> String {
    config.dir.clone()
}

fn local_config_value(config: &CliConfig) -> String {
    config.local_config_dir.clone()
}

fn user_config_value(config: &CliConfig) -> String {
    config.user_config_dir.clone()
}

fn system_config_value(config: &CliConfig) -> String {
    config.system_config_dir.clone()
}

fn insecure_options_value(config: &CliConfig) -> String {
    config.insecure_options.join(",")
}

/// Emission order of the global flags.
const GLOBAL_FLAGS: &[FlagDescriptor] = &[
    FlagDescriptor {
        name: "debug",
        value: debug_value,
        omit_if_empty: true,
    },
    FlagDescriptor {
        name: "dir",
        value: dir_value,
        omit_if_empty: true,
    },
    FlagDescriptor {
        name: "local-config",
        value: local_config_value,
        omit_if_empty: true,
    },
    FlagDescriptor {
        name: "user-config",
        value: user_config_value,
        omit_if_empty: true,
    },
    FlagDescriptor {
        name: "system-config",
        value: system_config_value,
        omit_if_empty: true,
    },
    FlagDescriptor {
        name: "insecure-options",
        value: insecure_options_value,
        omit_if_empty: true,
    },
];

impl CliConfig {
    /// Start building a configuration.
    pub fn builder() -> CliConfigBuilder {
        CliConfigBuilder::default()
    }

    /// Render the configuration as `--name=value` flags in a fixed order.
    pub fn global_flags(&self) -> Vec<String> {
        GLOBAL_FLAGS
            .iter()
            .filter_map(|flag| {
                let value = (flag.value)(self);
                if flag.omit_if_empty && value.is_empty() {
                    None
                } else {
                    Some(format!("--{}={}", flag.name, value))
                }
            })
            .collect()
    }

    /// Layer `overrides` on top of this configuration.
    ///
    /// Every non-zero field of `overrides` replaces the base value; zero
    /// fields leave the base untouched.
    pub fn merge(&self, overrides: &CliConfig) -> CliConfig {
        fn pick(base: &str, over: &str) -> String {
            if over.is_empty() {
                base.to_string()
            } else {
                over.to_string()
            }
        }

        CliConfig {
            debug: self.debug || overrides.debug,
            dir: pick(&self.dir, &overrides.dir),
            local_config_dir: pick(&self.local_config_dir, &overrides.local_config_dir),
            user_config_dir: pick(&self.user_config_dir, &overrides.user_config_dir),
            system_config_dir: pick(&self.system_config_dir, &overrides.system_config_dir),
            insecure_options: if overrides.insecure_options.is_empty() {
                self.insecure_options.clone()
            } else {
                overrides.insecure_options.clone()
            },
        }
    }
}

/// Builder for [`CliConfig`].
#[derive(Debug, Default)]
pub struct CliConfigBuilder {
    config: CliConfig,
}

impl CliConfigBuilder {
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.config.dir = dir.into();
        self
    }

    pub fn local_config_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.local_config_dir = dir.into();
        self
    }

    pub fn user_config_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.user_config_dir = dir.into();
        self
    }

    pub fn system_config_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.system_config_dir = dir.into();
        self
    }

    pub fn insecure_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.insecure_options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> CliConfig {
        self.config
    }
}

/// Runs engine subcommands.
#[async_trait]
pub trait Cli: Send + Sync {
    /// Run `subcommand` with `args`, returning the trimmed output lines.
    async fn run_command(&self, subcommand: &str, args: &[String]) -> Result<Vec<String>>;

    /// The full argv `run_command` would execute, without running it.
    fn command(&self, subcommand: &str, args: &[String]) -> Vec<String>;

    /// A new executor whose global flags are this one's merged with `overrides`.
    fn with(&self, overrides: &CliConfig) -> Arc<dyn Cli>;
}

/// [`Cli`] implementation backed by the `rkt` binary.
#[derive(Debug, Clone)]
pub struct RktCli {
    rkt_path: PathBuf,
    config: CliConfig,
    global_flags: Vec<String>,
}

impl RktCli {
    /// Create an executor for the binary at `rkt_path`.
    pub fn new(rkt_path: impl Into<PathBuf>, config: CliConfig) -> Self {
        let global_flags = config.global_flags();
        Self {
            rkt_path: rkt_path.into(),
            config,
            global_flags,
        }
    }

    /// Path of the engine binary.
    pub fn rkt_path(&self) -> &Path {
        &self.rkt_path
    }

    /// Effective global configuration.
    pub fn config(&self) -> &CliConfig {
        &self.config
    }
}

#[async_trait]
impl Cli for RktCli {
    async fn run_command(&self, subcommand: &str, args: &[String]) -> Result<Vec<String>> {
        let argv = self.command(subcommand, args);
        tracing::debug!(command = ?argv, "Running rkt");
        execute(&argv, subcommand, args).await
    }

    fn command(&self, subcommand: &str, args: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(2 + self.global_flags.len() + args.len());
        argv.push(self.rkt_path.to_string_lossy().into_owned());
        argv.push(subcommand.to_string());
        argv.extend(self.global_flags.iter().cloned());
        argv.extend(args.iter().cloned());
        argv
    }

    fn with(&self, overrides: &CliConfig) -> Arc<dyn Cli> {
        Arc::new(RktCli::new(
            self.rkt_path.clone(),
            self.config.merge(overrides),
        ))
    }
}

/// Run `argv`, returning combined output lines or a [`RktletError::CommandFailed`]
/// labelled with `subcommand` and `args`.
pub(crate) async fn execute(
    argv: &[String],
    subcommand: &str,
    args: &[String],
) -> Result<Vec<String>> {
    let failed = |message: String, output: Vec<String>| RktletError::CommandFailed {
        subcommand: subcommand.to_string(),
        args: args.to_vec(),
        message,
        output,
    };

    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| failed("empty command line".to_string(), Vec::new()))?;

    let output = Command::new(program)
        .args(rest)
        .env(EXPERIMENT_APP_ENV, "true")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| failed(e.to_string(), Vec::new()))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let lines = split_lines(&combined);

    if !output.status.success() {
        return Err(failed(output.status.to_string(), lines));
    }
    Ok(lines)
}

/// Split command output into trimmed lines; blank output yields no lines.
pub fn split_lines(output: &str) -> Vec<String> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.lines().map(|line| line.trim().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_flag() {
        let config = CliConfig::builder().debug(true).build();
        assert_eq!(config.global_flags(), vec!["--debug=true"]);
    }

    #[test]
    fn test_debug_and_dir_flags() {
        let config = CliConfig::builder().debug(true).dir("foo").build();
        assert_eq!(config.global_flags(), vec!["--debug=true", "--dir=foo"]);
    }

    #[test]
    fn test_insecure_options_joined() {
        let config = CliConfig::builder()
            .debug(true)
            .insecure_options(["all", "all-run"])
            .build();
        assert_eq!(
            config.global_flags(),
            vec!["--debug=true", "--insecure-options=all,all-run"]
        );
    }

    #[test]
    fn test_zero_config_emits_nothing() {
        assert!(CliConfig::default().global_flags().is_empty());
    }

    #[test]
    fn test_flag_order_is_fixed() {
        let config = CliConfig::builder()
            .insecure_options(["image"])
            .system_config_dir("/sys")
            .user_config_dir("/user")
            .local_config_dir("/local")
            .dir("/data")
            .debug(true)
            .build();
        assert_eq!(
            config.global_flags(),
            vec![
                "--debug=true",
                "--dir=/data",
                "--local-config=/local",
                "--user-config=/user",
                "--system-config=/sys",
                "--insecure-options=image",
            ]
        );
    }

    #[test]
    fn test_merge_overrides_non_zero_fields() {
        let base = CliConfig::builder()
            .dir("/var/lib/rktlet/data")
            .insecure_options(["image", "ondisk"])
            .build();
        let overrides = CliConfig::builder().insecure_options(["all-run"]).build();

        let merged = base.merge(&overrides);
        assert_eq!(merged.dir, "/var/lib/rktlet/data");
        assert_eq!(merged.insecure_options, vec!["all-run"]);
        assert!(!merged.debug);
    }

    #[test]
    fn test_merge_with_zero_override_is_identity() {
        let base = CliConfig::builder().debug(true).dir("/data").build();
        assert_eq!(base.merge(&CliConfig::default()), base);
    }

    #[test]
    fn test_command_layout() {
        let cli = RktCli::new("/usr/bin/rkt", CliConfig::builder().dir("/data").build());
        let argv = cli.command("status", &["abc".to_string(), "--format=json".to_string()]);
        assert_eq!(
            argv,
            vec!["/usr/bin/rkt", "status", "--dir=/data", "abc", "--format=json"]
        );
    }

    #[test]
    fn test_with_does_not_mutate_base() {
        let cli = RktCli::new("rkt", CliConfig::builder().dir("/data").build());
        let scoped = cli.with(&CliConfig::builder().insecure_options(["image"]).build());

        assert_eq!(
            scoped.command("fetch", &[]),
            vec!["rkt", "fetch", "--dir=/data", "--insecure-options=image"]
        );
        assert_eq!(cli.command("fetch", &[]), vec!["rkt", "fetch", "--dir=/data"]);
    }

    #[test]
    fn test_split_lines() {
        assert_eq!(split_lines("  a \n b\n\n"), vec!["a", "b"]);
        assert!(split_lines(" \n ").is_empty());
    }

    #[tokio::test]
    async fn test_execute_captures_output() {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo one; echo two >&2".to_string(),
        ];
        let lines = execute(&argv, "sh", &[]).await.unwrap();
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_execute_sets_app_experiment() {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("echo ${}", EXPERIMENT_APP_ENV),
        ];
        let lines = execute(&argv, "sh", &[]).await.unwrap();
        assert_eq!(lines, vec!["true"]);
    }

    #[tokio::test]
    async fn test_execute_failure_carries_output() {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo broken; exit 3".to_string(),
        ];
        let err = execute(&argv, "sh", &["-c".to_string()]).await.unwrap_err();
        match err {
            RktletError::CommandFailed {
                subcommand,
                args,
                output,
                ..
            } => {
                assert_eq!(subcommand, "sh");
                assert_eq!(args, vec!["-c"]);
                assert_eq!(output, vec!["broken"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_missing_binary() {
        let argv = vec!["/nonexistent/rkt".to_string()];
        let err = execute(&argv, "version", &[]).await.unwrap_err();
        assert!(matches!(err, RktletError::CommandFailed { .. }));
    }
}
