//! Scripted stand-ins for the engine and supervisor used by unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rktlet_core::{Cli, CliConfig, Init, Result, RktletError};

type CliHandler = dyn Fn(&str, &[String]) -> Result<Vec<String>> + Send + Sync;
type InitHandler = dyn Fn(&[String]) -> Result<String> + Send + Sync;

/// A [`Cli`] that answers from a closure and records every invocation.
#[derive(Clone)]
pub struct FakeCli {
    handler: Arc<CliHandler>,
    config: CliConfig,
    calls: Arc<Mutex<Vec<Vec<String>>>>,
    flags: Arc<Mutex<Vec<Vec<String>>>>,
}

impl FakeCli {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &[String]) -> Result<Vec<String>> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            config: CliConfig::default(),
            calls: Arc::new(Mutex::new(Vec::new())),
            flags: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Use `config` as the base configuration.
    pub fn with_config(mut self, config: CliConfig) -> Self {
        self.config = config;
        self
    }

    /// Every `[subcommand, args...]` run so far.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Global flags in effect for each call, in call order.
    pub fn global_flags(&self) -> Vec<Vec<String>> {
        self.flags.lock().unwrap().clone()
    }
}

#[async_trait]
impl Cli for FakeCli {
    async fn run_command(&self, subcommand: &str, args: &[String]) -> Result<Vec<String>> {
        let mut call = vec![subcommand.to_string()];
        call.extend(args.iter().cloned());
        self.calls.lock().unwrap().push(call);
        self.flags.lock().unwrap().push(self.config.global_flags());
        (self.handler)(subcommand, args)
    }

    fn command(&self, subcommand: &str, args: &[String]) -> Vec<String> {
        let mut argv = vec!["rkt".to_string(), subcommand.to_string()];
        argv.extend(args.iter().cloned());
        argv
    }

    fn with(&self, overrides: &CliConfig) -> Arc<dyn Cli> {
        let mut layered = self.clone();
        layered.config = self.config.merge(overrides);
        Arc::new(layered)
    }
}

/// A [`Cli`] whose exec command line is the exec'd command itself, run on the host.
pub struct HostCli;

#[async_trait]
impl Cli for HostCli {
    async fn run_command(&self, _subcommand: &str, _args: &[String]) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn command(&self, _subcommand: &str, args: &[String]) -> Vec<String> {
        // args: ["exec", "--app=<name>", "<uuid>", cmd...]
        args[3..].to_vec()
    }

    fn with(&self, _overrides: &CliConfig) -> Arc<dyn Cli> {
        Arc::new(HostCli)
    }
}

/// An [`Init`] that answers from a closure.
pub struct FakeInit {
    handler: Box<InitHandler>,
}

impl FakeInit {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&[String]) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
        }
    }

    /// Supervisor that writes `uuid` to the file named by `--uuid-file-save=`.
    pub fn writing_uuid(uuid: &'static str) -> Self {
        Self::new(move |argv| {
            let path = argv
                .iter()
                .find_map(|a| a.strip_prefix("--uuid-file-save="))
                .ok_or_else(|| RktletError::InvalidArgument("no uuid file".to_string()))?;
            std::fs::write(path, format!("{}\n", uuid))?;
            Ok("run-r1.service".to_string())
        })
    }

    /// Run the handler directly, for composing fakes.
    pub fn handle(&self, command: &[String]) -> Result<String> {
        (self.handler)(command)
    }
}

#[async_trait]
impl Init for FakeInit {
    async fn start_process(&self, _cgroup_parent: &str, command: &[String]) -> Result<String> {
        (self.handler)(command)
    }
}

/// A failed engine invocation with the given output.
pub fn command_failed(subcommand: &str, output: &str) -> RktletError {
    RktletError::CommandFailed {
        subcommand: subcommand.to_string(),
        args: Vec::new(),
        message: "exit status: 254".to_string(),
        output: vec![output.to_string()],
    }
}
