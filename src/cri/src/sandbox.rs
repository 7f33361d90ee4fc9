//! Pod sandbox lifecycle.
//!
//! A CRI pod sandbox is an `rkt app sandbox` pod running as a transient
//! systemd unit. rkt reports the new pod UUID only through a file, so
//! creation waits on that file and then on the pod reaching `running`.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use notify::{RecursiveMode, Watcher};
use rktlet_core::{Cli, Init, PollConfig, Result, RktletError};
use tokio::sync::mpsc;

use crate::config_mapper::{generate_logging_app_command, generate_sandbox_command, LOGGING_APP_NAME};
use crate::cri_api::{PodSandbox, PodSandboxConfig, PodSandboxFilter, PodSandboxStatus};
use crate::engine;
use crate::filter::pod_sandbox_passes;
use crate::image_service::ImageResolver;
use crate::metadata::is_kubernetes_owned;
use crate::status::{to_pod_sandbox, to_pod_sandbox_status};

/// Attempts made to remove a stopped pod.
const REMOVE_ATTEMPTS: u32 = 5;
/// Delay between remove attempts.
const REMOVE_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(50);

/// Drives pod sandboxes through rkt and the supervisor.
pub struct SandboxController {
    cli: Arc<dyn Cli>,
    init: Arc<dyn Init>,
    images: Arc<dyn ImageResolver>,
    stage1_name: String,
    poll: PollConfig,
    logging_image: Option<String>,
}

impl SandboxController {
    pub fn new(
        cli: Arc<dyn Cli>,
        init: Arc<dyn Init>,
        images: Arc<dyn ImageResolver>,
        stage1_name: impl Into<String>,
        poll: PollConfig,
    ) -> Self {
        Self {
            cli,
            init,
            images,
            stage1_name: stage1_name.into(),
            poll,
            logging_image: None,
        }
    }

    /// Run the journal log helper app in every new sandbox that has a log directory.
    pub fn with_logging_image(mut self, image: Option<String>) -> Self {
        self.logging_image = image;
        self
    }

    /// Start a sandbox and wait for it to become ready.
    ///
    /// When the pod UUID is known but readiness is not observed in time, the
    /// returned [`RktletError::Timeout`] carries the UUID.
    pub async fn run(&self, config: &PodSandboxConfig) -> Result<String> {
        if config.metadata.is_none() {
            return Err(RktletError::InvalidArgument(
                "sandbox metadata required".to_string(),
            ));
        }

        let uuid_file = tempfile::Builder::new()
            .prefix("rktlet-uuid-")
            .tempfile()?;
        let args = generate_sandbox_command(config, uuid_file.path(), &self.stage1_name)?;
        let command = self.cli.command("app", &args);
        let cgroup_parent = config
            .linux
            .as_ref()
            .map(|l| l.cgroup_parent.as_str())
            .unwrap_or_default();

        let unit = self.init.start_process(cgroup_parent, &command).await?;
        tracing::debug!(unit = %unit, "Sandbox process launched");

        let uuid = wait_for_uuid(uuid_file.path(), self.poll).await?;
        tracing::info!(sandbox_id = %uuid, unit = %unit, "Sandbox UUID assigned");

        self.wait_until_ready(&uuid).await?;

        if let Some(image) = &self.logging_image {
            if !config.log_directory.is_empty() {
                if let Err(e) = self
                    .add_logging_app(&uuid, image, &config.log_directory)
                    .await
                {
                    tracing::warn!(sandbox_id = %uuid, error = %e, "Failed to add log helper app");
                }
            }
        }

        Ok(uuid)
    }

    async fn wait_until_ready(&self, uuid: &str) -> Result<()> {
        for attempt in 0..self.poll.attempts {
            match engine::pod_status(self.cli.as_ref(), uuid).await {
                Ok(pod) if pod.state == "running" => return Ok(()),
                Ok(pod) => {
                    tracing::trace!(sandbox_id = %uuid, state = %pod.state, attempt, "Sandbox not ready")
                }
                Err(e) => {
                    tracing::debug!(sandbox_id = %uuid, error = %e, attempt, "Sandbox status unavailable")
                }
            }
            tokio::time::sleep(self.poll.interval()).await;
        }

        Err(RktletError::Timeout {
            message: format!(
                "sandbox {} not ready after {:?}",
                uuid,
                self.poll.deadline()
            ),
            sandbox_id: Some(uuid.to_string()),
        })
    }

    async fn add_logging_app(&self, uuid: &str, image: &str, log_directory: &str) -> Result<()> {
        let image_id = self.images.resolve_image_id(image).await?;
        let args = generate_logging_app_command(uuid, &image_id, log_directory);
        self.cli.run_command("app", &args).await?;
        let start = vec![
            "start".to_string(),
            uuid.to_string(),
            format!("--app={}", LOGGING_APP_NAME),
        ];
        self.cli.run_command("app", &start).await?;
        tracing::info!(sandbox_id = %uuid, "Log helper app started");
        Ok(())
    }

    /// Stop a sandbox. Already stopped or unknown sandboxes are not an error.
    pub async fn stop(&self, id: &str, force: bool) -> Result<()> {
        let args = vec![format!("--force={}", force), id.to_string()];
        match self.cli.run_command("stop", &args).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_stopped() || e.is_no_such_pod() => {
                tracing::debug!(sandbox_id = %id, "Sandbox already stopped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Force-stop and remove a sandbox, retrying removal while rkt finishes cleanup.
    pub async fn remove(&self, id: &str) -> Result<()> {
        if let Err(e) = self.stop(id, true).await {
            tracing::warn!(sandbox_id = %id, error = %e, "Force stop failed, removing anyway");
        }

        let args = vec![id.to_string()];
        let mut last_error = None;
        for attempt in 0..REMOVE_ATTEMPTS {
            match self.cli.run_command("rm", &args).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_no_such_pod() => return Ok(()),
                Err(e) => {
                    tracing::debug!(sandbox_id = %id, attempt, error = %e, "Sandbox removal failed, retrying");
                    last_error = Some(e);
                }
            }
            tokio::time::sleep(REMOVE_RETRY_DELAY).await;
        }

        Err(last_error.unwrap_or_else(|| {
            RktletError::NotFound(format!("sandbox {} could not be removed", id))
        }))
    }

    /// Current status of a sandbox.
    pub async fn status(&self, id: &str) -> Result<PodSandboxStatus> {
        let pod = engine::pod_status(self.cli.as_ref(), id).await?;
        to_pod_sandbox_status(&pod)
    }

    /// Kubelet-owned sandboxes passing `filter`.
    pub async fn list(&self, filter: Option<&PodSandboxFilter>) -> Result<Vec<PodSandbox>> {
        let pods = engine::list_pods(self.cli.as_ref()).await?;
        let mut sandboxes = Vec::new();
        for pod in pods
            .iter()
            .filter(|p| is_kubernetes_owned(&p.user_annotations))
        {
            let sandbox = to_pod_sandbox(pod)?;
            if pod_sandbox_passes(&sandbox, filter) {
                sandboxes.push(sandbox);
            }
        }
        Ok(sandboxes)
    }
}

/// Wait until `path` holds a pod UUID.
///
/// A filesystem watch wakes the loop early; the interval bounds each sleep
/// either way, and the whole wait is bounded by `poll.deadline()`.
pub async fn wait_for_uuid(path: &Path, poll: PollConfig) -> Result<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    let _keep_open = tx.clone();
    let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            let _ = tx.send(());
        }
    })
    .and_then(|mut w| w.watch(path, RecursiveMode::NonRecursive).map(|_| w));
    let _watcher = match watcher {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "File watch unavailable, polling");
            None
        }
    };

    let deadline = Instant::now() + poll.deadline();
    loop {
        let uuid = read_uuid(path).await?;
        if !uuid.is_empty() {
            return Ok(uuid);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::select! {
            _ = rx.recv() => {}
            _ = tokio::time::sleep(poll.interval().min(remaining)) => {}
        }
    }

    Err(RktletError::Timeout {
        message: format!(
            "no pod UUID written to {} after {:?}",
            path.display(),
            poll.deadline()
        ),
        sandbox_id: None,
    })
}

async fn read_uuid(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(contents.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}
