//! Container lifecycle.
//!
//! A CRI container is an rkt app inside a sandbox pod, addressed by the
//! composite `<sandbox id>:<app name>` identifier.

use std::sync::Arc;

use rktlet_core::{Cli, Result, RktletError};

use crate::config_mapper::{generate_app_add_command, INTERNAL_APP_PREFIX};
use crate::cri_api::{Container, ContainerConfig, ContainerFilter, ContainerStatus, PodSandboxConfig};
use crate::engine;
use crate::filter::container_passes;
use crate::image_service::ImageResolver;
use crate::metadata::{build_app_name, build_container_id, is_kubernetes_owned, parse_container_id};
use crate::status::{to_container, to_container_status};

/// Drives containers through `rkt app` subcommands.
pub struct ContainerController {
    cli: Arc<dyn Cli>,
    images: Arc<dyn ImageResolver>,
}

impl ContainerController {
    pub fn new(cli: Arc<dyn Cli>, images: Arc<dyn ImageResolver>) -> Self {
        Self { cli, images }
    }

    /// Add a container to `sandbox_id`, returning its composite ID.
    pub async fn create(
        &self,
        sandbox_id: &str,
        config: &ContainerConfig,
        sandbox_config: Option<&PodSandboxConfig>,
    ) -> Result<String> {
        let metadata = config
            .metadata
            .as_ref()
            .ok_or_else(|| RktletError::InvalidArgument("container metadata required".to_string()))?;
        let image = config
            .image
            .as_ref()
            .map(|i| i.image.as_str())
            .unwrap_or_default();
        if image.is_empty() {
            return Err(RktletError::InvalidArgument(
                "container image required".to_string(),
            ));
        }

        let image_id = self.images.resolve_image_id(image).await?;
        let args = generate_app_add_command(config, sandbox_config, sandbox_id, &image_id)?;
        self.cli.run_command("app", &args).await?;

        let app_name = build_app_name(metadata.attempt, &metadata.name);
        Ok(build_container_id(sandbox_id, &app_name))
    }

    pub async fn start(&self, container_id: &str) -> Result<()> {
        self.run_app_command("start", container_id).await
    }

    /// Stop a container. An already stopped container is not an error.
    pub async fn stop(&self, container_id: &str) -> Result<()> {
        match self.run_app_command("stop", container_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_stopped() || e.is_no_such_pod() => {
                tracing::debug!(container_id = %container_id, "Container already stopped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn remove(&self, container_id: &str) -> Result<()> {
        self.run_app_command("rm", container_id).await
    }

    /// `rkt app <action> <uuid> --app=<name>`
    async fn run_app_command(&self, action: &str, container_id: &str) -> Result<()> {
        let (sandbox_id, app_name) = parse_container_id(container_id)?;
        let args = vec![action.to_string(), sandbox_id, format!("--app={}", app_name)];
        self.cli.run_command("app", &args).await?;
        Ok(())
    }

    pub async fn status(&self, container_id: &str) -> Result<ContainerStatus> {
        let (sandbox_id, app_name) = parse_container_id(container_id)?;
        let app = engine::app_status(self.cli.as_ref(), &sandbox_id, &app_name).await?;
        to_container_status(&sandbox_id, &app)
    }

    /// Every container of every kubelet-owned pod that passes `filter`.
    ///
    /// rkt has no batch app status, so each app is queried separately.
    pub async fn list(&self, filter: Option<&ContainerFilter>) -> Result<Vec<Container>> {
        let pods = engine::list_pods(self.cli.as_ref()).await?;
        let wanted_sandbox = filter
            .map(|f| f.pod_sandbox_id.as_str())
            .filter(|id| !id.is_empty());

        let mut containers = Vec::new();
        for pod in pods
            .iter()
            .filter(|p| is_kubernetes_owned(&p.user_annotations))
            .filter(|p| wanted_sandbox.map_or(true, |id| id == p.uuid))
        {
            for app_name in pod
                .app_names
                .iter()
                .filter(|n| !n.starts_with(INTERNAL_APP_PREFIX))
            {
                let status = match engine::app_status(self.cli.as_ref(), &pod.uuid, app_name)
                    .await
                    .and_then(|app| to_container_status(&pod.uuid, &app))
                {
                    Ok(status) => status,
                    Err(e) => {
                        tracing::warn!(sandbox_id = %pod.uuid, app = %app_name, error = %e, "Skipping container without status");
                        continue;
                    }
                };
                let container = to_container(&pod.uuid, status);
                if container_passes(&container, filter) {
                    containers.push(container);
                }
            }
        }
        Ok(containers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_mapper::LOGGING_APP_NAME;
    use crate::cri_api::{ContainerMetadata, ContainerState, ImageSpec};
    use crate::fake::{command_failed, FakeCli};
    use crate::metadata::ANN_POD_UID;

    struct StaticImages;

    #[async_trait::async_trait]
    impl ImageResolver for StaticImages {
        async fn resolve_image_id(&self, image: &str) -> Result<String> {
            match image {
                "busybox" => Ok("sha512-bbb".to_string()),
                other => Err(RktletError::NotFound(other.to_string())),
            }
        }
    }

    fn controller(cli: &FakeCli) -> ContainerController {
        ContainerController::new(Arc::new(cli.clone()), Arc::new(StaticImages))
    }

    fn config(image: &str) -> ContainerConfig {
        ContainerConfig {
            metadata: Some(ContainerMetadata {
                name: "Web".to_string(),
                attempt: 2,
            }),
            image: Some(ImageSpec {
                image: image.to_string(),
                ..Default::default()
            }),
            command: vec!["/bin/sh".to_string()],
            ..Default::default()
        }
    }

    fn app_json(name: &str, state: &str, exit_code: i32) -> String {
        format!(
            r#"{{"name":"{}","state":"{}","exit_code":{},"image_id":"sha512-bbb"}}"#,
            name, state, exit_code
        )
    }

    #[tokio::test]
    async fn test_create_returns_composite_id() {
        let cli = FakeCli::new(|_, _| Ok(vec![]));
        let id = controller(&cli)
            .create("4a1f", &config("busybox"), None)
            .await
            .unwrap();
        assert_eq!(id, "4a1f:2-web");

        let calls = cli.calls();
        assert_eq!(&calls[0][..5], &["app", "add", "4a1f", "sha512-bbb", "--name=2-web"]);
    }

    #[tokio::test]
    async fn test_create_unknown_image() {
        let cli = FakeCli::new(|_, _| Ok(vec![]));
        let err = controller(&cli)
            .create("4a1f", &config("nginx"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RktletError::NotFound(_)));
        assert!(cli.calls().is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_commands_are_scoped_to_app() {
        let cli = FakeCli::new(|_, _| Ok(vec![]));
        let containers = controller(&cli);
        containers.start("4a1f:2-web").await.unwrap();
        containers.stop("4a1f:2-web").await.unwrap();
        containers.remove("4a1f:2-web").await.unwrap();

        let calls = cli.calls();
        assert_eq!(calls[0], vec!["app", "start", "4a1f", "--app=2-web"]);
        assert_eq!(calls[1], vec!["app", "stop", "4a1f", "--app=2-web"]);
        assert_eq!(calls[2], vec!["app", "rm", "4a1f", "--app=2-web"]);
    }

    #[tokio::test]
    async fn test_malformed_id_skips_engine() {
        let cli = FakeCli::new(|_, _| Ok(vec![]));
        let err = controller(&cli).start("no-separator").await.unwrap_err();
        assert!(matches!(err, RktletError::InvalidArgument(_)));
        assert!(cli.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_already_stopped() {
        let cli = FakeCli::new(|_, _| Err(command_failed("app", r#"pod "4a1f" is already stopped"#)));
        controller(&cli).stop("4a1f:2-web").await.unwrap();
    }

    #[tokio::test]
    async fn test_status_reports_exit_code() {
        let cli = FakeCli::new(|_, _| Ok(vec![app_json("2-web", "exited", 42)]));
        let status = controller(&cli).status("4a1f:2-web").await.unwrap();
        assert_eq!(status.id, "4a1f:2-web");
        assert_eq!(status.state, ContainerState::ContainerExited as i32);
        assert_eq!(status.exit_code, 42);
        assert_eq!(status.reason, "Error");
    }

    #[tokio::test]
    async fn test_list_skips_internal_apps() {
        let cli = FakeCli::new(|sub, args| match sub {
            "list" => Ok(vec![format!(
                r#"[{{"name":"4a1f","state":"running","app_names":["2-web","{}"],"user_annotations":{{"{}":"u"}}}}]"#,
                LOGGING_APP_NAME, ANN_POD_UID
            )]),
            _ => {
                let app = args[2].trim_start_matches("--app=");
                Ok(vec![app_json(app, "running", 0)])
            }
        });
        let containers = controller(&cli).list(None).await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].id, "4a1f:2-web");
        assert_eq!(containers[0].pod_sandbox_id, "4a1f");
        assert_eq!(cli.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_list_skips_vanished_app() {
        let cli = FakeCli::new(|sub, args| match sub {
            "list" => Ok(vec![format!(
                r#"[{{"name":"4a1f","state":"running","app_names":["0-a","0-b"],"user_annotations":{{"{}":"u"}}}}]"#,
                ANN_POD_UID
            )]),
            _ => match args[2].trim_start_matches("--app=") {
                "0-b" => Err(command_failed("app", "no such app 0-b")),
                app => Ok(vec![app_json(app, "running", 0)]),
            },
        });
        let containers = controller(&cli).list(None).await.unwrap();
        let ids: Vec<&str> = containers.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["4a1f:0-a"]);
    }

    #[tokio::test]
    async fn test_list_by_sandbox_skips_other_pods() {
        let cli = FakeCli::new(|sub, _| match sub {
            "list" => Ok(vec![format!(
                r#"[{{"name":"other","state":"running","app_names":["0-db"],"user_annotations":{{"{}":"u"}}}}]"#,
                ANN_POD_UID
            )]),
            _ => Ok(vec![app_json("0-db", "running", 0)]),
        });
        let filter = ContainerFilter {
            pod_sandbox_id: "4a1f".to_string(),
            ..Default::default()
        };
        let containers = controller(&cli).list(Some(&filter)).await.unwrap();
        assert!(containers.is_empty());
        assert_eq!(cli.calls().len(), 1);
    }
}
