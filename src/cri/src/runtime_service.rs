//! CRI RuntimeService implementation.
//!
//! Maps CRI pod/container lifecycle to rkt:
//! - Pod Sandbox → `rkt app sandbox` pod under a transient systemd unit
//! - Container → app inside that pod

use std::sync::Arc;

use tonic::{Request, Response, Status};

use rktlet_core::Cli;

use crate::container::ContainerController;
use crate::cri_api::runtime_service_server::RuntimeService;
use crate::cri_api::*;
use crate::error::error_to_status;
use crate::exec::ExecShim;
use crate::sandbox::SandboxController;
use crate::streaming::{ExecSession, StreamingHandle};

/// Name reported as the runtime.
pub const RUNTIME_NAME: &str = "rkt";
/// CRI API version served.
pub const RUNTIME_API_VERSION: &str = "v1";

/// rkt implementation of the CRI RuntimeService.
pub struct RktRuntimeService {
    cli: Arc<dyn Cli>,
    sandboxes: SandboxController,
    containers: ContainerController,
    exec: Arc<ExecShim>,
    streaming: StreamingHandle,
}

impl RktRuntimeService {
    pub fn new(
        cli: Arc<dyn Cli>,
        sandboxes: SandboxController,
        containers: ContainerController,
        exec: Arc<ExecShim>,
        streaming: StreamingHandle,
    ) -> Self {
        Self {
            cli,
            sandboxes,
            containers,
            exec,
            streaming,
        }
    }
}

/// Engine version from `rkt version` output (`rkt Version: X`).
pub fn parse_engine_version(output: &[String]) -> Option<String> {
    output
        .iter()
        .find_map(|line| line.strip_prefix("rkt Version:"))
        .map(|v| v.trim().to_string())
}

fn condition(kind: &str) -> RuntimeCondition {
    RuntimeCondition {
        r#type: kind.to_string(),
        status: true,
        reason: String::new(),
        message: String::new(),
    }
}

#[tonic::async_trait]
impl RuntimeService for RktRuntimeService {
    // ── Version ──────────────────────────────────────────────────────

    async fn version(
        &self,
        _request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        let output = self
            .cli
            .run_command("version", &[])
            .await
            .map_err(error_to_status)?;
        let runtime_version = parse_engine_version(&output)
            .ok_or_else(|| Status::internal(format!("unexpected rkt version output: {:?}", output)))?;

        Ok(Response::new(VersionResponse {
            version: rktlet_core::VERSION.to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version,
            runtime_api_version: RUNTIME_API_VERSION.to_string(),
        }))
    }

    // ── Pod Sandbox ──────────────────────────────────────────────────

    async fn run_pod_sandbox(
        &self,
        request: Request<RunPodSandboxRequest>,
    ) -> Result<Response<RunPodSandboxResponse>, Status> {
        let req = request.into_inner();
        let config = req
            .config
            .ok_or_else(|| Status::invalid_argument("sandbox config required"))?;
        let metadata = config
            .metadata
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("sandbox metadata required"))?;

        tracing::info!(
            name = %metadata.name,
            namespace = %metadata.namespace,
            "CRI RunPodSandbox"
        );

        let pod_sandbox_id = self.sandboxes.run(&config).await.map_err(error_to_status)?;

        Ok(Response::new(RunPodSandboxResponse { pod_sandbox_id }))
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<StopPodSandboxRequest>,
    ) -> Result<Response<StopPodSandboxResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(sandbox_id = %req.pod_sandbox_id, "CRI StopPodSandbox");

        self.sandboxes
            .stop(&req.pod_sandbox_id, false)
            .await
            .map_err(error_to_status)?;

        Ok(Response::new(StopPodSandboxResponse {}))
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<RemovePodSandboxRequest>,
    ) -> Result<Response<RemovePodSandboxResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(sandbox_id = %req.pod_sandbox_id, "CRI RemovePodSandbox");

        self.sandboxes
            .remove(&req.pod_sandbox_id)
            .await
            .map_err(error_to_status)?;

        Ok(Response::new(RemovePodSandboxResponse {}))
    }

    async fn pod_sandbox_status(
        &self,
        request: Request<PodSandboxStatusRequest>,
    ) -> Result<Response<PodSandboxStatusResponse>, Status> {
        let req = request.into_inner();
        let status = self
            .sandboxes
            .status(&req.pod_sandbox_id)
            .await
            .map_err(error_to_status)?;

        Ok(Response::new(PodSandboxStatusResponse {
            status: Some(status),
            info: Default::default(),
        }))
    }

    async fn list_pod_sandbox(
        &self,
        request: Request<ListPodSandboxRequest>,
    ) -> Result<Response<ListPodSandboxResponse>, Status> {
        let req = request.into_inner();
        let items = self
            .sandboxes
            .list(req.filter.as_ref())
            .await
            .map_err(error_to_status)?;

        Ok(Response::new(ListPodSandboxResponse { items }))
    }

    // ── Container ────────────────────────────────────────────────────

    async fn create_container(
        &self,
        request: Request<CreateContainerRequest>,
    ) -> Result<Response<CreateContainerResponse>, Status> {
        let req = request.into_inner();
        let config = req
            .config
            .ok_or_else(|| Status::invalid_argument("container config required"))?;

        tracing::info!(
            sandbox_id = %req.pod_sandbox_id,
            name = %config.metadata.as_ref().map(|m| m.name.as_str()).unwrap_or_default(),
            "CRI CreateContainer"
        );

        let container_id = self
            .containers
            .create(&req.pod_sandbox_id, &config, req.sandbox_config.as_ref())
            .await
            .map_err(error_to_status)?;

        Ok(Response::new(CreateContainerResponse { container_id }))
    }

    async fn start_container(
        &self,
        request: Request<StartContainerRequest>,
    ) -> Result<Response<StartContainerResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(container_id = %req.container_id, "CRI StartContainer");

        self.containers
            .start(&req.container_id)
            .await
            .map_err(error_to_status)?;

        Ok(Response::new(StartContainerResponse {}))
    }

    async fn stop_container(
        &self,
        request: Request<StopContainerRequest>,
    ) -> Result<Response<StopContainerResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(container_id = %req.container_id, timeout = req.timeout, "CRI StopContainer");

        self.containers
            .stop(&req.container_id)
            .await
            .map_err(error_to_status)?;

        Ok(Response::new(StopContainerResponse {}))
    }

    async fn remove_container(
        &self,
        request: Request<RemoveContainerRequest>,
    ) -> Result<Response<RemoveContainerResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(container_id = %req.container_id, "CRI RemoveContainer");

        self.containers
            .remove(&req.container_id)
            .await
            .map_err(error_to_status)?;

        Ok(Response::new(RemoveContainerResponse {}))
    }

    async fn container_status(
        &self,
        request: Request<ContainerStatusRequest>,
    ) -> Result<Response<ContainerStatusResponse>, Status> {
        let req = request.into_inner();
        let status = self
            .containers
            .status(&req.container_id)
            .await
            .map_err(error_to_status)?;

        Ok(Response::new(ContainerStatusResponse {
            status: Some(status),
            info: Default::default(),
        }))
    }

    async fn list_containers(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status> {
        let req = request.into_inner();
        let containers = self
            .containers
            .list(req.filter.as_ref())
            .await
            .map_err(error_to_status)?;

        Ok(Response::new(ListContainersResponse { containers }))
    }

    // ── Status ───────────────────────────────────────────────────────

    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        Ok(Response::new(StatusResponse {
            status: Some(RuntimeStatus {
                conditions: vec![condition("RuntimeReady"), condition("NetworkReady")],
            }),
            info: Default::default(),
        }))
    }

    async fn update_runtime_config(
        &self,
        _request: Request<UpdateRuntimeConfigRequest>,
    ) -> Result<Response<UpdateRuntimeConfigResponse>, Status> {
        Ok(Response::new(UpdateRuntimeConfigResponse {}))
    }

    // ── Exec / Attach / PortForward ──────────────────────────────────

    async fn exec_sync(
        &self,
        request: Request<ExecSyncRequest>,
    ) -> Result<Response<ExecSyncResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(container_id = %req.container_id, cmd = ?req.cmd, "CRI ExecSync");

        let output = self
            .exec
            .exec_sync(&req.container_id, &req.cmd)
            .await
            .map_err(error_to_status)?;

        Ok(Response::new(ExecSyncResponse {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
        }))
    }

    async fn exec(
        &self,
        request: Request<ExecRequest>,
    ) -> Result<Response<ExecResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(container_id = %req.container_id, tty = req.tty, "CRI Exec");

        if !(req.stdin || req.stdout || req.stderr) {
            return Err(Status::invalid_argument(
                "one of stdin, stdout, or stderr must be set",
            ));
        }
        // Validate the target before handing out a URL.
        self.exec
            .exec_command(&req.container_id, &req.cmd)
            .map_err(error_to_status)?;

        let url = self
            .streaming
            .register(ExecSession {
                container_id: req.container_id,
                cmd: req.cmd,
                tty: req.tty,
                stdin: req.stdin,
                stdout: req.stdout,
                stderr: req.stderr,
            })
            .await;

        Ok(Response::new(ExecResponse { url }))
    }

    async fn attach(
        &self,
        _request: Request<AttachRequest>,
    ) -> Result<Response<AttachResponse>, Status> {
        Err(Status::unimplemented("Attach is not supported by rktlet"))
    }

    async fn port_forward(
        &self,
        _request: Request<PortForwardRequest>,
    ) -> Result<Response<PortForwardResponse>, Status> {
        Err(Status::unimplemented("PortForward is not supported by rktlet"))
    }
}
