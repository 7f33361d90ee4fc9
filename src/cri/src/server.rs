//! gRPC server setup for CRI services.
//!
//! Listens on a Unix domain socket for CRI RuntimeService and ImageService RPCs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

use rktlet_core::{Cli, Init, Result, RktletConfig, RktletError};

use crate::container::ContainerController;
use crate::cri_api::image_service_server::ImageServiceServer;
use crate::cri_api::runtime_service_server::RuntimeServiceServer;
use crate::exec::ExecShim;
use crate::image_service::RktImageService;
use crate::runtime_service::RktRuntimeService;
use crate::sandbox::SandboxController;
use crate::streaming::StreamingServer;

/// The two CRI services behind one socket.
pub struct CriServer {
    /// Path to the Unix domain socket.
    socket_path: PathBuf,
    runtime: RktRuntimeService,
    images: Arc<RktImageService>,
}

impl CriServer {
    pub fn new(socket_path: PathBuf, runtime: RktRuntimeService, images: Arc<RktImageService>) -> Self {
        Self {
            socket_path,
            runtime,
            images,
        }
    }

    /// Wire every service from `config` around the given engine and supervisor.
    ///
    /// The streaming server is bound here and returned for the caller to run.
    pub async fn assemble(
        config: &RktletConfig,
        cli: Arc<dyn Cli>,
        init: Arc<dyn Init>,
    ) -> Result<(Self, StreamingServer)> {
        let stream_addr: SocketAddr = config.stream_server_address.parse().map_err(|e| {
            RktletError::ConfigError(format!(
                "invalid stream server address {:?}: {}",
                config.stream_server_address, e
            ))
        })?;

        let images = Arc::new(RktImageService::new(cli.clone(), &config.rkt_data_dir));
        let sandboxes = SandboxController::new(
            cli.clone(),
            init,
            images.clone(),
            config.stage1_name.clone(),
            config.poll,
        )
        .with_logging_image(config.logging_image.clone());
        let containers = ContainerController::new(cli.clone(), images.clone());
        let exec = Arc::new(ExecShim::new(cli.clone()));

        let streaming = StreamingServer::bind(stream_addr, exec.clone()).await?;
        let runtime = RktRuntimeService::new(cli, sandboxes, containers, exec, streaming.handle());

        Ok((Self::new(config.socket_path.clone(), runtime, images), streaming))
    }

    pub fn runtime(&self) -> &RktRuntimeService {
        &self.runtime
    }

    pub fn images(&self) -> &RktImageService {
        &self.images
    }

    /// Start serving CRI RPCs on the Unix socket.
    pub async fn serve(self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        // Remove existing socket file if present
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let uds = UnixListener::bind(&self.socket_path)?;
        let uds_stream = UnixListenerStream::new(uds);

        tracing::info!(
            socket = %self.socket_path.display(),
            "CRI server listening"
        );

        Server::builder()
            .add_service(RuntimeServiceServer::new(self.runtime))
            .add_service(ImageServiceServer::from_arc(self.images))
            .serve_with_incoming(uds_stream)
            .await?;

        Ok(())
    }
}
