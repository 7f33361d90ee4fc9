//! CRI ImageService implementation.
//!
//! Maps CRI image operations onto `rkt image` subcommands. rkt keeps no tag
//! index of its own, so tags are recovered from each image's manifest.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tonic::{Request, Response, Status};

use rktlet_core::{Cli, CliConfig, Result, RktletError};

use crate::cri_api::image_service_server::ImageService;
use crate::cri_api::*;
use crate::engine::{parse_json, ImageListEntry, ImageManifest};
use crate::error::error_to_status;

/// Manifest annotation holding the reference an image was fetched by.
pub const ANN_ORIGINAL_NAME: &str = "appc.io/docker/originalname";

const DEFAULT_DOMAIN: &str = "docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library/";
const DEFAULT_TAG: &str = "latest";

/// Resolves an image reference to the engine's local image ID.
#[async_trait]
pub trait ImageResolver: Send + Sync {
    async fn resolve_image_id(&self, image: &str) -> Result<String>;
}

/// Fully qualify an image reference: `busybox` becomes `docker.io/library/busybox:latest`.
pub fn normalize_image_ref(image: &str) -> String {
    let (name, suffix) = match image.split_once('@') {
        Some((name, digest)) => (name, format!("@{}", digest)),
        None => (image, String::new()),
    };

    let mut name = name.to_string();
    let first = name.split('/').next().unwrap_or_default();
    let has_domain = name.contains('/')
        && (first.contains('.') || first.contains(':') || first == "localhost");
    if !has_domain {
        if !name.contains('/') {
            name = format!("{}{}", OFFICIAL_REPO_PREFIX, name);
        }
        name = format!("{}/{}", DEFAULT_DOMAIN, name);
    }

    let last = name.rsplit('/').next().unwrap_or_default();
    if suffix.is_empty() && !last.contains(':') {
        name = format!("{}:{}", name, DEFAULT_TAG);
    }
    name + &suffix
}

/// rkt implementation of the CRI ImageService.
pub struct RktImageService {
    cli: Arc<dyn Cli>,
    data_dir: PathBuf,
}

impl RktImageService {
    pub fn new(cli: Arc<dyn Cli>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            cli,
            data_dir: data_dir.into(),
        }
    }

    async fn list_entries(&self) -> Result<Vec<ImageListEntry>> {
        let args = vec![
            "list".to_string(),
            "--full".to_string(),
            "--format=json".to_string(),
            "--sort=importtime".to_string(),
        ];
        let output = self.cli.run_command("image", &args).await?;
        if output.is_empty() {
            return Ok(Vec::new());
        }
        let entries: Option<Vec<ImageListEntry>> = parse_json(&output)?;
        Ok(entries.unwrap_or_default())
    }

    async fn manifest(&self, id: &str) -> Result<ImageManifest> {
        let args = vec!["cat-manifest".to_string(), id.to_string()];
        let output = self.cli.run_command("image", &args).await?;
        parse_json(&output)
    }

    /// Every local image translated to its CRI form.
    async fn images(&self) -> Result<Vec<Image>> {
        let mut images = Vec::new();
        for entry in self.list_entries().await? {
            let manifest = self.manifest(&entry.id).await?;
            images.push(to_cri_image(&entry, &manifest));
        }
        Ok(images)
    }

    /// First image tagged with the normalised form of `image`.
    async fn find_image(&self, image: &str) -> Result<Option<Image>> {
        let wanted = normalize_image_ref(image);
        let found = self
            .images()
            .await?
            .into_iter()
            .find(|img| img.id == image || img.repo_tags.iter().any(|t| *t == wanted));
        Ok(found)
    }

    async fn pull(&self, image: &str) -> Result<String> {
        let reference = normalize_image_ref(image);
        let insecure = CliConfig::builder().insecure_options(["image"]).build();
        let args = vec![
            "fetch".to_string(),
            "--pull-policy=update".to_string(),
            "--full=true".to_string(),
            format!("docker://{}", reference),
        ];
        let output = self.cli.with(&insecure).run_command("image", &args).await?;
        output
            .iter()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .ok_or_else(|| {
                RktletError::ParseError(format!("no image id in fetch output for {}", reference))
            })
    }

    async fn remove(&self, image: &str) -> Result<()> {
        let id = match self.resolve_image_id(image).await {
            Ok(id) => id,
            Err(RktletError::NotFound(_)) => {
                tracing::debug!(image = %image, "Image already absent");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.cli
            .run_command("image", &["rm".to_string(), id])
            .await?;
        Ok(())
    }

    async fn fs_usage(&self) -> Result<FilesystemUsage> {
        let used: u64 = self.list_entries().await?.iter().map(|e| e.size).sum();
        Ok(FilesystemUsage {
            timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            fs_id: Some(FilesystemIdentifier {
                mountpoint: self.data_dir.display().to_string(),
            }),
            used_bytes: Some(UInt64Value { value: used }),
            inodes_used: None,
        })
    }
}

#[async_trait]
impl ImageResolver for RktImageService {
    async fn resolve_image_id(&self, image: &str) -> Result<String> {
        self.find_image(image)
            .await?
            .map(|img| img.id)
            .ok_or_else(|| RktletError::NotFound(format!("image {}", image)))
    }
}

fn to_cri_image(entry: &ImageListEntry, manifest: &ImageManifest) -> Image {
    let original = manifest
        .annotation(ANN_ORIGINAL_NAME)
        .unwrap_or(entry.name.as_str());
    let tag = normalize_image_ref(original);

    let user = manifest
        .app
        .as_ref()
        .map(|a| a.user.as_str())
        .unwrap_or_default();
    let (uid, username) = match user.parse::<i64>() {
        Ok(uid) => (Some(Int64Value { value: uid }), String::new()),
        Err(_) => (None, user.to_string()),
    };

    Image {
        id: entry.id.clone(),
        repo_tags: vec![tag.clone()],
        repo_digests: Vec::new(),
        size: entry.size,
        uid,
        username,
        spec: Some(ImageSpec {
            image: tag,
            annotations: Default::default(),
        }),
        pinned: false,
    }
}

fn image_name(spec: Option<ImageSpec>) -> std::result::Result<String, Status> {
    spec.map(|s| s.image)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Status::invalid_argument("image spec required"))
}

#[tonic::async_trait]
impl ImageService for RktImageService {
    async fn list_images(
        &self,
        request: Request<ListImagesRequest>,
    ) -> std::result::Result<Response<ListImagesResponse>, Status> {
        let req = request.into_inner();
        let wanted = req
            .filter
            .and_then(|f| f.image)
            .map(|s| s.image)
            .filter(|s| !s.is_empty())
            .map(|s| normalize_image_ref(&s));

        let images = self
            .images()
            .await
            .map_err(error_to_status)?
            .into_iter()
            .filter(|img| match &wanted {
                Some(tag) => img.repo_tags.iter().any(|t| t == tag),
                None => true,
            })
            .collect();

        Ok(Response::new(ListImagesResponse { images }))
    }

    async fn image_status(
        &self,
        request: Request<ImageStatusRequest>,
    ) -> std::result::Result<Response<ImageStatusResponse>, Status> {
        let image = image_name(request.into_inner().image)?;
        let found = self.find_image(&image).await.map_err(error_to_status)?;

        Ok(Response::new(ImageStatusResponse {
            image: found,
            info: Default::default(),
        }))
    }

    async fn pull_image(
        &self,
        request: Request<PullImageRequest>,
    ) -> std::result::Result<Response<PullImageResponse>, Status> {
        let image = image_name(request.into_inner().image)?;
        tracing::info!(image = %image, "CRI PullImage");

        let image_ref = self.pull(&image).await.map_err(error_to_status)?;
        tracing::info!(image = %image, image_ref = %image_ref, "Image pulled");

        Ok(Response::new(PullImageResponse { image_ref }))
    }

    async fn remove_image(
        &self,
        request: Request<RemoveImageRequest>,
    ) -> std::result::Result<Response<RemoveImageResponse>, Status> {
        let image = image_name(request.into_inner().image)?;
        tracing::info!(image = %image, "CRI RemoveImage");

        self.remove(&image).await.map_err(error_to_status)?;
        Ok(Response::new(RemoveImageResponse {}))
    }

    async fn image_fs_info(
        &self,
        _request: Request<ImageFsInfoRequest>,
    ) -> std::result::Result<Response<ImageFsInfoResponse>, Status> {
        let usage = self.fs_usage().await.map_err(error_to_status)?;
        Ok(Response::new(ImageFsInfoResponse {
            image_filesystems: vec![usage],
        }))
    }
}
