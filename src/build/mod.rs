// Image Publisher
//
// Builds the gateway image from a staged build context and copies it into the
// stack's repository under the deployment tag. A failure here aborts the
// whole provisioning run before anything can reference the image.

pub mod context;
mod docker;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ProvisionError, ProvisionResult};
use crate::provision::ImagePipeline;
use crate::registry::{RegistryApi, RegistryCredentials};
use crate::resources::{
    ImageAsset, ImageDeployment, RegistryRepository, ResourceId, ResourceOutputs,
};
use context::StagedContext;

/// Read an environment variable, treating empty strings as if the variable is not set.
pub(crate) fn env_var_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Produces and pushes images
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build the staged context as `image_tag`; returns the local image digest
    async fn build(
        &self,
        asset: &ImageAsset,
        staged: &StagedContext,
        image_tag: &str,
    ) -> Result<String>;

    /// Whether images can be pushed to a remote registry
    fn can_push(&self) -> bool;

    /// Tag `source` as `target` and push it
    async fn push(
        &self,
        source: &str,
        target: &str,
        credentials: &RegistryCredentials,
    ) -> Result<()>;
}

/// Builds with the Docker (or Podman) CLI
pub struct DockerBuilder {
    container_cli: String,
}

impl DockerBuilder {
    pub fn new(container_cli: Option<&str>) -> Self {
        let container_cli = container_cli
            .map(|s| s.to_string())
            .or_else(|| env_var_non_empty("GATEWAY_CONTAINER_CLI"))
            .unwrap_or_else(|| "docker".to_string());
        Self { container_cli }
    }
}

#[async_trait]
impl ImageBuilder for DockerBuilder {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn build(
        &self,
        asset: &ImageAsset,
        staged: &StagedContext,
        image_tag: &str,
    ) -> Result<String> {
        let cli = self.container_cli.clone();
        let dir = staged.path().to_path_buf();
        let build_file = asset.build_file.clone();
        let platform = asset.platform.clone();
        let tag = image_tag.to_string();
        tokio::task::spawn_blocking(move || {
            docker::build_image(&cli, &dir, &build_file, &platform, &tag)?;
            docker::image_id(&cli, &tag)
        })
        .await?
    }

    fn can_push(&self) -> bool {
        true
    }

    async fn push(
        &self,
        source: &str,
        target: &str,
        credentials: &RegistryCredentials,
    ) -> Result<()> {
        let cli = self.container_cli.clone();
        let source = source.to_string();
        let target = target.to_string();
        let credentials = credentials.clone();
        tokio::task::spawn_blocking(move || {
            docker::docker_login(
                &cli,
                &credentials.server,
                &credentials.username,
                &credentials.password,
            )?;
            docker::tag_image(&cli, &source, &target)?;
            docker::docker_push(&cli, &target)
        })
        .await?
    }
}

/// Offline builder: the staged context digest stands in for the image.
///
/// Useful against the local registry and in tests; cannot push anywhere.
pub struct StaticBuilder;

#[async_trait]
impl ImageBuilder for StaticBuilder {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn build(
        &self,
        asset: &ImageAsset,
        staged: &StagedContext,
        image_tag: &str,
    ) -> Result<String> {
        if !staged.contains(&asset.build_file) {
            bail!(
                "Build file '{}' not found in build context '{}'",
                asset.build_file,
                asset.context_dir
            );
        }
        debug!("Recorded static image {}", image_tag);
        Ok(format!("sha256:{}", staged.digest))
    }

    fn can_push(&self) -> bool {
        false
    }

    async fn push(&self, _source: &str, target: &str, _: &RegistryCredentials) -> Result<()> {
        bail!("The static builder cannot push {} to a remote registry", target)
    }
}

/// Output keys written by the publisher
pub mod outputs {
    pub const REPOSITORY_NAME: &str = "repository_name";
    pub const REPOSITORY_URI: &str = "repository_uri";
    pub const ARN: &str = "arn";
    pub const CONTEXT_DIGEST: &str = "context_digest";
    pub const ASSET_TAG: &str = "asset_tag";
    pub const IMAGE_DIGEST: &str = "image_digest";
    pub const IMAGE_URI: &str = "image_uri";
    pub const TAG: &str = "tag";
}

pub struct ImagePublisher {
    builder: Arc<dyn ImageBuilder>,
    registry: Arc<dyn RegistryApi>,
    /// Base directory relative context paths are resolved against
    base_dir: std::path::PathBuf,
}

impl ImagePublisher {
    pub fn new(
        builder: Arc<dyn ImageBuilder>,
        registry: Arc<dyn RegistryApi>,
        base_dir: &Path,
    ) -> Self {
        Self {
            builder,
            registry,
            base_dir: base_dir.to_path_buf(),
        }
    }

    fn context_root(&self, asset: &ImageAsset) -> std::path::PathBuf {
        self.base_dir.join(&asset.context_dir)
    }
}

#[async_trait]
impl ImagePipeline for ImagePublisher {
    async fn ensure_registry(
        &self,
        repository: &RegistryRepository,
    ) -> ProvisionResult<ResourceOutputs> {
        let info = self
            .registry
            .ensure_repository(repository)
            .await
            .map_err(|e| ProvisionError::Backend {
                resource: repository.id.clone(),
                message: format!("{:#}", e),
            })?;
        let mut out = ResourceOutputs::new();
        out.insert(outputs::REPOSITORY_NAME.into(), info.name);
        out.insert(outputs::REPOSITORY_URI.into(), info.uri);
        out.insert(outputs::ARN.into(), info.arn);
        Ok(out)
    }

    async fn delete_registry(&self, id: &ResourceId, repository_name: &str) -> ProvisionResult<()> {
        self.registry
            .delete_repository(repository_name)
            .await
            .map_err(|e| ProvisionError::Backend {
                resource: id.clone(),
                message: format!("{:#}", e),
            })
    }

    async fn asset_digest(&self, asset: &ImageAsset) -> ProvisionResult<String> {
        let root = self.context_root(asset);
        let excludes = asset.excludes.clone();
        tokio::task::spawn_blocking(move || context::context_digest(&root, &excludes))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r)
            .map_err(|e| ProvisionError::Build {
                resource: asset.id.clone(),
                message: format!("{:#}", e),
            })
    }

    async fn build(&self, asset: &ImageAsset) -> ProvisionResult<ResourceOutputs> {
        let build_error = |e: anyhow::Error| ProvisionError::Build {
            resource: asset.id.clone(),
            message: format!("{:#}", e),
        };

        let root = self.context_root(asset);
        let excludes = asset.excludes.clone();
        let staged = tokio::task::spawn_blocking(move || StagedContext::stage(&root, &excludes))
            .await
            .map_err(|e| build_error(e.into()))?
            .map_err(build_error)?;

        let local_tag = format!("gateway-stack/{}:{}", asset.id.name(), staged.asset_tag());
        info!(
            asset = %asset.id,
            builder = self.builder.name(),
            files = staged.file_count,
            "Building image {}",
            local_tag
        );
        let image_digest = self
            .builder
            .build(asset, &staged, &local_tag)
            .await
            .map_err(build_error)?;

        let mut out = ResourceOutputs::new();
        out.insert(outputs::CONTEXT_DIGEST.into(), staged.digest.clone());
        out.insert(outputs::ASSET_TAG.into(), local_tag);
        out.insert(outputs::IMAGE_DIGEST.into(), image_digest);
        Ok(out)
    }

    async fn publish(
        &self,
        deployment: &ImageDeployment,
        asset: &ResourceOutputs,
        registry: &ResourceOutputs,
    ) -> ProvisionResult<ResourceOutputs> {
        let publish_error = |message: String| ProvisionError::Publish {
            resource: deployment.id.clone(),
            message,
        };
        let get = |outputs: &ResourceOutputs, key: &str| -> ProvisionResult<String> {
            outputs
                .get(key)
                .cloned()
                .ok_or_else(|| publish_error(format!("missing {} output", key)))
        };

        let repository_name = get(registry, outputs::REPOSITORY_NAME)?;
        let repository_uri = get(registry, outputs::REPOSITORY_URI)?;
        let local_tag = get(asset, outputs::ASSET_TAG)?;
        let local_digest = get(asset, outputs::IMAGE_DIGEST)?;
        let target = format!("{}:{}", repository_uri, deployment.tag);

        let credentials = self
            .registry
            .credentials()
            .await
            .map_err(|e| publish_error(format!("{:#}", e)))?;
        if let Some(credentials) = credentials {
            if !self.builder.can_push() {
                return Err(publish_error(format!(
                    "builder '{}' cannot push to {}",
                    self.builder.name(),
                    credentials.server
                )));
            }
            self.builder
                .push(&local_tag, &target, &credentials)
                .await
                .map_err(|e| publish_error(format!("{:#}", e)))?;
        }

        let record = self
            .registry
            .confirm_push(&repository_name, &deployment.tag, &local_digest)
            .await
            .map_err(|e| publish_error(format!("{:#}", e)))?;

        info!(
            image = %target,
            digest = %record.digest,
            "Published image"
        );

        let mut out = ResourceOutputs::new();
        out.insert(outputs::IMAGE_URI.into(), target);
        out.insert(outputs::IMAGE_DIGEST.into(), record.digest);
        out.insert(outputs::TAG.into(), deployment.tag.clone());
        out.insert(outputs::REPOSITORY_NAME.into(), repository_name);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ImagePublisher, Arc<MemoryRegistry>) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/Dockerfile_cursor"), "FROM scratch\n").unwrap();
        let registry = Arc::new(MemoryRegistry::new("us-east-1", "123456789012"));
        let publisher = ImagePublisher::new(Arc::new(StaticBuilder), registry.clone(), dir.path());
        (dir, publisher, registry)
    }

    #[tokio::test]
    async fn test_build_then_publish_to_local_registry() {
        let (_dir, publisher, registry) = setup();
        let repo = RegistryRepository::new("repo", "bedrock-proxy-api-ecs", 10);
        let asset = ImageAsset::new("asset", "src", "Dockerfile_cursor");
        let deployment = ImageDeployment::new("copy", &asset.id, &repo.id, "latest");

        let repo_out = publisher.ensure_registry(&repo).await.unwrap();
        let asset_out = publisher.build(&asset).await.unwrap();
        assert!(asset_out[outputs::ASSET_TAG].contains(":asset-"));

        let published = publisher
            .publish(&deployment, &asset_out, &repo_out)
            .await
            .unwrap();
        assert_eq!(
            published[outputs::IMAGE_URI],
            "123456789012.dkr.ecr.us-east-1.amazonaws.com/bedrock-proxy-api-ecs:latest"
        );
        assert_eq!(published[outputs::IMAGE_DIGEST], asset_out[outputs::IMAGE_DIGEST]);

        let images = registry.list_images("bedrock-proxy-api-ecs").await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].tags, vec!["latest"]);
    }

    #[tokio::test]
    async fn test_missing_build_file_is_a_build_failure() {
        let (_dir, publisher, _) = setup();
        let asset = ImageAsset::new("asset", "src", "Dockerfile_missing");
        let err = publisher.build(&asset).await.unwrap_err();
        assert!(err.is_image_failure());
        assert!(matches!(err, ProvisionError::Build { .. }));
    }

    #[tokio::test]
    async fn test_publish_without_registry_fails() {
        let (_dir, publisher, _) = setup();
        let repo = RegistryRepository::new("repo", "never-created", 10);
        let asset = ImageAsset::new("asset", "src", "Dockerfile_cursor");
        let deployment = ImageDeployment::new("copy", &asset.id, &repo.id, "latest");
        let asset_out = publisher.build(&asset).await.unwrap();
        let mut repo_out = ResourceOutputs::new();
        repo_out.insert(outputs::REPOSITORY_NAME.into(), "never-created".into());
        repo_out.insert(outputs::REPOSITORY_URI.into(), "local/never-created".into());
        let err = publisher
            .publish(&deployment, &asset_out, &repo_out)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Publish { .. }));
    }

    #[tokio::test]
    async fn test_asset_digest_tracks_context() {
        let (dir, publisher, _) = setup();
        let asset = ImageAsset::new("asset", "src", "Dockerfile_cursor");
        let before = publisher.asset_digest(&asset).await.unwrap();
        fs::write(dir.path().join("src/app.py"), "print(1)\n").unwrap();
        assert_ne!(before, publisher.asset_digest(&asset).await.unwrap());
    }
}
