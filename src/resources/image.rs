use serde::{Deserialize, Serialize};
use std::fmt;

use super::{ResourceId, ResourceKind};

/// A container image built from a local context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAsset {
    pub id: ResourceId,
    /// Build context directory
    pub context_dir: String,
    /// Build file, relative to the context directory
    pub build_file: String,
    /// Path patterns left out of the build context
    pub excludes: Vec<String>,
    /// Target platform, e.g. `linux/amd64`
    pub platform: String,
}

impl ImageAsset {
    pub fn new(id: &str, context_dir: &str, build_file: &str) -> Self {
        Self {
            id: ResourceId::new(ResourceKind::ImageAsset, id),
            context_dir: context_dir.to_string(),
            build_file: build_file.to_string(),
            excludes: Vec::new(),
            platform: "linux/amd64".to_string(),
        }
    }
}

/// Copy of a built asset into the stack's repository under a stable tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDeployment {
    pub id: ResourceId,
    pub asset: ResourceId,
    pub registry: ResourceId,
    pub tag: String,
}

impl ImageDeployment {
    pub fn new(id: &str, asset: &ResourceId, registry: &ResourceId, tag: &str) -> Self {
        Self {
            id: ResourceId::new(ResourceKind::ImageDeployment, id),
            asset: asset.clone(),
            registry: registry.clone(),
            tag: tag.to_string(),
        }
    }

    /// The reference the workload uses once this copy has completed
    pub fn reference(&self, repository_name: &str) -> ImageReference {
        ImageReference {
            registry: self.registry.clone(),
            repository_name: repository_name.to_string(),
            tag: self.tag.clone(),
            produced_by: self.id.clone(),
        }
    }
}

/// Registry identity plus tag
///
/// A workload never owns the image it points at; `produced_by` names the
/// publish step that must complete before the reference can be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub registry: ResourceId,
    pub repository_name: String,
    pub tag: String,
    pub produced_by: ResourceId,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository_name, self.tag)
    }
}
