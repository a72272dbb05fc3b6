use thiserror::Error;

use crate::resources::ResourceId;

/// Errors raised while validating or provisioning the resource graph.
///
/// Every variant that concerns a single resource carries its id so the
/// operator can tell which node of the graph stopped the run.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Image build failed for {resource}: {message}")]
    Build { resource: ResourceId, message: String },

    #[error("Image publish failed for {resource}: {message}")]
    Publish { resource: ResourceId, message: String },

    #[error("Invalid resource {resource}: {message}")]
    Validation { resource: ResourceId, message: String },

    #[error("Resource {0} is declared more than once")]
    DuplicateResource(ResourceId),

    #[error("Resource {resource} depends on unknown resource {dependency}")]
    UnknownDependency {
        resource: ResourceId,
        dependency: ResourceId,
    },

    #[error("Resource {resource} references {referenced} without being ordered after it")]
    UnorderedReference {
        resource: ResourceId,
        referenced: ResourceId,
    },

    #[error("Dependency cycle detected involving: {}", format_ids(.0))]
    CyclicDependency(Vec<ResourceId>),

    #[error("Quota exhausted while creating {resource}: {message}")]
    Quota { resource: ResourceId, message: String },

    #[error("Backend rejected {resource}: {message}")]
    Backend { resource: ResourceId, message: String },

    #[error("Timed out after {waited_secs}s waiting for {resource} to become ready")]
    Timeout {
        resource: ResourceId,
        waited_secs: u64,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ProvisionError {
    /// The resource this error is attributed to, if any
    pub fn resource(&self) -> Option<&ResourceId> {
        match self {
            ProvisionError::Build { resource, .. }
            | ProvisionError::Publish { resource, .. }
            | ProvisionError::Validation { resource, .. }
            | ProvisionError::UnknownDependency { resource, .. }
            | ProvisionError::UnorderedReference { resource, .. }
            | ProvisionError::Quota { resource, .. }
            | ProvisionError::Backend { resource, .. }
            | ProvisionError::Timeout { resource, .. } => Some(resource),
            ProvisionError::DuplicateResource(resource) => Some(resource),
            ProvisionError::CyclicDependency(_) | ProvisionError::Config(_) => None,
        }
    }

    /// Build and publish failures abort before anything references the image
    pub fn is_image_failure(&self) -> bool {
        matches!(
            self,
            ProvisionError::Build { .. } | ProvisionError::Publish { .. }
        )
    }
}

fn format_ids(ids: &[ResourceId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceKind;

    #[test]
    fn test_quota_error_names_resource() {
        let err = ProvisionError::Quota {
            resource: ResourceId::new(ResourceKind::Network, "vpc"),
            message: "only 1 availability zone available".to_string(),
        };
        assert_eq!(err.resource().map(|r| r.name()), Some("vpc"));
        assert!(err.to_string().contains("network/vpc"));
    }

    #[test]
    fn test_cycle_error_lists_members() {
        let err = ProvisionError::CyclicDependency(vec![
            ResourceId::new(ResourceKind::Cluster, "a"),
            ResourceId::new(ResourceKind::Cluster, "b"),
        ]);
        assert!(err.resource().is_none());
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected involving: cluster/a, cluster/b"
        );
    }

    #[test]
    fn test_image_failures() {
        let id = ResourceId::new(ResourceKind::ImageAsset, "asset");
        assert!(ProvisionError::Build {
            resource: id.clone(),
            message: "exit 1".into()
        }
        .is_image_failure());
        assert!(!ProvisionError::Backend {
            resource: id,
            message: "denied".into()
        }
        .is_image_failure());
    }
}
