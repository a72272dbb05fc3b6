// Typed resource descriptors
//
// Every node of the gateway stack is a declarative descriptor: it has a stable
// identity, lists the resources whose outputs it consumes, and carries a removal
// policy. None of these types talk to a cloud API; the provisioning engine hands
// them to a `CloudBackend`.

pub mod compute;
pub mod iam;
pub mod image;
pub mod load_balancer;
pub mod log_sink;
pub mod network;
pub mod registry;
pub mod service;
pub mod wildcard;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub use compute::{Cluster, ContainerSpec, WorkloadDefinition};
pub use iam::Role;
pub use image::{ImageAsset, ImageDeployment};
pub use load_balancer::{Listener, LoadBalancer, TargetGroup};
pub use log_sink::LogSink;
pub use network::NetworkFabric;
pub use registry::RegistryRepository;
pub use service::ManagedService;

/// Kind of resource in the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Registry,
    ImageAsset,
    ImageDeployment,
    Network,
    Cluster,
    Role,
    LogSink,
    ContainerSpec,
    WorkloadDefinition,
    LoadBalancer,
    TargetGroup,
    Listener,
    Service,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Registry => "registry",
            ResourceKind::ImageAsset => "image-asset",
            ResourceKind::ImageDeployment => "image-deployment",
            ResourceKind::Network => "network",
            ResourceKind::Cluster => "cluster",
            ResourceKind::Role => "role",
            ResourceKind::LogSink => "log-sink",
            ResourceKind::ContainerSpec => "container-spec",
            ResourceKind::WorkloadDefinition => "workload-definition",
            ResourceKind::LoadBalancer => "load-balancer",
            ResourceKind::TargetGroup => "target-group",
            ResourceKind::Listener => "listener",
            ResourceKind::Service => "service",
        }
    }

    const ALL: [ResourceKind; 13] = [
        ResourceKind::Registry,
        ResourceKind::ImageAsset,
        ResourceKind::ImageDeployment,
        ResourceKind::Network,
        ResourceKind::Cluster,
        ResourceKind::Role,
        ResourceKind::LogSink,
        ResourceKind::ContainerSpec,
        ResourceKind::WorkloadDefinition,
        ResourceKind::LoadBalancer,
        ResourceKind::TargetGroup,
        ResourceKind::Listener,
        ResourceKind::Service,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a resource: `<kind>/<name>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    kind: ResourceKind,
    name: String,
}

impl ResourceId {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid resource id '{}': expected <kind>/<name>", s))?;
        let kind = ResourceKind::ALL
            .iter()
            .find(|k| k.as_str() == kind)
            .copied()
            .ok_or_else(|| format!("invalid resource id '{}': unknown kind '{}'", s, kind))?;
        if name.is_empty() {
            return Err(format!("invalid resource id '{}': empty name", s));
        }
        Ok(Self::new(kind, name))
    }
}

impl TryFrom<String> for ResourceId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

/// What happens to a resource when the stack is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RemovalPolicy {
    /// Delete together with the stack
    #[default]
    Destroy,
    /// Leave in place; it outlives the stack
    Retain,
}

/// Outputs a resource exposes once it exists (ARNs, DNS names, URIs, ...)
pub type ResourceOutputs = BTreeMap<String, String>;

/// A resource descriptor in the stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Resource {
    Registry(RegistryRepository),
    ImageAsset(ImageAsset),
    ImageDeployment(ImageDeployment),
    Network(NetworkFabric),
    Cluster(Cluster),
    Role(Role),
    LogSink(LogSink),
    ContainerSpec(ContainerSpec),
    WorkloadDefinition(WorkloadDefinition),
    LoadBalancer(LoadBalancer),
    TargetGroup(TargetGroup),
    Listener(Listener),
    Service(ManagedService),
}

impl Resource {
    pub fn id(&self) -> &ResourceId {
        match self {
            Resource::Registry(r) => &r.id,
            Resource::ImageAsset(r) => &r.id,
            Resource::ImageDeployment(r) => &r.id,
            Resource::Network(r) => &r.id,
            Resource::Cluster(r) => &r.id,
            Resource::Role(r) => &r.id,
            Resource::LogSink(r) => &r.id,
            Resource::ContainerSpec(r) => &r.id,
            Resource::WorkloadDefinition(r) => &r.id,
            Resource::LoadBalancer(r) => &r.id,
            Resource::TargetGroup(r) => &r.id,
            Resource::Listener(r) => &r.id,
            Resource::Service(r) => &r.id,
        }
    }

    /// Resources whose outputs this descriptor consumes.
    ///
    /// Every reference must also be an (explicit or transitive) dependency,
    /// otherwise the graph rejects the stack.
    pub fn references(&self) -> Vec<ResourceId> {
        match self {
            Resource::Registry(_) | Resource::ImageAsset(_) | Resource::Network(_) => vec![],
            Resource::Role(r) => r.references.clone(),
            Resource::LogSink(_) => vec![],
            Resource::ImageDeployment(r) => vec![r.asset.clone(), r.registry.clone()],
            Resource::Cluster(r) => vec![r.network.clone()],
            Resource::ContainerSpec(r) => r.references(),
            Resource::WorkloadDefinition(r) => r.references(),
            Resource::LoadBalancer(r) => vec![r.network.clone()],
            Resource::TargetGroup(r) => vec![r.network.clone()],
            Resource::Listener(r) => {
                vec![r.load_balancer.clone(), r.default_target_group.clone()]
            }
            Resource::Service(r) => r.references(),
        }
    }

    pub fn removal_policy(&self) -> RemovalPolicy {
        match self {
            Resource::Registry(r) => r.removal_policy,
            Resource::LogSink(r) => r.removal_policy,
            _ => RemovalPolicy::Destroy,
        }
    }

    /// Immutable resources are never updated in place; a change registers a
    /// new revision instead.
    pub fn is_versioned(&self) -> bool {
        matches!(self, Resource::WorkloadDefinition(_))
    }

    /// Stable content hash of the descriptor, used to detect drift between the
    /// desired stack and recorded state
    pub fn fingerprint(&self) -> String {
        // Serializing a plain data enum cannot fail; fall back to Debug output anyway
        let bytes = serde_json::to_vec(self).unwrap_or_else(|_| format!("{:?}", self).into_bytes());
        let digest = Sha256::digest(&bytes);
        format!("{:x}", digest)
    }
}
