use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::image::ImageReference;
use super::{ResourceId, ResourceKind};
use crate::error::{ProvisionError, ProvisionResult};

/// Logical grouping that hosts scheduled workloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ResourceId,
    pub network: ResourceId,
    pub capacity_providers: Vec<String>,
}

impl Cluster {
    pub fn new(id: &str, network: &ResourceId) -> Self {
        Self {
            id: ResourceId::new(ResourceKind::Cluster, id),
            network: network.clone(),
            capacity_providers: vec!["FARGATE".to_string(), "FARGATE_SPOT".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CpuArchitecture {
    X86_64,
    Arm64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OsFamily {
    Linux,
}

/// Where the container's log driver sends output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfiguration {
    pub sink: ResourceId,
    pub stream_prefix: String,
}

/// The single container of the gateway workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub id: ResourceId,
    pub container_name: String,
    pub image: ImageReference,
    pub port: u16,
    /// Keys are unique by construction
    pub environment: BTreeMap<String, String>,
    pub log: LogConfiguration,
    pub essential: bool,
}

impl ContainerSpec {
    pub fn references(&self) -> Vec<ResourceId> {
        vec![
            self.image.produced_by.clone(),
            self.image.registry.clone(),
            self.log.sink.clone(),
        ]
    }

    pub fn validate(&self) -> ProvisionResult<()> {
        if self.port == 0 {
            return Err(self.invalid("container port must be non-zero"));
        }
        if let Some((key, _)) = self.environment.iter().find(|(_, v)| v.is_empty()) {
            return Err(self.invalid(&format!("environment variable {} has no value", key)));
        }
        Ok(())
    }

    fn invalid(&self, message: &str) -> ProvisionError {
        ProvisionError::Validation {
            resource: self.id.clone(),
            message: message.to_string(),
        }
    }
}

/// Immutable, versioned description of one running instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadDefinition {
    pub id: ResourceId,
    pub family: String,
    pub cpu: u32,
    pub memory_mib: u32,
    pub architecture: CpuArchitecture,
    pub os_family: OsFamily,
    pub execution_role: ResourceId,
    pub task_role: ResourceId,
    pub containers: Vec<ResourceId>,
}

impl WorkloadDefinition {
    pub fn references(&self) -> Vec<ResourceId> {
        let mut refs = vec![self.execution_role.clone(), self.task_role.clone()];
        refs.extend(self.containers.iter().cloned());
        refs
    }

    pub fn validate(&self) -> ProvisionResult<()> {
        if self.containers.len() != 1 {
            return Err(self.invalid(&format!(
                "exactly one container is required, found {}",
                self.containers.len()
            )));
        }
        if self.execution_role == self.task_role {
            return Err(self.invalid("execution role and task role must differ"));
        }
        validate_task_size(self.cpu, self.memory_mib).map_err(|e| self.invalid(&e))
    }

    fn invalid(&self, message: &str) -> ProvisionError {
        ProvisionError::Validation {
            resource: self.id.clone(),
            message: message.to_string(),
        }
    }
}

/// Serverless task sizes: each CPU tier allows a fixed memory range
pub fn validate_task_size(cpu: u32, memory_mib: u32) -> Result<(), String> {
    let allowed: Vec<u32> = match cpu {
        256 => vec![512, 1024, 2048],
        512 => (1..=4).map(|g| g * 1024).collect(),
        1024 => (2..=8).map(|g| g * 1024).collect(),
        2048 => (4..=16).map(|g| g * 1024).collect(),
        4096 => (8..=30).map(|g| g * 1024).collect(),
        8192 => (4..=15).map(|g| g * 4096).collect(),
        16384 => (4..=15).map(|g| g * 8192).collect(),
        _ => return Err(format!("unsupported CPU value {}", cpu)),
    };
    if allowed.contains(&memory_mib) {
        Ok(())
    } else {
        Err(format!(
            "memory {} MiB is not valid for {} CPU units",
            memory_mib, cpu
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(containers: usize) -> WorkloadDefinition {
        WorkloadDefinition {
            id: ResourceId::new(ResourceKind::WorkloadDefinition, "task"),
            family: "proxy".into(),
            cpu: 1024,
            memory_mib: 2048,
            architecture: CpuArchitecture::X86_64,
            os_family: OsFamily::Linux,
            execution_role: ResourceId::new(ResourceKind::Role, "exec"),
            task_role: ResourceId::new(ResourceKind::Role, "task"),
            containers: (0..containers)
                .map(|i| ResourceId::new(ResourceKind::ContainerSpec, format!("c{}", i)))
                .collect(),
        }
    }

    #[test]
    fn test_single_container_required() {
        assert!(workload(1).validate().is_ok());
        assert!(workload(0).validate().is_err());
        assert!(workload(2).validate().is_err());
    }

    #[test]
    fn test_shared_role_rejected() {
        let mut w = workload(1);
        w.task_role = w.execution_role.clone();
        assert!(w.validate().is_err());
    }

    #[test]
    fn test_task_sizes() {
        assert!(validate_task_size(1024, 2048).is_ok());
        assert!(validate_task_size(256, 512).is_ok());
        assert!(validate_task_size(1024, 1024).is_err());
        assert!(validate_task_size(300, 1024).is_err());
    }

    #[test]
    fn test_architecture_serialization() {
        assert_eq!(
            serde_json::to_string(&CpuArchitecture::X86_64).unwrap(),
            "\"X86_64\""
        );
        assert_eq!(serde_json::to_string(&OsFamily::Linux).unwrap(), "\"LINUX\"");
    }
}
