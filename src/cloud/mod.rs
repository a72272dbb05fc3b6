// Declarative cloud backend
//
// The provisioning engine and the service controller only talk to the cloud
// through `CloudBackend`. Resource operations are fire-and-poll: `create`,
// `update` and `delete` return an operation id right away and the caller polls
// it until the backend reports convergence.

pub mod simulated;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::ProvisionResult;
use crate::resources::{Resource, ResourceId, ResourceOutputs};

pub use simulated::SimulatedCloud;

/// Outputs of the resources a descriptor references, keyed by resource id
pub type ResolvedInputs = BTreeMap<ResourceId, ResourceOutputs>;

/// Result of polling an in-flight operation
#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    InProgress,
    Succeeded {
        physical_id: String,
        outputs: ResourceOutputs,
    },
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Provisioning,
    Running,
    Stopped,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Provisioning => write!(f, "PROVISIONING"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// A running (or stopped) copy of a workload definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescription {
    pub task_id: String,
    pub service: String,
    pub workload_arn: String,
    pub status: TaskStatus,
    pub private_ip: Option<String>,
    pub stop_reason: Option<String>,
}

/// Everything needed to place one task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub cluster_arn: String,
    pub service: String,
    pub workload_arn: String,
    pub subnet_ids: Vec<String>,
    pub assign_public_ip: bool,
    pub capacity_provider: String,
}

/// Load balancer view of a registered target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    /// Registered, not enough checks yet
    Initial,
    Healthy,
    Unhealthy,
    /// Deregistered, connections still draining
    Draining,
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetState::Initial => write!(f, "initial"),
            TargetState::Healthy => write!(f, "healthy"),
            TargetState::Unhealthy => write!(f, "unhealthy"),
            TargetState::Draining => write!(f, "draining"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHealthDescription {
    pub target: String,
    pub state: TargetState,
}

#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Start creating a resource
    async fn create(&self, resource: &Resource, inputs: &ResolvedInputs)
        -> ProvisionResult<String>;

    /// Start updating an existing resource in place
    async fn update(
        &self,
        resource: &Resource,
        physical_id: &str,
        inputs: &ResolvedInputs,
    ) -> ProvisionResult<String>;

    /// Start deleting a resource
    async fn delete(&self, id: &ResourceId, physical_id: &str) -> ProvisionResult<String>;

    /// Poll an operation started by `create`, `update` or `delete`
    async fn poll(&self, id: &ResourceId, operation: &str) -> ProvisionResult<OperationStatus>;

    async fn run_task(&self, request: &TaskRequest) -> anyhow::Result<TaskDescription>;

    /// Tasks started for a service, including recently stopped ones
    async fn list_tasks(&self, service: &str) -> anyhow::Result<Vec<TaskDescription>>;

    async fn stop_task(&self, task_id: &str, reason: &str) -> anyhow::Result<()>;

    async fn register_target(&self, target_group_arn: &str, target: &str) -> anyhow::Result<()>;

    async fn deregister_target(&self, target_group_arn: &str, target: &str)
        -> anyhow::Result<()>;

    async fn target_health(
        &self,
        target_group_arn: &str,
    ) -> anyhow::Result<Vec<TargetHealthDescription>>;
}

/// Time source shared by the controller and the backend it observes
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's epoch
    fn now(&self) -> Duration;
}

/// Wall-clock time since a fixed epoch, optionally sped up
#[derive(Debug, Clone)]
pub struct ScaledClock {
    epoch: DateTime<Utc>,
    scale: f64,
}

impl ScaledClock {
    pub fn new(epoch: DateTime<Utc>, scale: f64) -> Self {
        Self { epoch, scale }
    }
}

impl Clock for ScaledClock {
    fn now(&self) -> Duration {
        let elapsed = (Utc::now() - self.epoch).to_std().unwrap_or_default();
        elapsed.mul_f64(self.scale)
    }
}

/// Clock that only moves when told to
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ManualClock {
    now: std::sync::Mutex<Duration>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.lock().map(|now| *now).unwrap_or_default()
    }
}
