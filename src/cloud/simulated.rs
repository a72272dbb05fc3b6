// Local simulated cloud
//
// Keeps an inventory of created resources, tasks and load balancer targets,
// optionally persisted as JSON so separate CLI invocations act on the same
// inventory. Health is derived from per-task scripts and the target group's
// health check settings, evaluated lazily against the shared clock.

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    Clock, CloudBackend, OperationStatus, ResolvedInputs, ScaledClock, TargetHealthDescription,
    TargetState, TaskDescription, TaskRequest, TaskStatus,
};
use crate::error::{ProvisionError, ProvisionResult};
use crate::resources::load_balancer::HealthCheck;
use crate::resources::network::Ipv4Cidr;
use crate::resources::{Resource, ResourceId, ResourceKind, ResourceOutputs};
use crate::stack::OUTPUT_DNS_NAME;

/// Stopped tasks are forgotten after this many seconds
const STOPPED_TASK_RETENTION_SECS: f64 = 3600.0;

/// Health check history evaluated per target
const MAX_EVALUATED_CHECKS: u64 = 2000;

const IMAGE_PULL_ACTION: &str = "ecr:BatchGetImage";

/// First host offset handed out inside a subnet
const FIRST_TASK_HOST: u64 = 10;

/// How a task answers health checks once it is running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthScript {
    Healthy,
    Unhealthy,
    /// Fails checks until it has been running for `secs`
    HealthyAfter { secs: f64 },
    /// Passes checks until it has been running for `secs`
    UnhealthyAfter { secs: f64 },
    /// Exits after running for `secs`
    CrashAfter { secs: f64 },
}

impl HealthScript {
    fn passes(&self, running_for: f64) -> bool {
        match self {
            HealthScript::Healthy | HealthScript::CrashAfter { .. } => true,
            HealthScript::Unhealthy => false,
            HealthScript::HealthyAfter { secs } => running_for >= *secs,
            HealthScript::UnhealthyAfter { secs } => running_for < *secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimResource {
    id: ResourceId,
    physical_id: String,
    outputs: ResourceOutputs,
    descriptor: serde_json::Value,
    /// Rendered trust and permission documents of a role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    policies: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum SimOutcome {
    Succeeded {
        physical_id: String,
        outputs: ResourceOutputs,
    },
    Failed {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimOperation {
    resource: ResourceId,
    ready_at: f64,
    outcome: SimOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimTargetGroup {
    health_check: HealthCheck,
    deregistration_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimTask {
    task_id: String,
    service: String,
    workload_arn: String,
    ip: String,
    started_at: f64,
    running_at: f64,
    stopped_at: Option<f64>,
    stop_reason: Option<String>,
    health: HealthScript,
}

impl SimTask {
    fn status(&self, now: f64) -> TaskStatus {
        match self.stopped_at {
            Some(stopped) if now >= stopped => TaskStatus::Stopped,
            _ if now >= self.running_at => TaskStatus::Running,
            _ => TaskStatus::Provisioning,
        }
    }

    fn passes_check(&self, at: f64) -> bool {
        self.status(at) == TaskStatus::Running && self.health.passes(at - self.running_at)
    }

    fn describe(&self, now: f64) -> TaskDescription {
        let status = self.status(now);
        TaskDescription {
            task_id: self.task_id.clone(),
            service: self.service.clone(),
            workload_arn: self.workload_arn.clone(),
            status,
            private_ip: Some(self.ip.clone()),
            stop_reason: if status == TaskStatus::Stopped {
                self.stop_reason.clone()
            } else {
                None
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimTarget {
    target_group_arn: String,
    target: String,
    registered_at: f64,
    deregistered_at: Option<f64>,
}

/// Repository ARN of a registry image reference such as
/// `<account>.dkr.ecr.<region>.amazonaws.com/<repo>:<tag>@<digest>`
fn repository_arn(image: &str) -> Option<String> {
    let (host, path) = image.split_once('/')?;
    let (account, rest) = host.split_once(".dkr.ecr.")?;
    let region = rest.strip_suffix(".amazonaws.com")?;
    let path = path.split('@').next().unwrap_or(path);
    let repository = path.rsplit_once(':').map(|(r, _)| r).unwrap_or(path);
    Some(format!(
        "arn:aws:ecr:{}:{}:repository/{}",
        region, account, repository
    ))
}

/// Evaluate every check the target group has run against a target up to `now`
fn evaluate_checks(
    health_check: &HealthCheck,
    registered_at: f64,
    task: Option<&SimTask>,
    now: f64,
) -> TargetState {
    let interval = health_check.interval_secs.max(1) as f64;
    let checks = ((now - registered_at) / interval).floor().max(0.0) as u64;
    let first = checks.saturating_sub(MAX_EVALUATED_CHECKS) + 1;

    let mut state = TargetState::Initial;
    let mut passes = 0u32;
    let mut fails = 0u32;
    for k in first..=checks {
        let at = registered_at + k as f64 * interval;
        if task.map(|t| t.passes_check(at)).unwrap_or(false) {
            passes += 1;
            fails = 0;
            if passes >= health_check.healthy_threshold {
                state = TargetState::Healthy;
            }
        } else {
            fails += 1;
            passes = 0;
            if fails >= health_check.unhealthy_threshold {
                state = TargetState::Unhealthy;
            }
        }
    }
    state
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Inventory {
    epoch: DateTime<Utc>,
    region: String,
    account_id: String,
    #[serde(default)]
    resources: BTreeMap<String, SimResource>,
    #[serde(default)]
    operations: BTreeMap<String, SimOperation>,
    /// Latest registered revision per workload family
    #[serde(default)]
    revisions: BTreeMap<String, u32>,
    #[serde(default)]
    target_groups: BTreeMap<String, SimTargetGroup>,
    #[serde(default)]
    subnets: BTreeMap<String, String>,
    #[serde(default)]
    tasks: BTreeMap<String, SimTask>,
    #[serde(default)]
    targets: Vec<SimTarget>,
    #[serde(default)]
    tasks_started: u64,

    // Fault injection and timing
    zones: Vec<String>,
    #[serde(default)]
    quotas: BTreeMap<ResourceKind, usize>,
    #[serde(default)]
    failures: BTreeMap<ResourceKind, String>,
    default_health: HealthScript,
    #[serde(default)]
    queued_health: VecDeque<HealthScript>,
    provisioning_secs: f64,
    task_startup_secs: f64,
}

impl Inventory {
    fn new(region: &str, account_id: &str) -> Self {
        Self {
            epoch: Utc::now(),
            region: region.to_string(),
            account_id: account_id.to_string(),
            resources: BTreeMap::new(),
            operations: BTreeMap::new(),
            revisions: BTreeMap::new(),
            target_groups: BTreeMap::new(),
            subnets: BTreeMap::new(),
            tasks: BTreeMap::new(),
            targets: Vec::new(),
            tasks_started: 0,
            zones: ["a", "b", "c"]
                .iter()
                .map(|suffix| format!("{}{}", region, suffix))
                .collect(),
            quotas: BTreeMap::new(),
            failures: BTreeMap::new(),
            default_health: HealthScript::Healthy,
            queued_health: VecDeque::new(),
            provisioning_secs: 0.0,
            task_startup_secs: 10.0,
        }
    }

    fn count(&self, kind: ResourceKind) -> usize {
        self.resources
            .values()
            .filter(|r| r.id.kind() == kind)
            .count()
    }

    fn prune(&mut self, now: f64) {
        self.tasks.retain(|_, task| match task.stopped_at {
            Some(stopped) => now - stopped < STOPPED_TASK_RETENTION_SECS,
            None => true,
        });
        let delays: BTreeMap<String, f64> = self
            .target_groups
            .iter()
            .map(|(arn, tg)| (arn.clone(), tg.deregistration_delay_secs as f64))
            .collect();
        self.targets.retain(|t| match t.deregistered_at {
            Some(at) => {
                let delay = delays.get(&t.target_group_arn).copied().unwrap_or(0.0);
                now < at + delay
            }
            None => true,
        });
    }

    /// Refuse a launch whose execution role may not pull the definition's images
    fn check_image_pull(&self, definition: &SimResource) -> anyhow::Result<()> {
        let Ok(Resource::WorkloadDefinition(workload)) =
            serde_json::from_value::<Resource>(definition.descriptor.clone())
        else {
            return Ok(());
        };
        let role = self
            .resources
            .values()
            .find(|r| r.id == workload.execution_role)
            .and_then(|r| match serde_json::from_value::<Resource>(r.descriptor.clone()) {
                Ok(Resource::Role(role)) => Some(role),
                _ => None,
            })
            .with_context(|| format!("Execution role {} does not exist", workload.execution_role))?;

        let images = definition.outputs.get("image").map(String::as_str).unwrap_or("");
        for image in images.split(',').filter(|i| !i.is_empty()) {
            let Some(repository_arn) = repository_arn(image) else {
                continue;
            };
            if !role.is_allowed(IMAGE_PULL_ACTION, &repository_arn) {
                bail!(
                    "CannotPullContainerError: {} is not authorized to perform {} on {}",
                    role.id,
                    IMAGE_PULL_ACTION,
                    repository_arn
                );
            }
        }
        Ok(())
    }

    /// Lowest free host address, rotating the starting subnet per launch.
    ///
    /// An address is held by any task that has not stopped and by any target
    /// still registered or draining.
    fn allocate_ip(&self, subnet_ids: &[String], now: f64) -> anyhow::Result<String> {
        if subnet_ids.is_empty() {
            bail!("task request names no subnets");
        }
        let held: BTreeSet<&str> = self
            .tasks
            .values()
            .filter(|t| t.status(now) != TaskStatus::Stopped)
            .map(|t| t.ip.as_str())
            .chain(self.targets.iter().map(|t| t.target.as_str()))
            .collect();

        let mut subnets = Vec::with_capacity(subnet_ids.len());
        for subnet_id in subnet_ids {
            let cidr: Ipv4Cidr = self
                .subnets
                .get(subnet_id)
                .with_context(|| format!("Unknown subnet {}", subnet_id))?
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            subnets.push(cidr);
        }
        let start = (self.tasks_started % subnets.len() as u64) as usize;
        subnets.rotate_left(start);

        let mut offset = FIRST_TASK_HOST;
        loop {
            let mut in_range = false;
            for cidr in &subnets {
                let Some(ip) = cidr.host(offset) else {
                    continue;
                };
                in_range = true;
                let ip = ip.to_string();
                if !held.contains(ip.as_str()) {
                    return Ok(ip);
                }
            }
            if !in_range {
                bail!("Subnets {} have no free addresses", subnet_ids.join(", "));
            }
            offset += 1;
        }
    }
}

fn short_hex(len: usize) -> String {
    uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(len)
        .collect()
}

fn input<'a>(
    inputs: &'a ResolvedInputs,
    owner: &ResourceId,
    dependency: &ResourceId,
    key: &str,
) -> ProvisionResult<&'a str> {
    inputs
        .get(dependency)
        .and_then(|outputs| outputs.get(key))
        .map(|v| v.as_str())
        .ok_or_else(|| ProvisionError::Backend {
            resource: owner.clone(),
            message: format!("missing input {} from {}", key, dependency),
        })
}

/// In-process cloud used by the CLI and as a test fixture
pub struct SimulatedCloud {
    inventory: Mutex<Inventory>,
    clock: Arc<dyn Clock>,
    path: Option<PathBuf>,
}

impl SimulatedCloud {
    /// In-memory cloud driven by `clock`
    pub fn new(region: &str, account_id: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            inventory: Mutex::new(Inventory::new(region, account_id)),
            clock,
            path: None,
        }
    }

    /// Open (or start) a persisted inventory; time runs `time_scale` times
    /// faster than wall-clock time since the inventory was first created
    pub fn open(
        path: &Path,
        region: &str,
        account_id: &str,
        time_scale: f64,
    ) -> anyhow::Result<Self> {
        let inventory = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read cloud inventory {}", path.display()))?;
            let inventory: Inventory = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse cloud inventory {}", path.display()))?;
            if inventory.region != region || inventory.account_id != account_id {
                warn!(
                    "Cloud inventory {} belongs to {}/{}, not {}/{}",
                    path.display(),
                    inventory.account_id,
                    inventory.region,
                    account_id,
                    region
                );
            }
            inventory
        } else {
            debug!("Starting new cloud inventory at {}", path.display());
            let mut inventory = Inventory::new(region, account_id);
            inventory.provisioning_secs = 2.0;
            inventory
        };

        let clock = Arc::new(ScaledClock::new(inventory.epoch, time_scale));
        Ok(Self {
            inventory: Mutex::new(inventory),
            clock,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    fn now(&self) -> f64 {
        self.clock.now().as_secs_f64()
    }

    fn save(&self, inventory: &Inventory) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(inventory)
            .context("Failed to serialize cloud inventory")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write cloud inventory {}", path.display()))
    }

    fn save_for(&self, inventory: &Inventory, id: &ResourceId) -> ProvisionResult<()> {
        self.save(inventory).map_err(|e| ProvisionError::Backend {
            resource: id.clone(),
            message: format!("{:#}", e),
        })
    }

    fn materialize(
        inventory: &mut Inventory,
        resource: &Resource,
        inputs: &ResolvedInputs,
        existing: Option<&SimResource>,
    ) -> ProvisionResult<(String, ResourceOutputs)> {
        let id = resource.id();
        let region = inventory.region.clone();
        let account = inventory.account_id.clone();
        let keep = |key: &str, fresh: String| -> String {
            existing
                .and_then(|e| e.outputs.get(key).cloned())
                .unwrap_or(fresh)
        };
        let mut outputs = ResourceOutputs::new();

        let physical_id = match resource {
            Resource::Network(fabric) => {
                if existing.is_some() {
                    return Err(ProvisionError::Backend {
                        resource: id.clone(),
                        message: "network fabric cannot be changed in place; destroy the stack first"
                            .to_string(),
                    });
                }
                let subnets = fabric.allocate_subnets(&inventory.zones)?;
                let vpc_id = format!("vpc-{}", short_hex(17));
                let mut subnet_ids = Vec::new();
                for subnet in &subnets {
                    let subnet_id = format!("subnet-{}", short_hex(17));
                    inventory
                        .subnets
                        .insert(subnet_id.clone(), subnet.cidr.to_string());
                    subnet_ids.push(subnet_id);
                }
                outputs.insert("vpc_id".into(), vpc_id.clone());
                outputs.insert("cidr".into(), fabric.cidr.to_string());
                outputs.insert("subnet_ids".into(), subnet_ids.join(","));
                outputs.insert(
                    "subnet_cidrs".into(),
                    subnets
                        .iter()
                        .map(|s| s.cidr.to_string())
                        .collect::<Vec<_>>()
                        .join(","),
                );
                outputs.insert(
                    "zones".into(),
                    subnets
                        .iter()
                        .map(|s| s.zone.clone())
                        .collect::<Vec<_>>()
                        .join(","),
                );
                vpc_id
            }
            Resource::Cluster(cluster) => {
                input(inputs, id, &cluster.network, "vpc_id")?;
                let name = id.name().to_string();
                outputs.insert(
                    "arn".into(),
                    format!("arn:aws:ecs:{}:{}:cluster/{}", region, account, name),
                );
                outputs.insert("cluster_name".into(), name.clone());
                outputs.insert(
                    "capacity_providers".into(),
                    cluster.capacity_providers.join(","),
                );
                name
            }
            Resource::Role(_) => {
                let name = id.name().to_string();
                outputs.insert(
                    "arn".into(),
                    format!("arn:aws:iam::{}:role/{}", account, name),
                );
                outputs.insert("role_name".into(), name.clone());
                name
            }
            Resource::LogSink(sink) => {
                outputs.insert("arn".into(), sink.arn(&region, &account));
                outputs.insert("log_group_name".into(), sink.log_group_name.clone());
                sink.log_group_name.clone()
            }
            Resource::WorkloadDefinition(workload) => {
                for role in [&workload.execution_role, &workload.task_role] {
                    input(inputs, id, role, "arn")?;
                }
                let mut images = Vec::new();
                for container in &workload.containers {
                    images.push(input(inputs, id, container, "image")?.to_string());
                }
                // Registering always yields a new immutable revision
                let revision = inventory
                    .revisions
                    .entry(workload.family.clone())
                    .and_modify(|r| *r += 1)
                    .or_insert(1);
                let physical = format!("{}:{}", workload.family, revision);
                outputs.insert(
                    "arn".into(),
                    format!(
                        "arn:aws:ecs:{}:{}:task-definition/{}",
                        region, account, physical
                    ),
                );
                outputs.insert("family".into(), workload.family.clone());
                outputs.insert("revision".into(), revision.to_string());
                outputs.insert("image".into(), images.join(","));
                physical
            }
            Resource::LoadBalancer(lb) => {
                input(inputs, id, &lb.network, "subnet_ids")?;
                let suffix = short_hex(16);
                let arn = keep(
                    "arn",
                    format!(
                        "arn:aws:elasticloadbalancing:{}:{}:loadbalancer/app/{}/{}",
                        region, account, lb.name, suffix
                    ),
                );
                let dns = keep(
                    OUTPUT_DNS_NAME,
                    format!(
                        "{}-{}.{}.elb.amazonaws.com",
                        lb.name,
                        uuid::Uuid::new_v4().as_u128() % 10_000_000_000,
                        region
                    ),
                );
                outputs.insert("arn".into(), arn.clone());
                outputs.insert(OUTPUT_DNS_NAME.into(), dns);
                outputs.insert(
                    "scheme".into(),
                    if lb.internet_facing {
                        "internet-facing".into()
                    } else {
                        "internal".into()
                    },
                );
                arn
            }
            Resource::TargetGroup(tg) => {
                input(inputs, id, &tg.network, "vpc_id")?;
                let arn = keep(
                    "arn",
                    format!(
                        "arn:aws:elasticloadbalancing:{}:{}:targetgroup/{}/{}",
                        region,
                        account,
                        id.name(),
                        short_hex(16)
                    ),
                );
                inventory.target_groups.insert(
                    arn.clone(),
                    SimTargetGroup {
                        health_check: tg.health_check.clone(),
                        deregistration_delay_secs: tg.deregistration_delay_secs,
                    },
                );
                outputs.insert("arn".into(), arn.clone());
                outputs.insert("port".into(), tg.port.to_string());
                outputs.insert("health_check_path".into(), tg.health_check.path.clone());
                arn
            }
            Resource::Listener(listener) => {
                let lb_arn = input(inputs, id, &listener.load_balancer, "arn")?;
                let tg_arn = input(inputs, id, &listener.default_target_group, "arn")?;
                let arn = keep(
                    "arn",
                    format!(
                        "{}/{}",
                        lb_arn.replace(":loadbalancer/", ":listener/"),
                        short_hex(16)
                    ),
                );
                outputs.insert("arn".into(), arn.clone());
                outputs.insert("port".into(), listener.port.to_string());
                outputs.insert("protocol".into(), listener.protocol.to_string());
                outputs.insert("target_group_arn".into(), tg_arn.to_string());
                arn
            }
            Resource::Service(service) => {
                let cluster = input(inputs, id, &service.cluster, "cluster_name")?.to_string();
                let workload_arn =
                    input(inputs, id, &service.workload_definition, "arn")?.to_string();
                input(inputs, id, &service.load_balancer.listener, "arn")?;
                input(inputs, id, &service.load_balancer.target_group, "arn")?;
                let arn = format!(
                    "arn:aws:ecs:{}:{}:service/{}/{}",
                    region, account, cluster, service.name
                );
                outputs.insert("arn".into(), arn.clone());
                outputs.insert("service_name".into(), service.name.clone());
                outputs.insert("task_definition".into(), workload_arn);
                outputs.insert("desired_count".into(), service.desired_count.to_string());
                arn
            }
            Resource::Registry(_)
            | Resource::ImageAsset(_)
            | Resource::ImageDeployment(_)
            | Resource::ContainerSpec(_) => {
                return Err(ProvisionError::Backend {
                    resource: id.clone(),
                    message: "resource kind is not managed by the cloud backend".to_string(),
                });
            }
        };

        Ok((physical_id, outputs))
    }

    fn start_operation(
        &self,
        inventory: &mut Inventory,
        resource: &Resource,
        inputs: &ResolvedInputs,
        existing: Option<SimResource>,
    ) -> ProvisionResult<String> {
        let id = resource.id().clone();
        let ready_at = self.now() + inventory.provisioning_secs;
        let operation_id = format!("op-{}", short_hex(12));

        let outcome = if let Some(message) = inventory.failures.get(&id.kind()) {
            SimOutcome::Failed {
                message: message.clone(),
            }
        } else {
            let (physical_id, outputs) =
                Self::materialize(inventory, resource, inputs, existing.as_ref())?;
            let descriptor = serde_json::to_value(resource).unwrap_or(serde_json::Value::Null);
            let policies = match resource {
                Resource::Role(role) => Some(serde_json::json!({
                    "AssumeRolePolicyDocument": role.trust_policy(),
                    "PolicyDocument": role.policy_document(),
                })),
                _ => None,
            };
            if let Some(previous) = &existing {
                if previous.physical_id != physical_id {
                    inventory.resources.remove(&previous.physical_id);
                }
            }
            inventory.resources.insert(
                physical_id.clone(),
                SimResource {
                    id: id.clone(),
                    physical_id: physical_id.clone(),
                    outputs: outputs.clone(),
                    descriptor,
                    policies,
                },
            );
            SimOutcome::Succeeded {
                physical_id,
                outputs,
            }
        };

        inventory.operations.insert(
            operation_id.clone(),
            SimOperation {
                resource: id.clone(),
                ready_at,
                outcome,
            },
        );
        self.save_for(inventory, &id)?;
        Ok(operation_id)
    }
}

// Fault injection and inspection for tests
#[cfg(test)]
impl SimulatedCloud {
    /// Limit the availability zones the region offers
    pub async fn set_zones(&self, zones: Vec<String>) {
        self.inventory.lock().await.zones = zones;
    }

    /// Cap how many resources of a kind may exist
    pub async fn set_quota(&self, kind: ResourceKind, max: usize) {
        self.inventory.lock().await.quotas.insert(kind, max);
    }

    /// Make every create/update of a kind fail asynchronously
    pub async fn fail_kind(&self, kind: ResourceKind, message: &str) {
        self.inventory
            .lock()
            .await
            .failures
            .insert(kind, message.to_string());
    }

    pub async fn set_default_health(&self, script: HealthScript) {
        self.inventory.lock().await.default_health = script;
    }

    /// Health scripts for the next started tasks, in start order
    pub async fn queue_health(&self, script: HealthScript) {
        self.inventory.lock().await.queued_health.push_back(script);
    }

    /// Change how a running task answers health checks from now on
    pub async fn script_task_health(&self, task_id: &str, script: HealthScript) -> anyhow::Result<()> {
        let mut inventory = self.inventory.lock().await;
        let task = inventory
            .tasks
            .get_mut(task_id)
            .with_context(|| format!("Unknown task {}", task_id))?;
        task.health = script;
        self.save(&inventory)
    }

    pub async fn set_timing(&self, provisioning_secs: f64, task_startup_secs: f64) {
        let mut inventory = self.inventory.lock().await;
        inventory.provisioning_secs = provisioning_secs;
        inventory.task_startup_secs = task_startup_secs;
    }

    pub async fn resource_count(&self, kind: ResourceKind) -> usize {
        self.inventory.lock().await.count(kind)
    }

    /// Outputs recorded for a physical resource
    pub async fn outputs(&self, physical_id: &str) -> Option<ResourceOutputs> {
        self.inventory
            .lock()
            .await
            .resources
            .get(physical_id)
            .map(|r| r.outputs.clone())
    }
}

#[async_trait]
impl CloudBackend for SimulatedCloud {
    async fn create(
        &self,
        resource: &Resource,
        inputs: &ResolvedInputs,
    ) -> ProvisionResult<String> {
        let id = resource.id();
        let mut inventory = self.inventory.lock().await;

        if let Some(max) = inventory.quotas.get(&id.kind()).copied() {
            if inventory.count(id.kind()) >= max {
                return Err(ProvisionError::Quota {
                    resource: id.clone(),
                    message: format!("account limit of {} {} resources reached", max, id.kind()),
                });
            }
        }

        debug!(resource = %id, "Creating resource");
        self.start_operation(&mut inventory, resource, inputs, None)
    }

    async fn update(
        &self,
        resource: &Resource,
        physical_id: &str,
        inputs: &ResolvedInputs,
    ) -> ProvisionResult<String> {
        let id = resource.id();
        let mut inventory = self.inventory.lock().await;
        let existing = inventory.resources.get(physical_id).cloned().ok_or_else(|| {
            ProvisionError::Backend {
                resource: id.clone(),
                message: format!("{} does not exist", physical_id),
            }
        })?;

        debug!(resource = %id, physical_id, "Updating resource");
        self.start_operation(&mut inventory, resource, inputs, Some(existing))
    }

    async fn delete(&self, id: &ResourceId, physical_id: &str) -> ProvisionResult<String> {
        let now = self.now();
        let mut inventory = self.inventory.lock().await;

        match inventory.resources.remove(physical_id) {
            Some(removed) => {
                debug!(resource = %id, physical_id, "Deleting resource");
                match id.kind() {
                    ResourceKind::Service => {
                        let name = removed
                            .outputs
                            .get("service_name")
                            .cloned()
                            .unwrap_or_default();
                        let mut ips = Vec::new();
                        for task in inventory.tasks.values_mut() {
                            if task.service == name && task.status(now) != TaskStatus::Stopped {
                                task.stopped_at = Some(now);
                                task.stop_reason = Some("Service deleted".to_string());
                                ips.push(task.ip.clone());
                            }
                        }
                        for target in inventory.targets.iter_mut() {
                            if ips.contains(&target.target) && target.deregistered_at.is_none() {
                                target.deregistered_at = Some(now);
                            }
                        }
                    }
                    ResourceKind::TargetGroup => {
                        inventory.target_groups.remove(physical_id);
                        inventory
                            .targets
                            .retain(|t| t.target_group_arn != physical_id);
                    }
                    ResourceKind::Network => {
                        let subnet_ids = removed
                            .outputs
                            .get("subnet_ids")
                            .cloned()
                            .unwrap_or_default();
                        for subnet_id in subnet_ids.split(',') {
                            inventory.subnets.remove(subnet_id);
                        }
                    }
                    _ => {}
                }
            }
            None => debug!(resource = %id, physical_id, "Resource already gone"),
        }

        let operation_id = format!("op-{}", short_hex(12));
        let ready_at = now + inventory.provisioning_secs;
        inventory.operations.insert(
            operation_id.clone(),
            SimOperation {
                resource: id.clone(),
                ready_at,
                outcome: SimOutcome::Succeeded {
                    physical_id: physical_id.to_string(),
                    outputs: ResourceOutputs::new(),
                },
            },
        );
        self.save_for(&inventory, id)?;
        Ok(operation_id)
    }

    async fn poll(&self, id: &ResourceId, operation: &str) -> ProvisionResult<OperationStatus> {
        let now = self.now();
        let mut inventory = self.inventory.lock().await;
        let ready_at = inventory
            .operations
            .get(operation)
            .map(|op| op.ready_at)
            .ok_or_else(|| ProvisionError::Backend {
                resource: id.clone(),
                message: format!("unknown operation {}", operation),
            })?;
        if now < ready_at {
            return Ok(OperationStatus::InProgress);
        }

        let finished = inventory.operations.remove(operation);
        self.save_for(&inventory, id)?;
        Ok(match finished.map(|op| op.outcome) {
            Some(SimOutcome::Succeeded {
                physical_id,
                outputs,
            }) => OperationStatus::Succeeded {
                physical_id,
                outputs,
            },
            Some(SimOutcome::Failed { message }) => OperationStatus::Failed(message),
            None => OperationStatus::InProgress,
        })
    }

    async fn run_task(&self, request: &TaskRequest) -> anyhow::Result<TaskDescription> {
        let now = self.now();
        let mut inventory = self.inventory.lock().await;
        inventory.prune(now);

        let definition = inventory.resources.values().find(|r| {
            r.id.kind() == ResourceKind::WorkloadDefinition
                && r.outputs.get("arn") == Some(&request.workload_arn)
        });
        let Some(definition) = definition else {
            bail!("Workload definition {} is not registered", request.workload_arn);
        };
        inventory.check_image_pull(definition)?;

        let ip = inventory.allocate_ip(&request.subnet_ids, now)?;
        inventory.tasks_started += 1;
        let queued = inventory.queued_health.pop_front();
        let health = queued.unwrap_or_else(|| inventory.default_health.clone());
        let running_at = now + inventory.task_startup_secs;
        let stopped_at = match &health {
            HealthScript::CrashAfter { secs } => Some(running_at + secs),
            _ => None,
        };
        let task = SimTask {
            task_id: short_hex(32),
            service: request.service.clone(),
            workload_arn: request.workload_arn.clone(),
            ip,
            started_at: now,
            running_at,
            stopped_at,
            stop_reason: stopped_at.map(|_| "Essential container in task exited".to_string()),
            health,
        };
        info!(
            task_id = %task.task_id,
            ip = %task.ip,
            capacity_provider = %request.capacity_provider,
            "Started task"
        );
        let description = task.describe(now);
        inventory.tasks.insert(task.task_id.clone(), task);
        self.save(&inventory)?;
        Ok(description)
    }

    async fn list_tasks(&self, service: &str) -> anyhow::Result<Vec<TaskDescription>> {
        let now = self.now();
        let inventory = self.inventory.lock().await;
        let mut tasks: Vec<&SimTask> = inventory
            .tasks
            .values()
            .filter(|t| t.service == service)
            .collect();
        tasks.sort_by(|a, b| {
            a.started_at
                .partial_cmp(&b.started_at)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(tasks.into_iter().map(|t| t.describe(now)).collect())
    }

    async fn stop_task(&self, task_id: &str, reason: &str) -> anyhow::Result<()> {
        let now = self.now();
        let mut inventory = self.inventory.lock().await;
        let task = inventory
            .tasks
            .get_mut(task_id)
            .with_context(|| format!("Unknown task {}", task_id))?;
        if task.status(now) != TaskStatus::Stopped {
            task.stopped_at = Some(now);
            task.stop_reason = Some(reason.to_string());
        }
        self.save(&inventory)
    }

    async fn register_target(&self, target_group_arn: &str, target: &str) -> anyhow::Result<()> {
        let now = self.now();
        let mut inventory = self.inventory.lock().await;
        if !inventory.target_groups.contains_key(target_group_arn) {
            bail!("Target group {} does not exist", target_group_arn);
        }
        let registered = inventory.targets.iter().any(|t| {
            t.target_group_arn == target_group_arn
                && t.target == target
                && t.deregistered_at.is_none()
        });
        if !registered {
            inventory.targets.push(SimTarget {
                target_group_arn: target_group_arn.to_string(),
                target: target.to_string(),
                registered_at: now,
                deregistered_at: None,
            });
        }
        self.save(&inventory)
    }

    async fn deregister_target(
        &self,
        target_group_arn: &str,
        target: &str,
    ) -> anyhow::Result<()> {
        let now = self.now();
        let mut inventory = self.inventory.lock().await;
        for t in inventory.targets.iter_mut() {
            if t.target_group_arn == target_group_arn
                && t.target == target
                && t.deregistered_at.is_none()
            {
                t.deregistered_at = Some(now);
            }
        }
        self.save(&inventory)
    }

    async fn target_health(
        &self,
        target_group_arn: &str,
    ) -> anyhow::Result<Vec<TargetHealthDescription>> {
        let now = self.now();
        let inventory = self.inventory.lock().await;
        let tg = inventory
            .target_groups
            .get(target_group_arn)
            .with_context(|| format!("Target group {} does not exist", target_group_arn))?;

        let mut health = Vec::new();
        for target in inventory
            .targets
            .iter()
            .filter(|t| t.target_group_arn == target_group_arn)
        {
            let state = match target.deregistered_at {
                Some(at) if now < at + tg.deregistration_delay_secs as f64 => TargetState::Draining,
                Some(_) => continue,
                None => {
                    let task = inventory
                        .tasks
                        .values()
                        .filter(|t| t.ip == target.target)
                        .max_by(|a, b| {
                            a.started_at
                                .partial_cmp(&b.started_at)
                                .unwrap_or(std::cmp::Ordering::Equal)
                        });
                    evaluate_checks(&tg.health_check, target.registered_at, task, now)
                }
            };
            health.push(TargetHealthDescription {
                target: target.target.clone(),
                state,
            });
        }
        Ok(health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::ManualClock;
    use crate::resources::compute::{CpuArchitecture, OsFamily, WorkloadDefinition};
    use crate::resources::iam::{self, ExecutionGrants, TaskGrants};
    use crate::resources::{LogSink, NetworkFabric};
    use std::time::Duration;
    use tempfile::TempDir;

    fn health_check() -> HealthCheck {
        HealthCheck {
            path: "/health".into(),
            interval_secs: 30,
            timeout_secs: 5,
            healthy_threshold: 5,
            unhealthy_threshold: 2,
            success_codes: "200".into(),
        }
    }

    fn task(health: HealthScript) -> SimTask {
        SimTask {
            task_id: "t".into(),
            service: "svc".into(),
            workload_arn: "arn".into(),
            ip: "10.250.0.10".into(),
            started_at: 0.0,
            running_at: 10.0,
            stopped_at: None,
            stop_reason: None,
            health,
        }
    }

    #[test]
    fn test_target_becomes_healthy_after_threshold() {
        let hc = health_check();
        let t = task(HealthScript::Healthy);
        assert_eq!(evaluate_checks(&hc, 10.0, Some(&t), 100.0), TargetState::Initial);
        // Fifth passing check lands at 10 + 5 * 30
        assert_eq!(evaluate_checks(&hc, 10.0, Some(&t), 160.0), TargetState::Healthy);
    }

    #[test]
    fn test_target_turns_unhealthy_after_consecutive_failures() {
        let hc = health_check();
        let t = task(HealthScript::UnhealthyAfter { secs: 200.0 });
        assert_eq!(evaluate_checks(&hc, 10.0, Some(&t), 200.0), TargetState::Healthy);
        assert_eq!(evaluate_checks(&hc, 10.0, Some(&t), 280.0), TargetState::Unhealthy);
    }

    #[test]
    fn test_missing_task_fails_checks() {
        let hc = health_check();
        assert_eq!(evaluate_checks(&hc, 0.0, None, 60.0), TargetState::Unhealthy);
    }

    fn small_inventory() -> Inventory {
        let mut inventory = Inventory::new("us-east-1", "123456789012");
        // 16 addresses, hosts 10..16 usable for tasks
        inventory
            .subnets
            .insert("subnet-a".into(), "10.250.0.0/28".into());
        inventory
    }

    fn launch(inventory: &mut Inventory, subnets: &[String], now: f64) -> anyhow::Result<String> {
        let ip = inventory.allocate_ip(subnets, now)?;
        let mut t = task(HealthScript::Healthy);
        t.task_id = format!("t{}", inventory.tasks_started);
        t.ip = ip.clone();
        inventory.tasks.insert(t.task_id.clone(), t);
        inventory.tasks_started += 1;
        Ok(ip)
    }

    #[test]
    fn test_stopped_tasks_release_addresses() {
        let mut inventory = small_inventory();
        let subnets = vec!["subnet-a".to_string()];
        for n in 0..100 {
            let now = n as f64;
            let ip = launch(&mut inventory, &subnets, now).unwrap();
            assert_eq!(ip, "10.250.0.10");
            for t in inventory.tasks.values_mut() {
                t.stopped_at.get_or_insert(now);
            }
        }
    }

    #[test]
    fn test_running_tasks_and_draining_targets_hold_addresses() {
        let mut inventory = small_inventory();
        let subnets = vec!["subnet-a".to_string()];
        let first = launch(&mut inventory, &subnets, 0.0).unwrap();
        inventory.targets.push(SimTarget {
            target_group_arn: "tg".into(),
            target: "10.250.0.11".into(),
            registered_at: 0.0,
            deregistered_at: Some(1.0),
        });
        let second = launch(&mut inventory, &subnets, 2.0).unwrap();
        assert_eq!(first, "10.250.0.10");
        assert_eq!(second, "10.250.0.12");
    }

    #[test]
    fn test_exhausted_subnet_is_reported() {
        let mut inventory = small_inventory();
        let subnets = vec!["subnet-a".to_string()];
        for _ in 0..6 {
            launch(&mut inventory, &subnets, 0.0).unwrap();
        }
        let err = launch(&mut inventory, &subnets, 0.0).unwrap_err();
        assert!(err.to_string().contains("no free addresses"));
    }

    fn record(inventory: &mut Inventory, resource: Resource, outputs: &[(&str, &str)]) {
        let id = resource.id().clone();
        inventory.resources.insert(
            id.to_string(),
            SimResource {
                id,
                physical_id: String::new(),
                outputs: outputs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                descriptor: serde_json::to_value(&resource).unwrap(),
                policies: None,
            },
        );
    }

    fn pull_fixture(granted_repository: &str) -> (Inventory, SimResource) {
        let mut inventory = Inventory::new("us-east-1", "123456789012");
        let exec = iam::execution_role(
            "exec",
            ExecutionGrants {
                repository_arn: format!(
                    "arn:aws:ecr:us-east-1:123456789012:repository/{}",
                    granted_repository
                ),
                log_streams_arn: "arn:aws:logs:us-east-1:123456789012:log-group:logs:*".into(),
                references: &[],
            },
        );
        let workload = WorkloadDefinition {
            id: ResourceId::new(ResourceKind::WorkloadDefinition, "task"),
            family: "gateway".into(),
            cpu: 512,
            memory_mib: 1024,
            architecture: CpuArchitecture::Arm64,
            os_family: OsFamily::Linux,
            execution_role: exec.id.clone(),
            task_role: ResourceId::new(ResourceKind::Role, "task-role"),
            containers: vec![],
        };
        let image = "123456789012.dkr.ecr.us-east-1.amazonaws.com/gateway-images:latest@sha256:abc";
        record(&mut inventory, Resource::Role(exec), &[]);
        record(
            &mut inventory,
            Resource::WorkloadDefinition(workload),
            &[("image", image)],
        );
        let definition = inventory
            .resources
            .values()
            .find(|r| r.id.kind() == ResourceKind::WorkloadDefinition)
            .cloned()
            .unwrap();
        (inventory, definition)
    }

    #[test]
    fn test_execution_role_must_allow_image_pull() {
        let (inventory, definition) = pull_fixture("gateway-images");
        inventory.check_image_pull(&definition).unwrap();

        let (inventory, definition) = pull_fixture("other-images");
        let err = inventory.check_image_pull(&definition).unwrap_err();
        assert!(err.to_string().contains("CannotPullContainerError"));
        assert!(err.to_string().contains("repository/gateway-images"));
    }

    #[test]
    fn test_repository_arn_from_image_reference() {
        assert_eq!(
            repository_arn("123456789012.dkr.ecr.eu-west-1.amazonaws.com/team/api:v2@sha256:ff")
                .as_deref(),
            Some("arn:aws:ecr:eu-west-1:123456789012:repository/team/api")
        );
        assert_eq!(repository_arn("docker.io/library/nginx:latest"), None);
    }

    #[tokio::test]
    async fn test_role_create_records_policy_documents() {
        let cloud = SimulatedCloud::new("us-east-1", "123456789012", Arc::new(ManualClock::new()));
        let role = iam::task_role(
            "task-role",
            TaskGrants {
                parameter_arn: "arn:aws:ssm:us-east-1:123456789012:parameter/gateway/key".into(),
            },
        );
        cloud
            .create(&Resource::Role(role), &ResolvedInputs::new())
            .await
            .unwrap();
        let inventory = cloud.inventory.lock().await;
        let recorded = inventory.resources.values().next().unwrap();
        let policies = recorded.policies.as_ref().unwrap();
        assert_eq!(
            policies["AssumeRolePolicyDocument"]["Statement"][0]["Principal"]["Service"],
            "ecs-tasks.amazonaws.com"
        );
        assert_eq!(
            policies["PolicyDocument"]["Statement"][1]["Resource"][0],
            "arn:aws:ssm:us-east-1:123456789012:parameter/gateway/key"
        );
    }

    #[tokio::test]
    async fn test_network_quota_surfaces_failing_resource() {
        let cloud = SimulatedCloud::new("us-east-1", "123456789012", Arc::new(ManualClock::new()));
        cloud.set_zones(vec![]).await;
        let network = Resource::Network(NetworkFabric::public(
            "vpc",
            "10.250.0.0/16".parse().unwrap(),
            2,
            24,
        ));
        match cloud.create(&network, &ResolvedInputs::new()).await {
            Err(ProvisionError::Quota { resource, .. }) => assert_eq!(resource.name(), "vpc"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_operations_complete_after_provisioning_delay() {
        let clock = Arc::new(ManualClock::new());
        let cloud = SimulatedCloud::new("us-east-1", "123456789012", clock.clone());
        cloud.set_timing(5.0, 0.0).await;
        let sink = Resource::LogSink(LogSink::new("logs", "cursor-gateway-logs"));
        let op = cloud.create(&sink, &ResolvedInputs::new()).await.unwrap();
        assert_eq!(
            cloud.poll(sink.id(), &op).await.unwrap(),
            OperationStatus::InProgress
        );
        clock.advance(Duration::from_secs(5));
        match cloud.poll(sink.id(), &op).await.unwrap() {
            OperationStatus::Succeeded {
                physical_id,
                outputs,
            } => {
                assert_eq!(physical_id, "cursor-gateway-logs");
                assert_eq!(
                    outputs["arn"],
                    "arn:aws:logs:us-east-1:123456789012:log-group:cursor-gateway-logs"
                );
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_injected_failure_reported_on_poll() {
        let cloud = SimulatedCloud::new("us-east-1", "123456789012", Arc::new(ManualClock::new()));
        cloud
            .fail_kind(ResourceKind::LogSink, "AccessDenied: logs:CreateLogGroup")
            .await;
        let sink = Resource::LogSink(LogSink::new("logs", "gateway-logs"));
        let op = cloud.create(&sink, &ResolvedInputs::new()).await.unwrap();
        assert!(matches!(
            cloud.poll(sink.id(), &op).await.unwrap(),
            OperationStatus::Failed(_)
        ));
        assert_eq!(cloud.resource_count(ResourceKind::LogSink).await, 0);
    }

    #[tokio::test]
    async fn test_inventory_persists_across_opens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cloud.json");
        {
            let cloud = SimulatedCloud::open(&path, "us-east-1", "123456789012", 1.0).unwrap();
            cloud.set_timing(0.0, 0.0).await;
            let sink = Resource::LogSink(LogSink::new("logs", "gateway-logs"));
            let op = cloud.create(&sink, &ResolvedInputs::new()).await.unwrap();
            cloud.poll(sink.id(), &op).await.unwrap();
        }
        let reopened = SimulatedCloud::open(&path, "us-east-1", "123456789012", 1.0).unwrap();
        assert_eq!(reopened.resource_count(ResourceKind::LogSink).await, 1);
        assert!(reopened.outputs("gateway-logs").await.is_some());
    }
}
