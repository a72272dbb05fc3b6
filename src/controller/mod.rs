// Managed service controller
//
// Keeps `desired_count` instances of the current workload revision in
// service. Each tick observes tasks and target health, advances every
// instance's state machine, then plans starts and drains within the
// deployment configuration's bounds. Load balancer health and the service's
// grace period are separate signals; an instance only goes in service once
// both agree.

pub mod state_machine;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cloud::{
    Clock, CloudBackend, TargetState, TaskDescription, TaskRequest, TaskStatus,
};
use crate::provision::state::StackState;
use crate::resources::service::DeploymentConfiguration;
use crate::stack::GatewayStack;
use state_machine::{is_live, is_terminal_bound, validate_transition, InstanceState};

/// Everything the controller needs to know about the service it runs
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceTarget {
    pub service_name: String,
    pub cluster_arn: String,
    /// Current workload revision
    pub workload_arn: String,
    pub target_group_arn: String,
    pub subnet_ids: Vec<String>,
    pub assign_public_ip: bool,
    pub capacity_provider: String,
    pub desired_count: u32,
    pub grace_period: Duration,
    pub deregistration_delay: Duration,
    pub deployment: DeploymentConfiguration,
}

impl ServiceTarget {
    /// Resolve the service from the stack and what provisioning recorded
    pub fn resolve(stack: &GatewayStack, state: &StackState) -> Result<Self> {
        let service = stack.service().context("Stack has no managed service")?;
        let target_group = stack.target_group().context("Stack has no target group")?;
        let output = |id: &crate::resources::ResourceId, key: &str| -> Result<String> {
            state
                .outputs(id)
                .and_then(|o| o.get(key))
                .cloned()
                .with_context(|| format!("{} has not been provisioned (no {} output)", id, key))
        };

        state
            .get(&stack.ids.service)
            .with_context(|| format!("{} has not been provisioned", stack.ids.service))?;

        Ok(Self {
            service_name: service.name.clone(),
            cluster_arn: output(&stack.ids.cluster, "arn")?,
            workload_arn: output(&stack.ids.workload, "arn")?,
            target_group_arn: output(&stack.ids.target_group, "arn")?,
            subnet_ids: output(&stack.ids.network, "subnet_ids")?
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect(),
            assign_public_ip: service.assign_public_ip,
            capacity_provider: service
                .capacity_provider_strategy
                .iter()
                .max_by_key(|s| s.weight)
                .map(|s| s.capacity_provider.clone())
                .unwrap_or_else(|| "FARGATE".to_string()),
            desired_count: service.desired_count,
            grace_period: Duration::from_secs(service.health_check_grace_period_secs),
            deregistration_delay: Duration::from_secs(target_group.deregistration_delay_secs),
            deployment: service.deployment,
        })
    }
}

/// One desired instance and what the controller knows about it
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub id: Uuid,
    pub task_id: Option<String>,
    pub ip: Option<String>,
    pub workload_arn: String,
    pub state: InstanceState,
    /// Clock time the instance entered its current state
    pub state_since: Duration,
    pub target_health: Option<TargetState>,
    /// Registered with the target group; stays set while connections drain
    pub registered: bool,
}

impl Instance {
    fn pending(workload_arn: &str, now: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: None,
            ip: None,
            workload_arn: workload_arn.to_string(),
            state: InstanceState::Pending,
            state_since: now,
            target_health: None,
            registered: false,
        }
    }

    /// Workload revision number, taken from the definition ARN
    pub fn revision(&self) -> &str {
        self.workload_arn
            .rsplit_once(':')
            .map(|(_, rev)| rev)
            .unwrap_or(&self.workload_arn)
    }

    fn transition(&mut self, to: InstanceState, now: Duration) -> Result<()> {
        validate_transition(&self.state, &to)?;
        info!(
            instance = %self.id,
            task_id = self.task_id.as_deref().unwrap_or("-"),
            revision = self.revision(),
            from = %self.state,
            to = %to,
            "Instance state changed"
        );
        self.state = to;
        self.state_since = now;
        Ok(())
    }
}

/// Instance counts after a tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepSummary {
    pub live: u32,
    pub in_service: u32,
    pub current_in_service: u32,
    pub draining: u32,
}

pub struct ServiceController {
    backend: Arc<dyn CloudBackend>,
    target: ServiceTarget,
    instances: Vec<Instance>,
}

impl ServiceController {
    pub fn new(backend: Arc<dyn CloudBackend>, target: ServiceTarget) -> Self {
        Self {
            backend,
            target,
            instances: Vec::new(),
        }
    }

    pub fn target(&self) -> &ServiceTarget {
        &self.target
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Rebuild instance state from the platform, for a controller that did
    /// not start the service's tasks itself
    pub async fn adopt(&mut self, now: Duration) -> Result<()> {
        let tasks = self.backend.list_tasks(&self.target.service_name).await?;
        let health = self.observe_health().await?;

        self.instances.clear();
        for task in tasks {
            let target_health = task.private_ip.as_ref().and_then(|ip| health.get(ip)).copied();
            let state = match (task.status, target_health) {
                (TaskStatus::Stopped, _) => continue,
                (TaskStatus::Provisioning, _) => InstanceState::Provisioning,
                (TaskStatus::Running, None) => InstanceState::Provisioning,
                (TaskStatus::Running, Some(TargetState::Healthy)) => InstanceState::InService,
                (TaskStatus::Running, Some(TargetState::Draining)) => InstanceState::Draining,
                (TaskStatus::Running, Some(_)) => InstanceState::HealthChecking,
            };
            debug!(task_id = %task.task_id, state = %state, "Adopted task");
            self.instances.push(Instance {
                id: Uuid::new_v4(),
                registered: target_health.is_some(),
                task_id: Some(task.task_id),
                ip: task.private_ip,
                workload_arn: task.workload_arn,
                state,
                state_since: now,
                target_health,
            });
        }
        info!(
            service = %self.target.service_name,
            instances = self.instances.len(),
            "Adopted running instances"
        );
        Ok(())
    }

    async fn observe_health(&self) -> Result<BTreeMap<String, TargetState>> {
        Ok(self
            .backend
            .target_health(&self.target.target_group_arn)
            .await?
            .into_iter()
            .map(|h| (h.target, h.state))
            .collect())
    }

    /// One reconciliation tick at clock time `now`
    pub async fn step(&mut self, now: Duration) -> Result<StepSummary> {
        let tasks: BTreeMap<String, TaskDescription> = self
            .backend
            .list_tasks(&self.target.service_name)
            .await?
            .into_iter()
            .map(|t| (t.task_id.clone(), t))
            .collect();
        let health = self.observe_health().await?;

        let mut instances = std::mem::take(&mut self.instances);
        for instance in instances.iter_mut() {
            if let Err(e) = self.advance(instance, &tasks, &health, now).await {
                error!(instance = %instance.id, "Failed to advance instance: {:#}", e);
            }
        }
        instances.retain(|i| i.state != InstanceState::Terminated);
        self.instances = instances;

        self.plan(now).await;
        Ok(self.summary())
    }

    async fn advance(
        &self,
        instance: &mut Instance,
        tasks: &BTreeMap<String, TaskDescription>,
        health: &BTreeMap<String, TargetState>,
        now: Duration,
    ) -> Result<()> {
        let task = instance.task_id.as_ref().and_then(|id| tasks.get(id));
        instance.target_health = instance.ip.as_ref().and_then(|ip| health.get(ip)).copied();
        let stopped = task.is_some_and(|t| t.status == TaskStatus::Stopped)
            || (instance.task_id.is_some() && task.is_none());

        match instance.state {
            InstanceState::Pending => self.place(instance, now).await,
            InstanceState::Provisioning => {
                if stopped {
                    warn!(instance = %instance.id, "Task stopped before it was running");
                    return instance.transition(InstanceState::Terminated, now);
                }
                if task.is_some_and(|t| t.status == TaskStatus::Running) {
                    let ip = instance
                        .ip
                        .clone()
                        .context("Running task has no private address")?;
                    self.backend
                        .register_target(&self.target.target_group_arn, &ip)
                        .await?;
                    instance.registered = true;
                    instance.transition(InstanceState::HealthChecking, now)?;
                }
                Ok(())
            }
            InstanceState::HealthChecking => {
                if stopped {
                    self.deregister(instance).await?;
                    instance.registered = false;
                    return instance.transition(InstanceState::Terminated, now);
                }
                let in_grace = now.saturating_sub(instance.state_since) < self.target.grace_period;
                match instance.target_health {
                    Some(TargetState::Healthy) if !in_grace => {
                        instance.transition(InstanceState::InService, now)
                    }
                    Some(TargetState::Unhealthy) if !in_grace => {
                        warn!(instance = %instance.id, "Instance failed health checks after grace period");
                        self.begin_drain(instance, now).await
                    }
                    _ => Ok(()),
                }
            }
            InstanceState::InService => {
                if stopped {
                    warn!(
                        instance = %instance.id,
                        reason = task.and_then(|t| t.stop_reason.as_deref()).unwrap_or("unknown"),
                        "In-service task stopped"
                    );
                    self.deregister(instance).await?;
                    instance.registered = false;
                    return instance.transition(InstanceState::Terminated, now);
                }
                if instance.target_health == Some(TargetState::Unhealthy) {
                    warn!(instance = %instance.id, "In-service instance turned unhealthy");
                    return self.begin_drain(instance, now).await;
                }
                Ok(())
            }
            InstanceState::Draining => {
                let drained = !instance.registered
                    || now.saturating_sub(instance.state_since) >= self.target.deregistration_delay;
                if stopped {
                    instance.registered = false;
                    return instance.transition(InstanceState::Terminated, now);
                }
                if drained {
                    if let Some(task_id) = &instance.task_id {
                        self.backend
                            .stop_task(task_id, "Drained by service controller")
                            .await?;
                    }
                    instance.registered = false;
                    instance.transition(InstanceState::Terminated, now)?;
                }
                Ok(())
            }
            InstanceState::Terminated => Ok(()),
        }
    }

    async fn place(&self, instance: &mut Instance, now: Duration) -> Result<()> {
        let request = TaskRequest {
            cluster_arn: self.target.cluster_arn.clone(),
            service: self.target.service_name.clone(),
            workload_arn: instance.workload_arn.clone(),
            subnet_ids: self.target.subnet_ids.clone(),
            assign_public_ip: self.target.assign_public_ip,
            capacity_provider: self.target.capacity_provider.clone(),
        };
        let task = self.backend.run_task(&request).await?;
        instance.task_id = Some(task.task_id);
        instance.ip = task.private_ip;
        instance.transition(InstanceState::Provisioning, now)
    }

    async fn deregister(&self, instance: &Instance) -> Result<()> {
        if instance.registered {
            if let Some(ip) = &instance.ip {
                self.backend
                    .deregister_target(&self.target.target_group_arn, ip)
                    .await?;
            }
        }
        Ok(())
    }

    async fn begin_drain(&self, instance: &mut Instance, now: Duration) -> Result<()> {
        if instance.state == InstanceState::Pending {
            return instance.transition(InstanceState::Terminated, now);
        }
        self.deregister(instance).await?;
        instance.transition(InstanceState::Draining, now)
    }

    /// Decide which instances to start and which to drain
    async fn plan(&mut self, now: Duration) {
        let desired = self.target.desired_count;
        let max_live = self.target.deployment.max_live(desired);
        let min_in_service = self.target.deployment.min_in_service(desired);
        let current = self.target.workload_arn.clone();

        let mut drain: Vec<usize> = Vec::new();

        // Old revisions that are not serving traffic go right away
        for (index, instance) in self.instances.iter().enumerate() {
            if instance.workload_arn != current
                && is_live(&instance.state)
                && instance.state != InstanceState::InService
            {
                drain.push(index);
            }
        }

        // Old in-service instances go one at a time as new ones take over
        let floor = min_in_service.min(desired);
        let mut in_service = self
            .instances
            .iter()
            .filter(|i| i.state == InstanceState::InService)
            .count() as u32;
        let old_in_service: Vec<usize> = self
            .instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.state == InstanceState::InService && i.workload_arn != current)
            .map(|(index, _)| index)
            .collect();
        for index in old_in_service {
            if in_service.saturating_sub(1) < floor {
                break;
            }
            drain.push(index);
            in_service -= 1;
        }

        // Scale in: surplus current-revision instances, least progressed first
        let mut current_live: Vec<usize> = self
            .instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.workload_arn == current && is_live(&i.state))
            .map(|(index, _)| index)
            .collect();
        current_live.sort_by_key(|&index| progress_rank(&self.instances[index].state));
        let surplus = (current_live.len() as u32).saturating_sub(desired) as usize;
        drain.extend(current_live.into_iter().take(surplus));

        drain.sort_unstable();
        drain.dedup();
        for index in drain {
            let mut instance = self.instances[index].clone();
            if let Err(e) = self.begin_drain(&mut instance, now).await {
                error!(instance = %instance.id, "Failed to drain instance: {:#}", e);
            }
            self.instances[index] = instance;
        }
        self.instances.retain(|i| i.state != InstanceState::Terminated);

        // Start replacements within the live bound
        let live = self.instances.iter().filter(|i| is_live(&i.state)).count() as u32;
        let current_live = self
            .instances
            .iter()
            .filter(|i| i.workload_arn == current && is_live(&i.state))
            .count() as u32;
        let needed = desired.saturating_sub(current_live);
        let room = max_live.saturating_sub(live);
        for _ in 0..needed.min(room) {
            let mut instance = Instance::pending(&current, now);
            debug!(instance = %instance.id, "New instance pending");
            if let Err(e) = self.place(&mut instance, now).await {
                error!(instance = %instance.id, "Failed to place instance: {:#}", e);
            }
            self.instances.push(instance);
        }
    }

    pub fn summary(&self) -> StepSummary {
        let current = &self.target.workload_arn;
        let mut summary = StepSummary::default();
        for instance in &self.instances {
            if is_live(&instance.state) {
                summary.live += 1;
            }
            if instance.state == InstanceState::InService {
                summary.in_service += 1;
                if &instance.workload_arn == current {
                    summary.current_in_service += 1;
                }
            }
            if is_terminal_bound(&instance.state) {
                summary.draining += 1;
            }
        }
        summary
    }

    /// Exactly `desired_count` current instances in service and nothing else
    pub fn is_converged(&self) -> bool {
        let summary = self.summary();
        summary.current_in_service == self.target.desired_count
            && summary.live == self.target.desired_count
            && summary.draining == 0
    }

    /// Tick on `tick` until converged, or fail once `timeout` of clock time passes
    pub async fn run_until_converged(
        &mut self,
        clock: &dyn Clock,
        tick: Duration,
        timeout: Duration,
    ) -> Result<()> {
        info!(
            service = %self.target.service_name,
            desired = self.target.desired_count,
            "Service reconciliation loop started"
        );
        let deadline = clock.now() + timeout;
        let mut ticker = interval(tick);

        loop {
            ticker.tick().await;
            let now = clock.now();
            match self.step(now).await {
                Ok(summary) => debug!(
                    live = summary.live,
                    in_service = summary.in_service,
                    draining = summary.draining,
                    "Reconciled"
                ),
                Err(e) => error!("Error in service reconciliation loop: {:#}", e),
            }
            if self.is_converged() {
                info!(service = %self.target.service_name, "Service converged");
                return Ok(());
            }
            if now >= deadline {
                bail!(
                    "Service {} did not converge within {}s",
                    self.target.service_name,
                    timeout.as_secs()
                );
            }
        }
    }
}

/// Lower ranks are further from serving traffic
fn progress_rank(state: &InstanceState) -> u8 {
    match state {
        InstanceState::Pending => 0,
        InstanceState::Provisioning => 1,
        InstanceState::HealthChecking => 2,
        InstanceState::InService => 3,
        InstanceState::Draining | InstanceState::Terminated => 4,
    }
}
