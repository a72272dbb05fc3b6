// Provisioning engine
//
// Walks the resource graph wave by wave. Image resources go through the
// `ImagePipeline`, container specs are resolved locally, and everything else
// is handed to the `CloudBackend` and polled until it converges. The first
// failure stops the run after the current wave; whatever completed is kept in
// the recorded state.

pub mod plan;
pub mod state;

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::build::outputs as image_outputs;
use crate::cloud::{CloudBackend, OperationStatus, ResolvedInputs};
use crate::error::{ProvisionError, ProvisionResult};
use crate::graph::ResourceGraph;
use crate::resources::{
    ContainerSpec, ImageAsset, ImageDeployment, RegistryRepository, RemovalPolicy, Resource,
    ResourceId, ResourceKind, ResourceOutputs,
};
use crate::settings::ControllerSettings;
use plan::{effective_fingerprint, resolve_inputs, Action, Plan};
use state::StackState;

/// Output keys of a resolved container spec
pub mod container_outputs {
    pub const IMAGE: &str = "image";
    pub const IMAGE_DIGEST: &str = "image_digest";
    pub const CONTAINER_NAME: &str = "container_name";
    pub const PORT: &str = "port";
}

/// Builds and publishes the images the stack runs
#[async_trait]
pub trait ImagePipeline: Send + Sync {
    async fn ensure_registry(
        &self,
        repository: &RegistryRepository,
    ) -> ProvisionResult<ResourceOutputs>;

    async fn delete_registry(&self, id: &ResourceId, repository_name: &str) -> ProvisionResult<()>;

    /// Content digest of an asset's build context, without building it
    async fn asset_digest(&self, asset: &ImageAsset) -> ProvisionResult<String>;

    async fn build(&self, asset: &ImageAsset) -> ProvisionResult<ResourceOutputs>;

    async fn publish(
        &self,
        deployment: &ImageDeployment,
        asset: &ResourceOutputs,
        registry: &ResourceOutputs,
    ) -> ProvisionResult<ResourceOutputs>;
}

/// Polling behavior for backend operations
#[derive(Debug, Clone, Copy)]
pub struct ProvisionOptions {
    pub poll_interval: Duration,
    pub operation_timeout: Duration,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self::from(&ControllerSettings::default())
    }
}

impl From<&ControllerSettings> for ProvisionOptions {
    fn from(settings: &ControllerSettings) -> Self {
        Self {
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            operation_timeout: Duration::from_secs(settings.operation_timeout_secs),
        }
    }
}

/// What one apply or teardown run did
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub applied: Vec<(ResourceId, Action)>,
}

impl ApplyReport {
    #[cfg(test)]
    pub fn action(&self, id: &ResourceId) -> Option<Action> {
        self.applied
            .iter()
            .find(|(applied, _)| applied == id)
            .map(|(_, action)| *action)
    }

    pub fn changed(&self) -> usize {
        self.applied
            .iter()
            .filter(|(_, action)| *action != Action::Unchanged)
            .count()
    }
}

/// Result of one resource step within a wave
struct StepOutcome {
    id: ResourceId,
    action: Action,
    applied: Option<Applied>,
}

struct Applied {
    physical_id: String,
    fingerprint: String,
    outputs: ResourceOutputs,
}

pub struct Provisioner {
    backend: Arc<dyn CloudBackend>,
    pipeline: Arc<dyn ImagePipeline>,
    options: ProvisionOptions,
    state: StackState,
    state_path: Option<PathBuf>,
}

impl Provisioner {
    pub fn new(
        backend: Arc<dyn CloudBackend>,
        pipeline: Arc<dyn ImagePipeline>,
        state: StackState,
        options: ProvisionOptions,
    ) -> Self {
        Self {
            backend,
            pipeline,
            options,
            state,
            state_path: None,
        }
    }

    /// Persist state to `path` after every wave
    pub fn with_state_path(mut self, path: PathBuf) -> Self {
        self.state_path = Some(path);
        self
    }

    pub fn state(&self) -> &StackState {
        &self.state
    }

    fn save_state(&self) -> ProvisionResult<()> {
        if let Some(path) = &self.state_path {
            self.state
                .save(path)
                .map_err(|e| ProvisionError::Config(format!("{:#}", e)))?;
        }
        Ok(())
    }

    /// Fingerprint material beyond the descriptor and its inputs
    async fn extras(
        &self,
        graph: &ResourceGraph,
        only: Option<&BTreeSet<ResourceId>>,
    ) -> ProvisionResult<BTreeMap<ResourceId, String>> {
        let mut extras = BTreeMap::new();
        for resource in graph.resources() {
            if let Resource::ImageAsset(asset) = resource {
                if only.is_some_and(|only| !only.contains(&asset.id)) {
                    continue;
                }
                extras.insert(asset.id.clone(), self.pipeline.asset_digest(asset).await?);
            }
        }
        Ok(extras)
    }

    /// Preview what `apply` would do
    pub async fn plan(&self, graph: &ResourceGraph) -> ProvisionResult<Plan> {
        graph.validate()?;
        let extras = self.extras(graph, None).await?;
        Plan::compute(graph, &self.state, &extras)
    }

    /// Converge the recorded state onto `graph`.
    ///
    /// With `only`, resources outside the set are left untouched.
    pub async fn apply(
        &mut self,
        graph: &ResourceGraph,
        only: Option<&BTreeSet<ResourceId>>,
    ) -> ProvisionResult<ApplyReport> {
        graph.validate()?;
        let extras = self.extras(graph, only).await?;
        let mut report = ApplyReport::default();

        for (index, wave) in graph.waves()?.into_iter().enumerate() {
            let wave: Vec<ResourceId> = wave
                .into_iter()
                .filter(|id| only.is_none_or(|only| only.contains(id)))
                .collect();
            if wave.is_empty() {
                continue;
            }
            debug!(wave = index, resources = wave.len(), "Applying wave");

            let steps = wave.iter().filter_map(|id| graph.resource(id)).map(|resource| {
                let extra = extras.get(resource.id()).cloned();
                self.apply_one(resource, extra)
            });
            let results = join_all(steps).await;

            let mut failure = None;
            for result in results {
                match result {
                    Ok(outcome) => {
                        if let Some(applied) = outcome.applied {
                            let policy = graph
                                .resource(&outcome.id)
                                .map(|r| r.removal_policy())
                                .unwrap_or_default();
                            self.state.record(
                                &outcome.id,
                                applied.physical_id,
                                applied.fingerprint,
                                applied.outputs,
                                policy,
                            );
                        }
                        report.applied.push((outcome.id, outcome.action));
                    }
                    Err(e) => {
                        error!("Provisioning failed: {}", e);
                        failure.get_or_insert(e);
                    }
                }
            }

            self.save_state()?;
            if let Some(e) = failure {
                return Err(e);
            }
        }

        if only.is_none() {
            let orphans: Vec<ResourceId> = self
                .state
                .resources
                .keys()
                .filter(|id| graph.get(id).is_none())
                .cloned()
                .collect();
            for id in orphans.into_iter().rev() {
                let action = self.remove_recorded(&id).await?;
                report.applied.push((id, action));
                self.save_state()?;
            }
        }

        info!(changed = report.changed(), "Stack converged");
        Ok(report)
    }

    async fn apply_one(
        &self,
        resource: &Resource,
        extra: Option<String>,
    ) -> ProvisionResult<StepOutcome> {
        let id = resource.id().clone();
        let inputs = resolve_inputs(resource, &self.state);
        let fingerprint = effective_fingerprint(resource, &inputs, extra.as_deref());
        let recorded = self.state.get(&id);

        let action = match recorded {
            None => Action::Create,
            Some(r) if r.fingerprint == fingerprint => {
                debug!(resource = %id, "Unchanged");
                return Ok(StepOutcome {
                    id,
                    action: Action::Unchanged,
                    applied: None,
                });
            }
            Some(_) if resource.is_versioned() => Action::Replace,
            Some(_) => Action::Update,
        };
        info!(resource = %id, action = %action, "Applying resource");

        let (physical_id, outputs) = match resource {
            Resource::Registry(repository) => {
                let outputs = self.pipeline.ensure_registry(repository).await?;
                (repository.repository_name.clone(), outputs)
            }
            Resource::ImageAsset(asset) => {
                let outputs = self.pipeline.build(asset).await?;
                let physical_id = outputs
                    .get(image_outputs::ASSET_TAG)
                    .cloned()
                    .unwrap_or_else(|| id.name().to_string());
                (physical_id, outputs)
            }
            Resource::ImageDeployment(deployment) => {
                let asset = required(&inputs, &id, &deployment.asset)?;
                let registry = required(&inputs, &id, &deployment.registry)?;
                let outputs = self.pipeline.publish(deployment, asset, registry).await?;
                let physical_id = outputs
                    .get(image_outputs::IMAGE_URI)
                    .cloned()
                    .unwrap_or_else(|| id.name().to_string());
                (physical_id, outputs)
            }
            Resource::ContainerSpec(container) => {
                (container.container_name.clone(), resolve_container(container, &inputs)?)
            }
            _ => {
                let operation = match recorded {
                    None => self.backend.create(resource, &inputs).await?,
                    Some(r) => self.backend.update(resource, &r.physical_id, &inputs).await?,
                };
                match self.wait(&id, &operation).await? {
                    OperationStatus::Succeeded {
                        physical_id,
                        outputs,
                    } => (physical_id, outputs),
                    OperationStatus::Failed(message) => {
                        return Err(ProvisionError::Backend {
                            resource: id,
                            message,
                        })
                    }
                    OperationStatus::InProgress => {
                        return Err(ProvisionError::Timeout {
                            resource: id,
                            waited_secs: self.options.operation_timeout.as_secs(),
                        })
                    }
                }
            }
        };

        Ok(StepOutcome {
            id,
            action,
            applied: Some(Applied {
                physical_id,
                fingerprint,
                outputs,
            }),
        })
    }

    /// Poll an operation until it leaves `InProgress` or the timeout passes
    async fn wait(&self, id: &ResourceId, operation: &str) -> ProvisionResult<OperationStatus> {
        let started = tokio::time::Instant::now();
        loop {
            let status = self.backend.poll(id, operation).await?;
            if status != OperationStatus::InProgress {
                return Ok(status);
            }
            if started.elapsed() >= self.options.operation_timeout {
                return Err(ProvisionError::Timeout {
                    resource: id.clone(),
                    waited_secs: self.options.operation_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    /// Delete every recorded resource, dependents first.
    ///
    /// Resources with a `Retain` policy are left in place and dropped from
    /// the recorded state.
    pub async fn destroy(&mut self, graph: &ResourceGraph) -> ProvisionResult<ApplyReport> {
        let mut order = graph.reverse_order()?;
        // Recorded resources the graph no longer knows about go first
        let mut orphans: Vec<ResourceId> = self
            .state
            .resources
            .keys()
            .filter(|id| graph.get(id).is_none())
            .cloned()
            .collect();
        orphans.reverse();
        orphans.append(&mut order);

        let mut report = ApplyReport::default();
        for id in orphans {
            if self.state.get(&id).is_none() {
                continue;
            }
            let action = self.remove_recorded(&id).await?;
            report.applied.push((id, action));
            self.save_state()?;
        }
        Ok(report)
    }

    /// Delete a recorded resource, or only forget it when it is retained
    async fn remove_recorded(&mut self, id: &ResourceId) -> ProvisionResult<Action> {
        let Some(recorded) = self.state.get(id) else {
            return Ok(Action::Unchanged);
        };
        if recorded.removal_policy == RemovalPolicy::Retain {
            info!(resource = %id, physical_id = %recorded.physical_id, "Retaining resource");
            self.state.forget(id);
            return Ok(Action::Unchanged);
        }
        self.destroy_one(id).await?;
        Ok(Action::Delete)
    }

    async fn destroy_one(&mut self, id: &ResourceId) -> ProvisionResult<()> {
        let Some(recorded) = self.state.get(id).cloned() else {
            return Ok(());
        };
        info!(resource = %id, physical_id = %recorded.physical_id, "Deleting resource");
        match id.kind() {
            ResourceKind::Registry => {
                self.pipeline
                    .delete_registry(id, &recorded.physical_id)
                    .await?;
            }
            // Images go with their repository; container specs only exist locally
            ResourceKind::ImageAsset
            | ResourceKind::ImageDeployment
            | ResourceKind::ContainerSpec => {}
            _ => {
                let operation = self.backend.delete(id, &recorded.physical_id).await?;
                match self.wait(id, &operation).await? {
                    OperationStatus::Failed(message) => {
                        return Err(ProvisionError::Backend {
                            resource: id.clone(),
                            message,
                        })
                    }
                    OperationStatus::Succeeded { .. } => {}
                    OperationStatus::InProgress => {
                        warn!(resource = %id, "Deletion still in progress");
                    }
                }
            }
        }
        self.state.forget(id);
        Ok(())
    }
}

fn required<'a>(
    inputs: &'a ResolvedInputs,
    owner: &ResourceId,
    dependency: &ResourceId,
) -> ProvisionResult<&'a ResourceOutputs> {
    inputs
        .get(dependency)
        .ok_or_else(|| ProvisionError::Validation {
            resource: owner.clone(),
            message: format!("{} has not been provisioned", dependency),
        })
}

/// Pin the container image to the digest the publish step produced
fn resolve_container(
    container: &ContainerSpec,
    inputs: &ResolvedInputs,
) -> ProvisionResult<ResourceOutputs> {
    container.validate()?;
    let published = required(inputs, &container.id, &container.image.produced_by)?;
    let get = |key: &str| {
        published
            .get(key)
            .ok_or_else(|| ProvisionError::Validation {
                resource: container.id.clone(),
                message: format!("{} has no {} output", container.image.produced_by, key),
            })
    };
    let uri = get(image_outputs::IMAGE_URI)?;
    let digest = get(image_outputs::IMAGE_DIGEST)?;

    let mut outputs = ResourceOutputs::new();
    outputs.insert(
        container_outputs::IMAGE.into(),
        format!("{}@{}", uri, digest),
    );
    outputs.insert(container_outputs::IMAGE_DIGEST.into(), digest.clone());
    outputs.insert(
        container_outputs::CONTAINER_NAME.into(),
        container.container_name.clone(),
    );
    outputs.insert(container_outputs::PORT.into(), container.port.to_string());
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{ImagePublisher, StaticBuilder};
    use crate::cloud::{ManualClock, SimulatedCloud};
    use crate::registry::{MemoryRegistry, RegistryApi};
    use crate::settings::Settings;
    use crate::stack::{ContainerEnvironment, GatewayStack, OUTPUT_API_BASE_URL, OUTPUT_DNS_NAME};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        cloud: Arc<SimulatedCloud>,
        registry: Arc<MemoryRegistry>,
        stack: GatewayStack,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/Dockerfile_cursor"),
            "FROM python:3.12-slim\n",
        )
        .unwrap();
        fs::write(dir.path().join("src/app.py"), "print('gateway')\n").unwrap();

        let cloud = Arc::new(SimulatedCloud::new(
            "us-east-1",
            "123456789012",
            Arc::new(ManualClock::new()),
        ));
        let registry = Arc::new(MemoryRegistry::new("us-east-1", "123456789012"));
        let stack =
            GatewayStack::build(&Settings::default(), ContainerEnvironment::defaults()).unwrap();
        Fixture {
            dir,
            cloud,
            registry,
            stack,
        }
    }

    fn options() -> ProvisionOptions {
        ProvisionOptions {
            poll_interval: Duration::from_millis(1),
            operation_timeout: Duration::from_millis(200),
        }
    }

    fn provisioner(f: &Fixture, state: StackState) -> Provisioner {
        let pipeline = Arc::new(ImagePublisher::new(
            Arc::new(StaticBuilder),
            f.registry.clone(),
            f.dir.path(),
        ));
        Provisioner::new(f.cloud.clone(), pipeline, state, options())
    }

    #[tokio::test]
    async fn test_apply_creates_stack_and_exposes_base_url() {
        let f = fixture();
        let mut p = provisioner(&f, StackState::new("test"));
        let report = p.apply(&f.stack.graph, None).await.unwrap();
        assert_eq!(report.changed(), 14);

        let lb = p.state().outputs(&f.stack.ids.load_balancer).unwrap();
        let dns = lb[OUTPUT_DNS_NAME].clone();
        let outputs = f.stack.stack_outputs(Some(lb));
        assert_eq!(outputs[OUTPUT_API_BASE_URL], format!("http://{}/api/v1", dns));

        let container = p.state().outputs(&f.stack.ids.container).unwrap();
        assert!(container[container_outputs::IMAGE].contains(":latest@sha256:"));

        // Second run has nothing to do
        let again = p.apply(&f.stack.graph, None).await.unwrap();
        assert_eq!(again.changed(), 0);
    }

    #[tokio::test]
    async fn test_context_change_rolls_a_new_revision() {
        let f = fixture();
        let mut p = provisioner(&f, StackState::new("test"));
        p.apply(&f.stack.graph, None).await.unwrap();
        let before = p.state().outputs(&f.stack.ids.workload).unwrap()["revision"].clone();

        fs::write(f.dir.path().join("src/app.py"), "print('v2')\n").unwrap();
        let plan = p.plan(&f.stack.graph).await.unwrap();
        assert_eq!(plan.action(&f.stack.ids.image_asset), Some(Action::Update));
        assert_eq!(plan.action(&f.stack.ids.workload), Some(Action::Replace));
        assert_eq!(plan.action(&f.stack.ids.network), Some(Action::Unchanged));

        let report = p.apply(&f.stack.graph, None).await.unwrap();
        assert_eq!(report.action(&f.stack.ids.workload), Some(Action::Replace));
        assert_eq!(report.action(&f.stack.ids.service), Some(Action::Update));
        assert_eq!(report.action(&f.stack.ids.load_balancer), Some(Action::Unchanged));
        let after = p.state().outputs(&f.stack.ids.workload).unwrap()["revision"].clone();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_failed_build_creates_nothing_downstream() {
        let f = fixture();
        fs::remove_file(f.dir.path().join("src/Dockerfile_cursor")).unwrap();
        let mut p = provisioner(&f, StackState::new("test"));
        let err = p.apply(&f.stack.graph, None).await.unwrap_err();
        assert!(err.is_image_failure());
        assert!(p.state().get(&f.stack.ids.workload).is_none());
        assert!(p.state().get(&f.stack.ids.service).is_none());
        assert_eq!(f.cloud.resource_count(ResourceKind::Service).await, 0);
    }

    #[tokio::test]
    async fn test_backend_failure_keeps_completed_work() {
        let f = fixture();
        f.cloud
            .fail_kind(ResourceKind::Listener, "listener quota exceeded")
            .await;
        let mut p = provisioner(&f, StackState::new("test"));
        let err = p.apply(&f.stack.graph, None).await.unwrap_err();
        assert_eq!(err.resource(), Some(&f.stack.ids.listener));
        assert!(p.state().get(&f.stack.ids.load_balancer).is_some());
        assert!(p.state().get(&f.stack.ids.service).is_none());
    }

    #[tokio::test]
    async fn test_slow_operation_times_out() {
        let f = fixture();
        f.cloud.set_timing(10_000.0, 10.0).await;
        let mut p = provisioner(&f, StackState::new("test"));
        let err = p.apply(&f.stack.graph, None).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_subset_apply_only_publishes_image() {
        let f = fixture();
        let mut only = f.stack.graph.ancestors(&f.stack.ids.image_deployment);
        only.insert(f.stack.ids.image_deployment.clone());
        let mut p = provisioner(&f, StackState::new("test"));
        let report = p.apply(&f.stack.graph, Some(&only)).await.unwrap();
        assert_eq!(report.changed(), 3);
        assert!(p.state().get(&f.stack.ids.network).is_none());
        let images = f.registry.list_images("bedrock-proxy-api-ecs").await.unwrap();
        assert_eq!(images.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_resources_honor_removal_policy() {
        let f = fixture();
        let registry = RegistryRepository::new("Repo", "gateway-images", 5);
        let sink = crate::resources::LogSink::new("Logs", "gateway-logs");
        let mut before = ResourceGraph::new();
        before.add(Resource::Registry(registry.clone()), []).unwrap();
        before.add(Resource::LogSink(sink.clone()), []).unwrap();

        let mut p = provisioner(&f, StackState::new("test"));
        p.apply(&before, None).await.unwrap();
        assert_eq!(f.cloud.resource_count(ResourceKind::LogSink).await, 1);

        let report = p.apply(&ResourceGraph::new(), None).await.unwrap();
        assert_eq!(report.action(&registry.id), Some(Action::Unchanged));
        assert_eq!(report.action(&sink.id), Some(Action::Delete));
        assert!(p.state().is_empty());
        assert_eq!(f.cloud.resource_count(ResourceKind::LogSink).await, 0);
        // Retained repository is still there
        assert!(f.registry.list_images("gateway-images").await.is_ok());
    }

    #[tokio::test]
    async fn test_destroy_retains_registry_only() {
        let f = fixture();
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("state.json");
        let mut p = provisioner(&f, StackState::new("test")).with_state_path(state_path.clone());
        p.apply(&f.stack.graph, None).await.unwrap();

        let report = p.destroy(&f.stack.graph).await.unwrap();
        assert_eq!(report.action(&f.stack.ids.registry), Some(Action::Unchanged));
        assert_eq!(report.action(&f.stack.ids.service), Some(Action::Delete));
        assert!(p.state().is_empty());
        assert!(StackState::load(&state_path, "test").unwrap().is_empty());

        assert_eq!(f.cloud.resource_count(ResourceKind::Service).await, 0);
        assert_eq!(f.cloud.resource_count(ResourceKind::Network).await, 0);
        assert_eq!(f.cloud.resource_count(ResourceKind::LogSink).await, 0);
        assert!(f.registry.list_images("bedrock-proxy-api-ecs").await.is_ok());
    }
}
