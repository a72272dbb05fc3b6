// Gateway stack assembly
//
// Turns validated settings and the resolved container environment into the
// resource graph of the proxy gateway, with every ordering edge declared
// explicitly.

pub mod environment;

use tracing::debug;

pub use environment::{ContainerEnvironment, EnvKey, ValueSource};

use crate::error::{ProvisionError, ProvisionResult};
use crate::graph::ResourceGraph;
use crate::resources::compute::{LogConfiguration, OsFamily};
use crate::resources::iam::{self, ExecutionGrants, ReviewFinding, TaskGrants};
use crate::resources::load_balancer::{HealthCheck, Protocol, TargetType};
use crate::resources::service::{
    CapacityProviderStrategy, DeploymentConfiguration, LoadBalancerBinding,
};
use crate::resources::{
    Cluster, ContainerSpec, ImageAsset, ImageDeployment, Listener, LoadBalancer, LogSink,
    ManagedService, NetworkFabric, RegistryRepository, Resource, ResourceId, ResourceKind,
    ResourceOutputs, Role, TargetGroup, WorkloadDefinition,
};
use crate::settings::Settings;

/// Stack output holding the caller-facing entry point
pub const OUTPUT_API_BASE_URL: &str = "APIBaseUrl";

/// Output key under which a load balancer reports its DNS name
pub const OUTPUT_DNS_NAME: &str = "dns_name";

/// Base URL clients point their OpenAI-compatible SDK at
pub fn api_base_url(load_balancer_dns: &str) -> String {
    format!("http://{}/api/v1", load_balancer_dns)
}

/// Ids of every node in the gateway stack
#[derive(Debug, Clone)]
pub struct StackIds {
    pub registry: ResourceId,
    pub image_asset: ResourceId,
    pub image_deployment: ResourceId,
    pub network: ResourceId,
    pub cluster: ResourceId,
    pub execution_role: ResourceId,
    pub task_role: ResourceId,
    pub log_sink: ResourceId,
    pub container: ResourceId,
    pub workload: ResourceId,
    pub load_balancer: ResourceId,
    pub target_group: ResourceId,
    pub listener: ResourceId,
    pub service: ResourceId,
}

impl StackIds {
    /// Every node paired with the part it plays
    pub fn parts(&self) -> [(&'static str, &ResourceId); 14] {
        [
            ("image registry", &self.registry),
            ("image build", &self.image_asset),
            ("image publish", &self.image_deployment),
            ("network", &self.network),
            ("cluster", &self.cluster),
            ("execution role", &self.execution_role),
            ("task role", &self.task_role),
            ("log sink", &self.log_sink),
            ("container", &self.container),
            ("workload", &self.workload),
            ("load balancer", &self.load_balancer),
            ("target group", &self.target_group),
            ("listener", &self.listener),
            ("service", &self.service),
        ]
    }
}

/// The assembled gateway stack
#[derive(Debug, Clone)]
pub struct GatewayStack {
    pub name: String,
    pub region: String,
    pub account_id: String,
    pub graph: ResourceGraph,
    pub ids: StackIds,
    pub environment: ContainerEnvironment,
}

impl GatewayStack {
    pub fn build(settings: &Settings, environment: ContainerEnvironment) -> ProvisionResult<Self> {
        let region = settings.stack.region.clone();
        let account_id = settings.stack.account_id.clone();
        if account_id.is_empty() {
            return Err(ProvisionError::Config(
                "stack.account_id must be known before the stack is assembled".to_string(),
            ));
        }

        let mut graph = ResourceGraph::new();

        // Registry, retained across teardown
        let mut registry = RegistryRepository::new(
            "proxy-api-repo",
            &settings.registry.repository_name,
            settings.registry.max_image_count,
        );
        registry.scan_on_push = settings.registry.scan_on_push;
        let registry_id = registry.id.clone();
        let repository_arn = registry.arn(&region, &account_id);
        graph.add(Resource::Registry(registry), [])?;

        // Image Publisher: build, then copy into the registry
        let mut asset = ImageAsset::new(
            "proxy-api-image",
            &settings.image.context_dir,
            &settings.image.build_file,
        );
        asset.excludes = settings.image.excludes.clone();
        asset.platform = settings.image.platform.clone();
        let asset_id = asset.id.clone();
        graph.add(Resource::ImageAsset(asset), [registry_id.clone()])?;

        let deployment = ImageDeployment::new(
            "proxy-api-image-copy",
            &asset_id,
            &registry_id,
            &settings.registry.image_tag,
        );
        let deployment_id = deployment.id.clone();
        let image = deployment.reference(&settings.registry.repository_name);
        graph.add(
            Resource::ImageDeployment(deployment),
            [registry_id.clone(), asset_id.clone()],
        )?;

        // Network
        let cidr = settings
            .network_cidr()
            .map_err(|e| ProvisionError::Config(e.to_string()))?;
        let network = NetworkFabric::public(
            "vpc",
            cidr,
            settings.network.max_zones,
            settings.network.subnet_mask,
        );
        network.validate()?;
        let network_id = network.id.clone();
        graph.add(Resource::Network(network), [])?;

        let cluster = Cluster::new("proxy-cluster", &network_id);
        let cluster_id = cluster.id.clone();
        graph.add(Resource::Cluster(cluster), [network_id.clone()])?;

        // Log sink, destroyed with the stack
        let mut log_sink = LogSink::new(&settings.task.log_group_name, &settings.task.log_group_name);
        log_sink.retention_days = settings.task.log_retention_days;
        let log_sink_id = log_sink.id.clone();
        let log_streams_arn = log_sink.streams_arn(&region, &account_id);
        graph.add(Resource::LogSink(log_sink), [])?;

        // Roles
        let role_refs = [registry_id.clone(), log_sink_id.clone()];
        let execution = iam::execution_role(
            "proxy-exec-role",
            ExecutionGrants {
                repository_arn,
                log_streams_arn,
                references: &role_refs,
            },
        );
        let task = iam::task_role(
            "proxy-task-role",
            TaskGrants {
                parameter_arn: iam::parameter_arn(
                    &region,
                    &account_id,
                    environment.api_key_param_name(),
                ),
            },
        );
        iam::validate_separation(&execution, &task)?;
        let execution_id = execution.id.clone();
        let task_id = task.id.clone();
        graph.add(Resource::Role(execution), role_refs.iter().cloned())?;
        graph.add(Resource::Role(task), [])?;

        // Container spec, ordered after the image copy and the log sink
        let container = ContainerSpec {
            id: ResourceId::new(ResourceKind::ContainerSpec, &settings.task.container_name),
            container_name: settings.task.container_name.clone(),
            image,
            port: settings.task.container_port,
            environment: environment.to_map(),
            log: LogConfiguration {
                sink: log_sink_id.clone(),
                stream_prefix: settings
                    .task
                    .log_stream_prefix
                    .clone()
                    .unwrap_or_else(|| settings.task.log_group_name.clone()),
            },
            essential: true,
        };
        container.validate()?;
        let container_id = container.id.clone();
        graph.add(
            Resource::ContainerSpec(container),
            [deployment_id.clone(), log_sink_id.clone()],
        )?;

        let workload = WorkloadDefinition {
            id: ResourceId::new(ResourceKind::WorkloadDefinition, "proxy-task-def"),
            family: format!("{}-proxy-task", settings.stack.name),
            cpu: settings.task.cpu,
            memory_mib: settings.task.memory_mib,
            architecture: settings.task.architecture,
            os_family: OsFamily::Linux,
            execution_role: execution_id.clone(),
            task_role: task_id.clone(),
            containers: vec![container_id.clone()],
        };
        workload.validate()?;
        let workload_id = workload.id.clone();
        graph.add(
            Resource::WorkloadDefinition(workload),
            [container_id.clone(), execution_id.clone(), task_id.clone()],
        )?;

        // Front door
        let load_balancer = LoadBalancer::new("proxy-alb", &settings.load_balancer.name, &network_id);
        let load_balancer_id = load_balancer.id.clone();
        graph.add(Resource::LoadBalancer(load_balancer), [network_id.clone()])?;

        let lb = &settings.load_balancer;
        let target_group = TargetGroup {
            id: ResourceId::new(ResourceKind::TargetGroup, "proxy-alb-targets"),
            port: settings.task.container_port,
            protocol: Protocol::Http,
            target_type: TargetType::Ip,
            health_check: HealthCheck {
                path: lb.health_check_path.clone(),
                interval_secs: lb.health_check_interval_secs,
                timeout_secs: lb.health_check_timeout_secs,
                healthy_threshold: lb.healthy_threshold,
                unhealthy_threshold: lb.unhealthy_threshold,
                ..Default::default()
            },
            deregistration_delay_secs: lb.deregistration_delay_secs,
            network: network_id.clone(),
        };
        target_group.validate()?;
        let target_group_id = target_group.id.clone();
        graph.add(Resource::TargetGroup(target_group), [network_id.clone()])?;

        let listener = Listener {
            id: ResourceId::new(ResourceKind::Listener, "proxy-alb-listener"),
            load_balancer: load_balancer_id.clone(),
            port: lb.listener_port,
            protocol: Protocol::Http,
            default_target_group: target_group_id.clone(),
        };
        let listener_id = listener.id.clone();
        graph.add(
            Resource::Listener(listener),
            [load_balancer_id.clone(), target_group_id.clone()],
        )?;

        // Managed service
        let mut service = ManagedService::new(
            &settings.service.name,
            &cluster_id,
            &workload_id,
            &network_id,
            LoadBalancerBinding {
                target_group: target_group_id.clone(),
                listener: listener_id.clone(),
                container_name: settings.task.container_name.clone(),
                container_port: settings.task.container_port,
            },
        );
        service.desired_count = settings.service.desired_count;
        service.health_check_grace_period_secs = settings.service.health_check_grace_period_secs;
        service.assign_public_ip = settings.service.assign_public_ip;
        service.capacity_provider_strategy = vec![CapacityProviderStrategy {
            capacity_provider: settings.service.capacity_provider.clone(),
            weight: settings.service.capacity_provider_weight,
            base: 0,
        }];
        service.deployment = DeploymentConfiguration {
            minimum_healthy_percent: settings.service.minimum_healthy_percent,
            maximum_percent: settings.service.maximum_percent,
        };
        service.validate()?;
        let service_id = service.id.clone();
        graph.add(
            Resource::Service(service),
            [
                cluster_id.clone(),
                workload_id.clone(),
                network_id.clone(),
                target_group_id.clone(),
                listener_id.clone(),
            ],
        )?;

        graph.validate()?;
        debug!(stack = %settings.stack.name, resources = graph.len(), "Assembled gateway stack");

        Ok(Self {
            name: settings.stack.name.clone(),
            region,
            account_id,
            graph,
            ids: StackIds {
                registry: registry_id,
                image_asset: asset_id,
                image_deployment: deployment_id,
                network: network_id,
                cluster: cluster_id,
                execution_role: execution_id,
                task_role: task_id,
                log_sink: log_sink_id,
                container: container_id,
                workload: workload_id,
                load_balancer: load_balancer_id,
                target_group: target_group_id,
                listener: listener_id,
                service: service_id,
            },
            environment,
        })
    }

    pub fn service(&self) -> Option<&ManagedService> {
        match self.graph.resource(&self.ids.service) {
            Some(Resource::Service(service)) => Some(service),
            _ => None,
        }
    }

    pub fn target_group(&self) -> Option<&TargetGroup> {
        match self.graph.resource(&self.ids.target_group) {
            Some(Resource::TargetGroup(tg)) => Some(tg),
            _ => None,
        }
    }

    fn role(&self, id: &ResourceId) -> Option<&Role> {
        match self.graph.resource(id) {
            Some(Resource::Role(role)) => Some(role),
            _ => None,
        }
    }

    /// Wildcard grants worth a human look before rollout
    pub fn review_findings(&self) -> Vec<ReviewFinding> {
        let roles: Vec<&Role> = [&self.ids.execution_role, &self.ids.task_role]
            .into_iter()
            .filter_map(|id| self.role(id))
            .collect();
        iam::review_findings(&roles)
    }

    /// Stack-level outputs derived from recorded resource outputs
    pub fn stack_outputs(
        &self,
        load_balancer_outputs: Option<&ResourceOutputs>,
    ) -> ResourceOutputs {
        let mut outputs = ResourceOutputs::new();
        if let Some(dns) = load_balancer_outputs.and_then(|o| o.get(OUTPUT_DNS_NAME)) {
            outputs.insert(OUTPUT_API_BASE_URL.to_string(), api_base_url(dns));
        }
        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> GatewayStack {
        GatewayStack::build(&Settings::default(), ContainerEnvironment::defaults()).unwrap()
    }

    #[test]
    fn test_default_stack_is_valid() {
        let stack = stack();
        assert_eq!(stack.graph.len(), 14);
        assert!(stack.graph.validate().is_ok());
    }

    #[test]
    fn test_parts_cover_every_node_once() {
        let stack = stack();
        let parts = stack.ids.parts();
        let distinct: std::collections::BTreeSet<_> = parts.iter().map(|(_, id)| *id).collect();
        assert_eq!(distinct.len(), stack.graph.len());
        for (part, id) in parts {
            assert!(stack.graph.get(id).is_some(), "{} ({}) is not in the graph", part, id);
        }
    }

    #[test]
    fn test_mandated_ordering() {
        let stack = stack();
        let g = &stack.graph;
        let ids = &stack.ids;
        let chain = [
            &ids.registry,
            &ids.image_asset,
            &ids.image_deployment,
            &ids.container,
            &ids.workload,
            &ids.service,
        ];
        for pair in chain.windows(2) {
            assert!(g.is_ordered_after(pair[1], pair[0]), "{} after {}", pair[1], pair[0]);
        }
        for dependent in [&ids.cluster, &ids.load_balancer, &ids.service] {
            assert!(g.is_ordered_after(dependent, &ids.network));
        }
        for role in [&ids.execution_role, &ids.task_role] {
            assert!(g.is_ordered_after(&ids.workload, role));
        }
        assert!(g.is_ordered_after(&ids.container, &ids.log_sink));
        assert!(g.is_ordered_after(&ids.service, &ids.listener));
    }

    #[test]
    fn test_workload_cannot_reference_image_before_copy() {
        let stack = stack();
        let mut graph = ResourceGraph::new();
        // Rebuild the graph with the container spec ordered only after the log sink
        for id in stack.graph.topological_order().unwrap() {
            let node = stack.graph.get(&id).unwrap().clone();
            let deps: Vec<ResourceId> = if id == stack.ids.container {
                vec![stack.ids.log_sink.clone()]
            } else {
                node.depends_on.into_iter().collect()
            };
            graph.add(node.resource, deps).unwrap();
        }
        match graph.validate() {
            Err(ProvisionError::UnorderedReference { resource, .. }) => {
                assert_eq!(resource, stack.ids.container);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_task_role_scoped_to_resolved_parameter() {
        let env = ContainerEnvironment::resolve(|key| {
            (key == "API_KEY_PARAM_NAME").then(|| "/gateway/prod/ApiKey".to_string())
        })
        .unwrap();
        let stack = GatewayStack::build(&Settings::default(), env).unwrap();
        let task = stack.role(&stack.ids.task_role).unwrap();
        assert!(task.is_allowed(
            "ssm:GetParameter",
            "arn:aws:ssm:us-east-1:123456789012:parameter/gateway/prod/ApiKey"
        ));
        assert!(!task.is_allowed(
            "ssm:GetParameter",
            "arn:aws:ssm:us-east-1:123456789012:parameter/bedrock-api/BedrockProxyAPIKey"
        ));
    }

    #[test]
    fn test_container_carries_environment() {
        let stack = stack();
        match stack.graph.resource(&stack.ids.container) {
            Some(Resource::ContainerSpec(c)) => {
                assert_eq!(c.environment, ContainerEnvironment::defaults().to_map());
                assert_eq!(c.image.to_string(), "bedrock-proxy-api-ecs:latest");
                assert_eq!(c.log.stream_prefix, "cursor-gateway-logs");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_base_url_output() {
        let stack = stack();
        let mut lb = ResourceOutputs::new();
        lb.insert(
            OUTPUT_DNS_NAME.to_string(),
            "bedrock-cursor-proxy-123.us-east-1.elb.amazonaws.com".to_string(),
        );
        let outputs = stack.stack_outputs(Some(&lb));
        assert_eq!(
            outputs[OUTPUT_API_BASE_URL],
            "http://bedrock-cursor-proxy-123.us-east-1.elb.amazonaws.com/api/v1"
        );
        assert!(stack.stack_outputs(None).is_empty());
    }

    #[test]
    fn test_review_findings_surface_model_wildcards() {
        let findings = stack().review_findings();
        assert!(findings
            .iter()
            .any(|f| f.resource == iam::FOUNDATION_MODEL_ARN_PATTERN));
    }
}
