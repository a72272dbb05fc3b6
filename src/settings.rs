use config::{Config, ConfigError};
use serde::{Deserialize, Serialize};
use std::env;

use crate::resources::compute::{validate_task_size, CpuArchitecture};
use crate::resources::network::Ipv4Cidr;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub stack: StackSettings,
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub image: ImageSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub task: TaskSettings,
    #[serde(default)]
    pub load_balancer: LoadBalancerSettings,
    #[serde(default)]
    pub service: ServiceSettings,
    #[serde(default)]
    pub controller: ControllerSettings,
}

fn default_stack_name() -> String {
    "BedrockProxyFargateStack".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_account_id() -> String {
    "123456789012".to_string()
}

fn default_state_dir() -> String {
    ".gateway-stack".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StackSettings {
    #[serde(default = "default_stack_name")]
    pub name: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Account the ARNs are rendered for. With the `ecr` registry driver an
    /// empty value is resolved from the caller identity.
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Directory holding stack state and the local cloud inventory
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            name: default_stack_name(),
            region: default_region(),
            account_id: default_account_id(),
            state_dir: default_state_dir(),
        }
    }
}

/// Registry implementation used by the Image Publisher
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegistryDriver {
    /// Local registry persisted in the state directory
    Memory,
    /// Amazon ECR (requires the `aws` feature)
    Ecr,
}

fn default_repository_name() -> String {
    "bedrock-proxy-api-ecs".to_string()
}

fn default_max_image_count() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_image_tag() -> String {
    "latest".to_string()
}

fn default_registry_driver() -> RegistryDriver {
    RegistryDriver::Memory
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RegistrySettings {
    #[serde(default = "default_repository_name")]
    pub repository_name: String,
    /// Retention cap; older images beyond it are expired regardless of tag
    #[serde(default = "default_max_image_count")]
    pub max_image_count: u32,
    #[serde(default = "default_true")]
    pub scan_on_push: bool,
    /// Tag the workload deploys
    #[serde(default = "default_image_tag")]
    pub image_tag: String,
    #[serde(default = "default_registry_driver")]
    pub driver: RegistryDriver,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            repository_name: default_repository_name(),
            max_image_count: default_max_image_count(),
            scan_on_push: true,
            image_tag: default_image_tag(),
            driver: default_registry_driver(),
        }
    }
}

/// How the image asset is produced
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum BuilderKind {
    /// `docker build` / `podman build`
    Docker,
    /// No container CLI; the staged context digest is the image identity
    Static,
}

fn default_context_dir() -> String {
    "src".to_string()
}

fn default_build_file() -> String {
    "Dockerfile_cursor".to_string()
}

fn default_excludes() -> Vec<String> {
    vec![
        "node_modules".to_string(),
        ".git".to_string(),
        "cdk.out".to_string(),
    ]
}

fn default_platform() -> String {
    "linux/amd64".to_string()
}

fn default_builder() -> BuilderKind {
    BuilderKind::Docker
}

fn default_container_cli() -> String {
    "docker".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ImageSettings {
    #[serde(default = "default_context_dir")]
    pub context_dir: String,
    #[serde(default = "default_build_file")]
    pub build_file: String,
    #[serde(default = "default_excludes")]
    pub excludes: Vec<String>,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_builder")]
    pub builder: BuilderKind,
    #[serde(default = "default_container_cli")]
    pub container_cli: String,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            context_dir: default_context_dir(),
            build_file: default_build_file(),
            excludes: default_excludes(),
            platform: default_platform(),
            builder: default_builder(),
            container_cli: default_container_cli(),
        }
    }
}

fn default_cidr() -> String {
    "10.250.0.0/16".to_string()
}

fn default_max_zones() -> u32 {
    2
}

fn default_subnet_mask() -> u8 {
    24
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NetworkSettings {
    #[serde(default = "default_cidr")]
    pub cidr: String,
    #[serde(default = "default_max_zones")]
    pub max_zones: u32,
    #[serde(default = "default_subnet_mask")]
    pub subnet_mask: u8,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            cidr: default_cidr(),
            max_zones: default_max_zones(),
            subnet_mask: default_subnet_mask(),
        }
    }
}

fn default_cpu() -> u32 {
    1024
}

fn default_memory_mib() -> u32 {
    2048
}

fn default_architecture() -> CpuArchitecture {
    CpuArchitecture::X86_64
}

fn default_container_name() -> String {
    "cursor-gateway".to_string()
}

fn default_container_port() -> u16 {
    80
}

fn default_log_group_name() -> String {
    "cursor-gateway-logs".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TaskSettings {
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default = "default_memory_mib")]
    pub memory_mib: u32,
    #[serde(default = "default_architecture")]
    pub architecture: CpuArchitecture,
    #[serde(default = "default_container_name")]
    pub container_name: String,
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    #[serde(default = "default_log_group_name")]
    pub log_group_name: String,
    /// Stream prefix for the log driver (defaults to the log group name)
    #[serde(default)]
    pub log_stream_prefix: Option<String>,
    #[serde(default)]
    pub log_retention_days: Option<u32>,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory_mib: default_memory_mib(),
            architecture: default_architecture(),
            container_name: default_container_name(),
            container_port: default_container_port(),
            log_group_name: default_log_group_name(),
            log_stream_prefix: None,
            log_retention_days: None,
        }
    }
}

fn default_lb_name() -> String {
    "bedrock-cursor-proxy".to_string()
}

fn default_listener_port() -> u16 {
    80
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_health_check_timeout() -> u64 {
    5
}

fn default_healthy_threshold() -> u32 {
    5
}

fn default_unhealthy_threshold() -> u32 {
    2
}

fn default_deregistration_delay() -> u64 {
    300
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoadBalancerSettings {
    #[serde(default = "default_lb_name")]
    pub name: String,
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_secs: u64,
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_deregistration_delay")]
    pub deregistration_delay_secs: u64,
}

impl Default for LoadBalancerSettings {
    fn default() -> Self {
        Self {
            name: default_lb_name(),
            listener_port: default_listener_port(),
            health_check_path: default_health_check_path(),
            health_check_interval_secs: default_health_check_interval(),
            health_check_timeout_secs: default_health_check_timeout(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            deregistration_delay_secs: default_deregistration_delay(),
        }
    }
}

/// Tasks one service may run
const MAX_DESIRED_COUNT: u32 = 5000;

const MAX_MAXIMUM_PERCENT: u32 = 2000;

fn default_service_name() -> String {
    "ProxyApiService".to_string()
}

fn default_desired_count() -> u32 {
    1
}

fn default_grace_period() -> u64 {
    60
}

fn default_capacity_provider() -> String {
    "FARGATE".to_string()
}

fn default_capacity_provider_weight() -> u32 {
    1
}

fn default_minimum_healthy_percent() -> u32 {
    100
}

fn default_maximum_percent() -> u32 {
    200
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceSettings {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_desired_count")]
    pub desired_count: u32,
    #[serde(default = "default_grace_period")]
    pub health_check_grace_period_secs: u64,
    #[serde(default = "default_capacity_provider")]
    pub capacity_provider: String,
    #[serde(default = "default_capacity_provider_weight")]
    pub capacity_provider_weight: u32,
    #[serde(default = "default_true")]
    pub assign_public_ip: bool,
    #[serde(default = "default_minimum_healthy_percent")]
    pub minimum_healthy_percent: u32,
    #[serde(default = "default_maximum_percent")]
    pub maximum_percent: u32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            desired_count: default_desired_count(),
            health_check_grace_period_secs: default_grace_period(),
            capacity_provider: default_capacity_provider(),
            capacity_provider_weight: default_capacity_provider_weight(),
            assign_public_ip: true,
            minimum_healthy_percent: default_minimum_healthy_percent(),
            maximum_percent: default_maximum_percent(),
        }
    }
}

fn default_reconcile_interval_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_operation_timeout() -> u64 {
    600
}

fn default_convergence_timeout() -> u64 {
    900
}

fn default_time_scale() -> f64 {
    1.0
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ControllerSettings {
    /// Interval between service reconciliation passes (default: 1000ms)
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    /// Interval between polls of an in-flight backend operation (default: 500ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on waiting for a single resource to become ready (default: 600s)
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Upper bound on waiting for the service to converge after deploy (default: 900s)
    #[serde(default = "default_convergence_timeout")]
    pub convergence_timeout_secs: u64,

    /// Speed-up applied to the controller clock against the local cloud (default: 1.0)
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: default_reconcile_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            operation_timeout_secs: default_operation_timeout(),
            convergence_timeout_secs: default_convergence_timeout(),
            time_scale: default_time_scale(),
        }
    }
}

impl Settings {
    /// Substitute environment variables in a string value
    /// Replaces ${VAR_NAME} or ${VAR_NAME:-default} with environment variable values
    fn substitute_env_vars_in_string(s: &str) -> String {
        let re = match regex::Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
            Ok(re) => re,
            Err(_) => return s.to_string(),
        };

        re.replace_all(s, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str());

            match env::var(var_name) {
                Ok(val) => val,
                Err(_) => default_value.unwrap_or("").to_string(),
            }
        })
        .to_string()
    }

    /// Convert a config::Value to a serde_json::Value, performing environment variable substitution
    fn config_value_to_json(value: &config::Value) -> serde_json::Value {
        use config::ValueKind;

        match &value.kind {
            ValueKind::Nil => serde_json::Value::Null,
            ValueKind::Boolean(b) => serde_json::Value::Bool(*b),
            ValueKind::I64(i) => serde_json::Value::Number((*i).into()),
            ValueKind::I128(i) => serde_json::Value::Number((*i as i64).into()),
            ValueKind::U64(u) => serde_json::Value::Number((*u).into()),
            ValueKind::U128(u) => serde_json::Value::Number((*u as u64).into()),
            ValueKind::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueKind::String(s) => {
                serde_json::Value::String(Self::substitute_env_vars_in_string(s))
            }
            ValueKind::Table(table) => {
                let mut map = serde_json::Map::new();
                for (k, v) in table.iter() {
                    map.insert(k.clone(), Self::config_value_to_json(v));
                }
                serde_json::Value::Object(map)
            }
            ValueKind::Array(arr) => {
                let vec: Vec<serde_json::Value> =
                    arr.iter().map(Self::config_value_to_json).collect();
                serde_json::Value::Array(vec)
            }
        }
    }

    /// Try to add a config file with multiple extension attempts (.toml, .yaml, .yml)
    /// Returns true if a file was found
    fn try_add_config_file(
        builder: &mut config::ConfigBuilder<config::builder::DefaultState>,
        config_dir: &str,
        name: &str,
    ) -> bool {
        let extensions = ["toml", "yaml", "yml"];

        for ext in extensions {
            let path = format!("{}/{}.{}", config_dir, name, ext);
            if std::path::Path::new(&path).exists() {
                tracing::info!("Loading config file: {}", path);
                *builder = builder
                    .clone()
                    .add_source(config::File::with_name(&format!("{}/{}", config_dir, name)));
                return true;
            }
        }

        tracing::debug!(
            "Optional config file not found: {}/{}.{{toml,yaml,yml}}",
            config_dir,
            name
        );
        false
    }

    /// Load settings from `GATEWAY_CONFIG_DIR` (default `config`)
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = env::var("GATEWAY_CONFIG_DIR").unwrap_or_else(|_| "config".into());
        Self::load_from(&config_dir)
    }

    /// Load settings: built-in defaults, then `default`, `{run_mode}` and
    /// `local` files from `config_dir` (all optional), then `GATEWAY_*`
    /// environment variables
    pub fn load_from(config_dir: &str) -> Result<Self, ConfigError> {
        let run_mode =
            env::var("GATEWAY_CONFIG_RUN_MODE").unwrap_or_else(|_| "development".into());

        let mut builder = Config::builder();
        Self::try_add_config_file(&mut builder, config_dir, "default");
        Self::try_add_config_file(&mut builder, config_dir, &run_mode);
        Self::try_add_config_file(&mut builder, config_dir, "local");

        builder = builder.add_source(
            config::Environment::with_prefix("GATEWAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("image.excludes"),
        );

        let config = builder.build()?;

        let root_value = config
            .cache
            .into_table()
            .map_err(|e| ConfigError::Message(format!("Failed to get config table: {}", e)))?;

        // Drop the loader's own selector variables picked up by the environment source
        let mut json_map = serde_json::Map::new();
        for (k, v) in root_value.iter() {
            if k == "config_dir" || k == "config_run_mode" {
                continue;
            }
            json_map.insert(k.clone(), Self::config_value_to_json(v));
        }
        let json_value = serde_json::Value::Object(json_map);

        let mut unused_fields = Vec::new();
        let settings: Settings = serde_ignored::deserialize(json_value, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in &unused_fields {
            tracing::warn!("Unknown configuration field in stack config: {}", field);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings once, before anything is provisioned
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Message(msg));

        if self.stack.name.is_empty() {
            return fail("stack.name must not be empty".to_string());
        }
        if self.stack.region.is_empty() {
            return fail("stack.region must not be empty".to_string());
        }

        if self.registry.repository_name.is_empty() {
            return fail("registry.repository_name must not be empty".to_string());
        }
        if self.registry.max_image_count == 0 {
            return fail("registry.max_image_count must be at least 1".to_string());
        }
        if self.registry.image_tag.is_empty() {
            return fail("registry.image_tag must not be empty".to_string());
        }
        if self.registry.driver == RegistryDriver::Ecr && !cfg!(feature = "aws") {
            return fail(
                "registry.driver = \"ecr\" requires building with the `aws` feature".to_string(),
            );
        }

        let cidr: Ipv4Cidr = match self.network.cidr.parse() {
            Ok(cidr) => cidr,
            Err(e) => return fail(format!("network.cidr: {}", e)),
        };
        if self.network.max_zones == 0 {
            return fail("network.max_zones must be at least 1".to_string());
        }
        if self.network.subnet_mask < cidr.prefix() || self.network.subnet_mask > 28 {
            return fail(format!(
                "network.subnet_mask /{} must be between /{} and /28",
                self.network.subnet_mask,
                cidr.prefix()
            ));
        }
        if cidr.capacity(self.network.subnet_mask) < self.network.max_zones as u64 {
            return fail(format!(
                "network.cidr {} cannot hold {} /{} subnets",
                cidr, self.network.max_zones, self.network.subnet_mask
            ));
        }

        if let Err(e) = validate_task_size(self.task.cpu, self.task.memory_mib) {
            return fail(format!("task: {}", e));
        }
        if self.task.container_port == 0 {
            return fail("task.container_port must be non-zero".to_string());
        }

        if self.load_balancer.listener_port == 0 {
            return fail("load_balancer.listener_port must be non-zero".to_string());
        }
        if !self.load_balancer.health_check_path.starts_with('/') {
            return fail(format!(
                "load_balancer.health_check_path '{}' must start with '/'",
                self.load_balancer.health_check_path
            ));
        }

        if self.service.desired_count == 0 || self.service.desired_count > MAX_DESIRED_COUNT {
            return fail(format!(
                "service.desired_count must be between 1 and {}",
                MAX_DESIRED_COUNT
            ));
        }
        if self.service.maximum_percent > MAX_MAXIMUM_PERCENT {
            return fail(format!(
                "service.maximum_percent must be at most {}",
                MAX_MAXIMUM_PERCENT
            ));
        }
        if self.service.minimum_healthy_percent > 100 || self.service.maximum_percent < 100 {
            return fail(
                "service deployment bounds require minimum_healthy_percent <= 100 <= maximum_percent"
                    .to_string(),
            );
        }
        if self.service.capacity_provider_weight == 0 {
            return fail("service.capacity_provider_weight must be at least 1".to_string());
        }

        if self.controller.time_scale <= 0.0 {
            return fail("controller.time_scale must be positive".to_string());
        }

        Ok(())
    }

    /// Parsed network block (validated on load)
    pub fn network_cidr(&self) -> Result<Ipv4Cidr, ConfigError> {
        self.network
            .cidr
            .parse()
            .map_err(|e: String| ConfigError::Message(format!("network.cidr: {}", e)))
    }
}
