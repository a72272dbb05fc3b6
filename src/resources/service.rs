use serde::{Deserialize, Serialize};

use super::{ResourceId, ResourceKind};
use crate::error::{ProvisionError, ProvisionResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityProviderStrategy {
    pub capacity_provider: String,
    pub weight: u32,
    #[serde(default)]
    pub base: u32,
}

/// Bounds on how many instances may run while the service replaces instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfiguration {
    pub minimum_healthy_percent: u32,
    pub maximum_percent: u32,
}

impl Default for DeploymentConfiguration {
    fn default() -> Self {
        Self {
            minimum_healthy_percent: 100,
            maximum_percent: 200,
        }
    }
}

impl DeploymentConfiguration {
    /// Lower bound on in-service instances during a rollout
    pub fn min_in_service(&self, desired: u32) -> u32 {
        let bound = (desired as u64 * self.minimum_healthy_percent as u64).div_ceil(100);
        u32::try_from(bound).unwrap_or(u32::MAX)
    }

    /// Upper bound on live (not draining) instances during a rollout
    pub fn max_live(&self, desired: u32) -> u32 {
        let bound = u32::try_from(desired as u64 * self.maximum_percent as u64 / 100)
            .unwrap_or(u32::MAX);
        // At least one extra instance, or a rollout with min 100% could never start
        bound.max(desired.saturating_add(1))
    }
}

/// Where the service registers its instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerBinding {
    pub target_group: ResourceId,
    pub listener: ResourceId,
    pub container_name: String,
    pub container_port: u16,
}

/// Long-running service keeping N instances of a workload definition alive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedService {
    pub id: ResourceId,
    pub name: String,
    pub cluster: ResourceId,
    pub workload_definition: ResourceId,
    pub network: ResourceId,
    pub desired_count: u32,
    pub capacity_provider_strategy: Vec<CapacityProviderStrategy>,
    pub health_check_grace_period_secs: u64,
    pub assign_public_ip: bool,
    pub deployment: DeploymentConfiguration,
    pub load_balancer: LoadBalancerBinding,
}

impl ManagedService {
    pub fn new(
        id: &str,
        cluster: &ResourceId,
        workload_definition: &ResourceId,
        network: &ResourceId,
        load_balancer: LoadBalancerBinding,
    ) -> Self {
        Self {
            id: ResourceId::new(ResourceKind::Service, id),
            name: id.to_string(),
            cluster: cluster.clone(),
            workload_definition: workload_definition.clone(),
            network: network.clone(),
            desired_count: 1,
            capacity_provider_strategy: vec![CapacityProviderStrategy {
                capacity_provider: "FARGATE".to_string(),
                weight: 1,
                base: 0,
            }],
            health_check_grace_period_secs: 60,
            assign_public_ip: true,
            deployment: DeploymentConfiguration::default(),
            load_balancer,
        }
    }

    pub fn references(&self) -> Vec<ResourceId> {
        vec![
            self.cluster.clone(),
            self.workload_definition.clone(),
            self.network.clone(),
            self.load_balancer.target_group.clone(),
            self.load_balancer.listener.clone(),
        ]
    }

    pub fn validate(&self) -> ProvisionResult<()> {
        let invalid = |message: &str| ProvisionError::Validation {
            resource: self.id.clone(),
            message: message.to_string(),
        };
        if self.desired_count == 0 {
            return Err(invalid("desired count must be at least 1"));
        }
        if self.capacity_provider_strategy.is_empty()
            || self
                .capacity_provider_strategy
                .iter()
                .all(|s| s.weight == 0)
        {
            return Err(invalid("capacity provider strategy needs a non-zero weight"));
        }
        if self.deployment.minimum_healthy_percent > 100 || self.deployment.maximum_percent < 100 {
            return Err(invalid(
                "deployment bounds require minimum_healthy_percent <= 100 <= maximum_percent",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_bounds() {
        let cfg = DeploymentConfiguration::default();
        assert_eq!(cfg.min_in_service(1), 1);
        assert_eq!(cfg.max_live(1), 2);
        assert_eq!(cfg.max_live(3), 6);

        let tight = DeploymentConfiguration {
            minimum_healthy_percent: 50,
            maximum_percent: 100,
        };
        assert_eq!(tight.min_in_service(3), 2);
        assert_eq!(tight.max_live(3), 4);
    }

    #[test]
    fn test_deployment_bounds_do_not_overflow() {
        let wide = DeploymentConfiguration {
            minimum_healthy_percent: u32::MAX,
            maximum_percent: u32::MAX,
        };
        assert_eq!(wide.max_live(u32::MAX), u32::MAX);
        assert_eq!(wide.min_in_service(u32::MAX), u32::MAX);
        assert_eq!(wide.max_live(100), u32::MAX);
    }
}
