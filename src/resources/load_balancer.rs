use serde::{Deserialize, Serialize};

use super::{ResourceId, ResourceKind};
use crate::error::{ProvisionError, ProvisionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Http,
    Https,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

/// How targets are addressed in a target group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Ip,
    Instance,
}

/// Periodic GET request deciding traffic admission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub path: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Consecutive passes before a target is admitted
    pub healthy_threshold: u32,
    /// Consecutive failures before a target is taken out of rotation
    pub unhealthy_threshold: u32,
    pub success_codes: String,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            interval_secs: 30,
            timeout_secs: 5,
            healthy_threshold: 5,
            unhealthy_threshold: 2,
            success_codes: "200".to_string(),
        }
    }
}

/// Public load balancer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: ResourceId,
    pub name: String,
    pub internet_facing: bool,
    pub network: ResourceId,
}

impl LoadBalancer {
    pub fn new(id: &str, name: &str, network: &ResourceId) -> Self {
        Self {
            id: ResourceId::new(ResourceKind::LoadBalancer, id),
            name: name.to_string(),
            internet_facing: true,
            network: network.clone(),
        }
    }
}

/// Health-checked pool of endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub id: ResourceId,
    pub port: u16,
    pub protocol: Protocol,
    pub target_type: TargetType,
    pub health_check: HealthCheck,
    pub deregistration_delay_secs: u64,
    pub network: ResourceId,
}

impl TargetGroup {
    pub fn validate(&self) -> ProvisionResult<()> {
        let invalid = |message: String| ProvisionError::Validation {
            resource: self.id.clone(),
            message,
        };
        if self.port == 0 {
            return Err(invalid("target port must be non-zero".to_string()));
        }
        if !self.health_check.path.starts_with('/') {
            return Err(invalid(format!(
                "health check path '{}' must start with '/'",
                self.health_check.path
            )));
        }
        if self.health_check.healthy_threshold == 0 || self.health_check.unhealthy_threshold == 0 {
            return Err(invalid("health check thresholds must be at least 1".to_string()));
        }
        if self.health_check.timeout_secs >= self.health_check.interval_secs {
            return Err(invalid(
                "health check timeout must be shorter than the interval".to_string(),
            ));
        }
        Ok(())
    }
}

/// Listener binding a port on the load balancer to its default target group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listener {
    pub id: ResourceId,
    pub load_balancer: ResourceId,
    pub port: u16,
    pub protocol: Protocol,
    pub default_target_group: ResourceId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target_group() -> TargetGroup {
        TargetGroup {
            id: ResourceId::new(ResourceKind::TargetGroup, "tg"),
            port: 80,
            protocol: Protocol::Http,
            target_type: TargetType::Ip,
            health_check: HealthCheck {
                path: "/health".into(),
                ..Default::default()
            },
            deregistration_delay_secs: 300,
            network: ResourceId::new(ResourceKind::Network, "vpc"),
        }
    }

    #[test]
    fn test_valid_target_group() {
        assert!(target_group().validate().is_ok());
    }

    #[test]
    fn test_relative_health_path_rejected() {
        let mut tg = target_group();
        tg.health_check.path = "health".into();
        assert!(tg.validate().is_err());
    }

    #[test]
    fn test_timeout_must_be_below_interval() {
        let mut tg = target_group();
        tg.health_check.timeout_secs = 30;
        assert!(tg.validate().is_err());
    }
}
