use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one desired instance of the managed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Wanted, not yet placed
    Pending,
    /// Placed, waiting for the platform to report it running
    Provisioning,
    /// Running and registered, waiting out the grace period and first passing check
    HealthChecking,
    /// Receiving traffic
    InService,
    /// Deregistered, connections draining before the task is stopped
    Draining,
    Terminated,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Pending => write!(f, "PENDING"),
            InstanceState::Provisioning => write!(f, "PROVISIONING"),
            InstanceState::HealthChecking => write!(f, "HEALTH-CHECKING"),
            InstanceState::InService => write!(f, "IN-SERVICE"),
            InstanceState::Draining => write!(f, "DRAINING"),
            InstanceState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Check if an instance state is terminal (no further transitions allowed)
pub fn is_terminal(state: &InstanceState) -> bool {
    matches!(state, InstanceState::Terminated)
}

/// Live instances count toward the service's upper bound during a rollout
pub fn is_live(state: &InstanceState) -> bool {
    matches!(
        state,
        InstanceState::Pending
            | InstanceState::Provisioning
            | InstanceState::HealthChecking
            | InstanceState::InService
    )
}

/// Check if an instance is on its way out
pub fn is_terminal_bound(state: &InstanceState) -> bool {
    matches!(state, InstanceState::Draining | InstanceState::Terminated)
}

/// Check if a state transition is valid
pub fn is_valid_transition(from: &InstanceState, to: &InstanceState) -> bool {
    use InstanceState::*;

    match (from, to) {
        (from, _) if is_terminal(from) => false,

        // Start path
        (Pending, Provisioning) => true,
        (Provisioning, HealthChecking) => true,
        (HealthChecking, InService) => true,

        // Pending instances were never placed; nothing to drain
        (Pending, Terminated) => true,

        // Replacement and scale-in
        (Provisioning | HealthChecking | InService, Draining) => true,
        (Draining, Terminated) => true,

        // The platform stopped the task underneath us
        (Provisioning | HealthChecking | InService, Terminated) => true,

        _ => false,
    }
}

/// Validate a state transition and return an error if invalid
pub fn validate_transition(from: &InstanceState, to: &InstanceState) -> Result<()> {
    if !is_valid_transition(from, to) {
        bail!(
            "Invalid instance state transition from '{}' to '{}'",
            from,
            to
        );
    }
    Ok(())
}
