// Recorded stack state
//
// What the last provisioning run actually created: physical ids, the
// effective fingerprint each resource was created with, and its outputs.
// Persisted as JSON under the state directory.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::resources::{RemovalPolicy, ResourceId, ResourceOutputs};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub physical_id: String,
    /// Fingerprint of the descriptor plus its resolved inputs
    pub fingerprint: String,
    #[serde(default)]
    pub outputs: ResourceOutputs,
    pub removal_policy: RemovalPolicy,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    pub stack_name: String,
    #[serde(default)]
    pub resources: BTreeMap<ResourceId, ResourceState>,
}

impl StackState {
    pub fn new(stack_name: &str) -> Self {
        Self {
            stack_name: stack_name.to_string(),
            resources: BTreeMap::new(),
        }
    }

    /// Load state from `path`, or start empty if the file does not exist
    pub fn load(path: &Path, stack_name: &str) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(stack_name));
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read stack state {}", path.display()))?;
        let state: StackState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse stack state {}", path.display()))?;
        if state.stack_name != stack_name {
            anyhow::bail!(
                "State file {} belongs to stack '{}', not '{}'",
                path.display(),
                state.stack_name,
                stack_name
            );
        }
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize stack state")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write stack state {}", path.display()))
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceState> {
        self.resources.get(id)
    }

    pub fn outputs(&self, id: &ResourceId) -> Option<&ResourceOutputs> {
        self.resources.get(id).map(|r| &r.outputs)
    }

    pub fn record(
        &mut self,
        id: &ResourceId,
        physical_id: String,
        fingerprint: String,
        outputs: ResourceOutputs,
        removal_policy: RemovalPolicy,
    ) {
        self.resources.insert(
            id.clone(),
            ResourceState {
                physical_id,
                fingerprint,
                outputs,
                removal_policy,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn forget(&mut self, id: &ResourceId) -> Option<ResourceState> {
        self.resources.remove(id)
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceKind;
    use tempfile::TempDir;

    #[test]
    fn test_state_round_trips_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/state.json");
        let id = ResourceId::new(ResourceKind::Cluster, "proxy-cluster");

        let mut state = StackState::new("BedrockProxyFargateStack");
        let mut outputs = ResourceOutputs::new();
        outputs.insert("cluster_name".into(), "proxy-cluster".into());
        state.record(
            &id,
            "proxy-cluster".into(),
            "abc".into(),
            outputs,
            RemovalPolicy::Destroy,
        );
        state.save(&path).unwrap();

        let loaded = StackState::load(&path, "BedrockProxyFargateStack").unwrap();
        assert_eq!(loaded, state);
        assert_eq!(
            loaded.outputs(&id).unwrap()["cluster_name"],
            "proxy-cluster"
        );
    }

    #[test]
    fn test_missing_file_is_empty_state() {
        let dir = TempDir::new().unwrap();
        let state = StackState::load(&dir.path().join("state.json"), "s").unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn test_state_of_another_stack_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        StackState::new("other").save(&path).unwrap();
        assert!(StackState::load(&path, "mine").is_err());
    }
}
