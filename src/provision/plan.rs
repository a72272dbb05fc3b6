// Change planning
//
// Compares the desired graph with recorded state. A resource whose effective
// fingerprint moved gets an update, versioned resources get a replacement, and
// anything downstream of a pending change is assumed to change too until the
// apply run sees the real outputs.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::state::StackState;
use crate::cloud::ResolvedInputs;
use crate::error::ProvisionResult;
use crate::graph::ResourceGraph;
use crate::resources::{Resource, ResourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    /// Register a new immutable version
    Replace,
    Unchanged,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::Update => write!(f, "update"),
            Action::Replace => write!(f, "replace"),
            Action::Unchanged => write!(f, "unchanged"),
            Action::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedChange {
    pub id: ResourceId,
    pub action: Action,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Plan {
    pub changes: Vec<PlannedChange>,
}

impl Plan {
    /// Plan the graph against recorded state.
    ///
    /// `extras` holds additional fingerprint material per resource, such as
    /// the content digest of an image build context.
    pub fn compute(
        graph: &ResourceGraph,
        state: &StackState,
        extras: &BTreeMap<ResourceId, String>,
    ) -> ProvisionResult<Self> {
        let mut changes = Vec::new();
        let mut changing: BTreeSet<ResourceId> = BTreeSet::new();

        for id in graph.topological_order()? {
            let Some(resource) = graph.resource(&id) else {
                continue;
            };
            let (action, reason) = match state.get(&id) {
                None => (Action::Create, "not yet created".to_string()),
                Some(recorded) => {
                    let references = resource.references();
                    if let Some(upstream) = references.iter().find(|r| changing.contains(*r)) {
                        (change_action(resource), format!("{} changes", upstream))
                    } else {
                        let inputs = resolve_inputs(resource, state);
                        let fingerprint = effective_fingerprint(
                            resource,
                            &inputs,
                            extras.get(&id).map(|s| s.as_str()),
                        );
                        if fingerprint == recorded.fingerprint {
                            (Action::Unchanged, String::new())
                        } else {
                            (change_action(resource), "configuration changed".to_string())
                        }
                    }
                }
            };
            if action != Action::Unchanged {
                changing.insert(id.clone());
            }
            changes.push(PlannedChange { id, action, reason });
        }

        for id in state.resources.keys() {
            if graph.get(id).is_none() {
                changes.push(PlannedChange {
                    id: id.clone(),
                    action: Action::Delete,
                    reason: "no longer part of the stack".to_string(),
                });
            }
        }

        Ok(Self { changes })
    }

    pub fn change(&self, id: &ResourceId) -> Option<&PlannedChange> {
        self.changes.iter().find(|c| &c.id == id)
    }

    #[cfg(test)]
    pub fn action(&self, id: &ResourceId) -> Option<Action> {
        self.change(id).map(|c| c.action)
    }

    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(|c| c.action != Action::Unchanged)
    }

    /// Number of changes per action
    pub fn summary(&self) -> BTreeMap<String, usize> {
        let mut summary = BTreeMap::new();
        for change in &self.changes {
            *summary.entry(change.action.to_string()).or_insert(0) += 1;
        }
        summary
    }
}

fn change_action(resource: &Resource) -> Action {
    if resource.is_versioned() {
        Action::Replace
    } else {
        Action::Update
    }
}

/// Recorded outputs of everything `resource` references
pub fn resolve_inputs(resource: &Resource, state: &StackState) -> ResolvedInputs {
    resource
        .references()
        .into_iter()
        .filter_map(|r| state.outputs(&r).map(|o| (r, o.clone())))
        .collect()
}

/// Hash of the descriptor together with the inputs it was resolved against
pub fn effective_fingerprint(
    resource: &Resource,
    inputs: &ResolvedInputs,
    extra: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(resource.fingerprint().as_bytes());
    for (id, outputs) in inputs {
        hasher.update(id.to_string().as_bytes());
        hasher.update([0u8]);
        for (key, value) in outputs {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
    }
    if let Some(extra) = extra {
        hasher.update(b"extra\0");
        hasher.update(extra.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{
        Cluster, NetworkFabric, RemovalPolicy, ResourceKind, ResourceOutputs,
    };

    fn graph() -> ResourceGraph {
        let mut graph = ResourceGraph::new();
        let network = NetworkFabric::public("vpc", "10.0.0.0/16".parse().unwrap(), 2, 24);
        let network_id = network.id.clone();
        graph.add(Resource::Network(network), []).unwrap();
        graph
            .add(
                Resource::Cluster(Cluster::new("proxy-cluster", &network_id)),
                [network_id],
            )
            .unwrap();
        graph
    }

    fn outputs(pairs: &[(&str, &str)]) -> ResourceOutputs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// State as if every resource had been created against the given outputs
    fn applied(graph: &ResourceGraph, network_outputs: ResourceOutputs) -> StackState {
        let mut state = StackState::new("test");
        for id in graph.topological_order().unwrap() {
            let resource = graph.resource(&id).unwrap();
            let inputs = resolve_inputs(resource, &state);
            let fingerprint = effective_fingerprint(resource, &inputs, None);
            let out = if id.kind() == ResourceKind::Network {
                network_outputs.clone()
            } else {
                outputs(&[("cluster_name", "proxy-cluster")])
            };
            state.record(&id, id.name().into(), fingerprint, out, RemovalPolicy::Destroy);
        }
        state
    }

    #[test]
    fn test_empty_state_creates_everything() {
        let graph = graph();
        let plan = Plan::compute(&graph, &StackState::new("test"), &BTreeMap::new()).unwrap();
        assert!(plan.changes.iter().all(|c| c.action == Action::Create));
        assert_eq!(plan.summary()["create"], 2);
    }

    #[test]
    fn test_applied_state_is_unchanged() {
        let graph = graph();
        let state = applied(&graph, outputs(&[("vpc_id", "vpc-1")]));
        let plan = Plan::compute(&graph, &state, &BTreeMap::new()).unwrap();
        assert!(!plan.has_changes());
    }

    #[test]
    fn test_changed_input_propagates_downstream() {
        let graph = graph();
        let mut state = applied(&graph, outputs(&[("vpc_id", "vpc-1")]));
        let network_id = ResourceId::new(ResourceKind::Network, "vpc");
        state.resources.get_mut(&network_id).unwrap().fingerprint = "stale".into();

        let plan = Plan::compute(&graph, &state, &BTreeMap::new()).unwrap();
        assert_eq!(plan.action(&network_id), Some(Action::Update));
        let cluster = plan
            .changes
            .iter()
            .find(|c| c.id.kind() == ResourceKind::Cluster)
            .unwrap();
        assert_eq!(cluster.action, Action::Update);
        assert!(cluster.reason.contains("network/vpc"));
    }

    #[test]
    fn test_extra_material_changes_fingerprint() {
        let graph = graph();
        let state = applied(&graph, outputs(&[("vpc_id", "vpc-1")]));
        let network_id = ResourceId::new(ResourceKind::Network, "vpc");
        let mut extras = BTreeMap::new();
        extras.insert(network_id.clone(), "digest".to_string());
        let plan = Plan::compute(&graph, &state, &extras).unwrap();
        assert_eq!(plan.action(&network_id), Some(Action::Update));
    }

    #[test]
    fn test_recorded_resource_outside_graph_is_deleted() {
        let graph = graph();
        let mut state = applied(&graph, outputs(&[("vpc_id", "vpc-1")]));
        let stray = ResourceId::new(ResourceKind::Role, "old-role");
        state.record(
            &stray,
            "old-role".into(),
            "x".into(),
            ResourceOutputs::new(),
            RemovalPolicy::Destroy,
        );
        let plan = Plan::compute(&graph, &state, &BTreeMap::new()).unwrap();
        assert_eq!(plan.action(&stray), Some(Action::Delete));
    }
}
