//! Dependency graph of resource descriptors
//!
//! Each node carries the explicit ordering edges it was declared with. The
//! graph checks that every resource a descriptor references is also ordered
//! before it, then yields a deterministic topological order grouped into
//! waves: nodes within one wave have no path between them and may be created
//! concurrently.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{ProvisionError, ProvisionResult};
use crate::resources::{Resource, ResourceId};

/// A resource plus the resources it must be created after
#[derive(Debug, Clone)]
pub struct Node {
    pub resource: Resource,
    pub depends_on: BTreeSet<ResourceId>,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: BTreeMap<ResourceId, Node>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource with its explicit dependencies
    pub fn add(
        &mut self,
        resource: Resource,
        depends_on: impl IntoIterator<Item = ResourceId>,
    ) -> ProvisionResult<()> {
        let id = resource.id().clone();
        if self.nodes.contains_key(&id) {
            return Err(ProvisionError::DuplicateResource(id));
        }
        self.nodes.insert(
            id,
            Node {
                resource,
                depends_on: depends_on.into_iter().collect(),
            },
        );
        Ok(())
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn resource(&self, id: &ResourceId) -> Option<&Resource> {
        self.nodes.get(id).map(|n| &n.resource)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.nodes.values().map(|n| &n.resource)
    }

    /// Full structural validation: unknown dependencies, cycles, and
    /// references that are not ordered after what they reference
    pub fn validate(&self) -> ProvisionResult<()> {
        for (id, node) in &self.nodes {
            for dep in &node.depends_on {
                if !self.nodes.contains_key(dep) {
                    return Err(ProvisionError::UnknownDependency {
                        resource: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Fails on cycles
        self.topological_order()?;

        for (id, node) in &self.nodes {
            let ancestors = self.ancestors(id);
            for referenced in node.resource.references() {
                if !self.nodes.contains_key(&referenced) {
                    return Err(ProvisionError::UnknownDependency {
                        resource: id.clone(),
                        dependency: referenced,
                    });
                }
                if !ancestors.contains(&referenced) {
                    return Err(ProvisionError::UnorderedReference {
                        resource: id.clone(),
                        referenced,
                    });
                }
            }
        }

        Ok(())
    }

    /// True if `later` is (transitively) ordered after `earlier`
    #[cfg(test)]
    pub fn is_ordered_after(&self, later: &ResourceId, earlier: &ResourceId) -> bool {
        self.ancestors(later).contains(earlier)
    }

    /// Every resource `id` transitively depends on
    pub fn ancestors(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&ResourceId> = VecDeque::new();
        if let Some(node) = self.nodes.get(id) {
            queue.extend(node.depends_on.iter());
        }
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(current) {
                queue.extend(node.depends_on.iter());
            }
        }
        seen
    }

    /// Every resource that transitively depends on `id`
    #[cfg(test)]
    pub fn dependents(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        self.nodes
            .keys()
            .filter(|other| self.ancestors(other).contains(id))
            .cloned()
            .collect()
    }

    /// Kahn's algorithm over sorted ids, so the order is stable run to run
    pub fn topological_order(&self) -> ProvisionResult<Vec<ResourceId>> {
        Ok(self.waves()?.into_iter().flatten().collect())
    }

    /// Group nodes into creation waves; wave N only depends on waves < N
    pub fn waves(&self) -> ProvisionResult<Vec<Vec<ResourceId>>> {
        let mut remaining: BTreeMap<&ResourceId, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&ResourceId, Vec<&ResourceId>> = BTreeMap::new();

        for (id, node) in &self.nodes {
            let known: Vec<&ResourceId> = node
                .depends_on
                .iter()
                .filter(|d| self.nodes.contains_key(*d))
                .collect();
            remaining.insert(id, known.len());
            for dep in known {
                dependents.entry(dep).or_default().push(id);
            }
        }

        let mut waves = Vec::new();
        let mut ready: Vec<&ResourceId> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut placed = 0usize;

        while !ready.is_empty() {
            ready.sort();
            let mut next = Vec::new();
            for id in &ready {
                if let Some(children) = dependents.get(id) {
                    for child in children {
                        if let Some(count) = remaining.get_mut(child) {
                            *count -= 1;
                            if *count == 0 {
                                next.push(*child);
                            }
                        }
                    }
                }
            }
            placed += ready.len();
            waves.push(ready.iter().map(|id| (*id).clone()).collect());
            ready = next;
        }

        if placed != self.nodes.len() {
            let stuck: Vec<ResourceId> = remaining
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .map(|(id, _)| id.clone())
                .collect();
            return Err(ProvisionError::CyclicDependency(stuck));
        }

        Ok(waves)
    }

    /// Teardown order: dependents before their dependencies
    pub fn reverse_order(&self) -> ProvisionResult<Vec<ResourceId>> {
        let mut order = self.topological_order()?;
        order.reverse();
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::image::{ImageAsset, ImageDeployment};
    use crate::resources::{Cluster, LogSink, NetworkFabric, RegistryRepository, ResourceKind};

    fn network() -> Resource {
        Resource::Network(NetworkFabric::public(
            "vpc",
            "10.250.0.0/16".parse().unwrap(),
            2,
            24,
        ))
    }

    fn id(kind: ResourceKind, name: &str) -> ResourceId {
        ResourceId::new(kind, name)
    }

    #[test]
    fn test_waves_group_independent_nodes() {
        let mut graph = ResourceGraph::new();
        let vpc = id(ResourceKind::Network, "vpc");
        graph.add(network(), []).unwrap();
        graph
            .add(Resource::Cluster(Cluster::new("cluster", &vpc)), [vpc.clone()])
            .unwrap();
        graph
            .add(Resource::LogSink(LogSink::new("logs", "gateway-logs")), [])
            .unwrap();

        let waves = graph.waves().unwrap();
        assert_eq!(waves.len(), 2);
        assert_eq!(
            waves[0],
            vec![id(ResourceKind::Network, "vpc"), id(ResourceKind::LogSink, "logs")]
        );
        assert_eq!(waves[1], vec![id(ResourceKind::Cluster, "cluster")]);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_reference_without_ordering_fails_validation() {
        let mut graph = ResourceGraph::new();
        graph.add(network(), []).unwrap();
        let vpc = id(ResourceKind::Network, "vpc");
        // Cluster references the network but declares no edge
        graph
            .add(Resource::Cluster(Cluster::new("cluster", &vpc)), [])
            .unwrap();
        match graph.validate() {
            Err(ProvisionError::UnorderedReference {
                resource,
                referenced,
            }) => {
                assert_eq!(resource, id(ResourceKind::Cluster, "cluster"));
                assert_eq!(referenced, vpc);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_transitive_ordering_satisfies_reference() {
        let mut graph = ResourceGraph::new();
        let registry = RegistryRepository::new("repo", "bedrock-proxy-api-ecs", 10);
        let asset = ImageAsset::new("asset", "src", "Dockerfile");
        let copy = ImageDeployment::new("copy", &asset.id, &registry.id, "latest");
        let registry_id = registry.id.clone();
        let asset_id = asset.id.clone();
        graph.add(Resource::Registry(registry), []).unwrap();
        graph
            .add(Resource::ImageAsset(asset), [registry_id.clone()])
            .unwrap();
        // Only ordered after the asset, which itself is after the registry
        graph
            .add(Resource::ImageDeployment(copy), [asset_id])
            .unwrap();
        assert!(graph.validate().is_ok());
        assert!(graph.is_ordered_after(&id(ResourceKind::ImageDeployment, "copy"), &registry_id));
    }

    #[test]
    fn test_cycle_detected() {
        let mut graph = ResourceGraph::new();
        let a = id(ResourceKind::LogSink, "a");
        let b = id(ResourceKind::LogSink, "b");
        graph
            .add(Resource::LogSink(LogSink::new("a", "a")), [b.clone()])
            .unwrap();
        graph
            .add(Resource::LogSink(LogSink::new("b", "b")), [a.clone()])
            .unwrap();
        match graph.topological_order() {
            Err(ProvisionError::CyclicDependency(members)) => {
                assert_eq!(members, vec![a, b]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let mut graph = ResourceGraph::new();
        graph
            .add(
                Resource::LogSink(LogSink::new("a", "a")),
                [id(ResourceKind::Network, "missing")],
            )
            .unwrap();
        assert!(matches!(
            graph.validate(),
            Err(ProvisionError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut graph = ResourceGraph::new();
        graph.add(network(), []).unwrap();
        assert!(matches!(
            graph.add(network(), []),
            Err(ProvisionError::DuplicateResource(_))
        ));
    }

    #[test]
    fn test_reverse_order_puts_dependents_first() {
        let mut graph = ResourceGraph::new();
        let vpc = id(ResourceKind::Network, "vpc");
        graph.add(network(), []).unwrap();
        graph
            .add(Resource::Cluster(Cluster::new("cluster", &vpc)), [vpc.clone()])
            .unwrap();
        let order = graph.reverse_order().unwrap();
        assert_eq!(order[0], id(ResourceKind::Cluster, "cluster"));
        assert_eq!(order[1], vpc);
        assert_eq!(
            graph.dependents(&vpc).into_iter().collect::<Vec<_>>(),
            vec![id(ResourceKind::Cluster, "cluster")]
        );
    }
}
