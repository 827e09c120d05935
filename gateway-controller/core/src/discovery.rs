use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::Result;
use std::collections::{btree_map, BTreeMap};

/// Models the read-only side of a service registry.
///
/// Implementations are expected to return registry-side health-filtered instances; callers
/// re-filter by health and mesh eligibility before routing to them.
#[async_trait::async_trait]
pub trait DiscoverRegistry {
    async fn list_services(&self) -> Result<Vec<String>>;

    async fn list_healthy_instances(&self, service: &str) -> Result<Vec<ServiceInstance>>;
}

/// A single backend instance as reported by the registry during one poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInstance {
    pub service_name: String,
    pub id: String,
    pub node: String,
    pub address: String,
    pub port: u16,
    pub healthy: bool,
    pub tags: HashSet<String>,
    pub metadata: HashMap<String, String>,
}

/// The eligible instances of every routable service, as of a single successful poll.
///
/// Services are kept in name order so that synthesized snapshots are deterministic. A service
/// with no eligible instances never appears in the set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoverySet {
    services: BTreeMap<String, Vec<ServiceInstance>>,
}

// === impl ServiceInstance ===

impl ServiceInstance {
    /// An instance may be routed to iff it passes its health checks and carries the mesh tag.
    pub fn is_eligible(&self, mesh_tag: &str) -> bool {
        self.healthy && self.tags.contains(mesh_tag)
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

// === impl DiscoverySet ===

impl DiscoverySet {
    /// Records the eligible subset of a service's instances.
    ///
    /// Returns the number of instances retained. When none are eligible the service is omitted
    /// entirely, so that it produces no routes in the next snapshot.
    pub fn insert_eligible(
        &mut self,
        service: impl Into<String>,
        instances: impl IntoIterator<Item = ServiceInstance>,
        mesh_tag: &str,
    ) -> usize {
        let eligible = instances
            .into_iter()
            .filter(|i| i.is_eligible(mesh_tag))
            .collect::<Vec<_>>();
        let count = eligible.len();
        if count > 0 {
            self.services.insert(service.into(), eligible);
        }
        count
    }

    pub fn get(&self, service: &str) -> Option<&[ServiceInstance]> {
        self.services.get(service).map(Vec::as_slice)
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Vec<ServiceInstance>> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn instance_count(&self) -> usize {
        self.services.values().map(Vec::len).sum()
    }
}

impl<'a> IntoIterator for &'a DiscoverySet {
    type Item = (&'a String, &'a Vec<ServiceInstance>);
    type IntoIter = btree_map::Iter<'a, String, Vec<ServiceInstance>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
