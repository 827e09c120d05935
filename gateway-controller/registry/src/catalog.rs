use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use gateway_controller_core::ServiceInstance;
use serde::Deserialize;
use std::collections::BTreeMap;

/// The check status Consul reports for a passing check.
const PASSING: &str = "passing";

/// `GET /v1/catalog/services`: service names mapped to the union of their tags.
pub(crate) type CatalogServices = BTreeMap<String, Option<Vec<String>>>;

/// One element of `GET /v1/health/service/:service`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct HealthEntry {
    pub node: Node,
    pub service: AgentService,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct Node {
    pub node: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub meta: Option<HashMap<String, String>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct HealthCheck {
    #[serde(default)]
    pub name: String,
    pub status: String,
}

// === impl HealthEntry ===

impl From<HealthEntry> for ServiceInstance {
    fn from(entry: HealthEntry) -> Self {
        let HealthEntry {
            node,
            service,
            checks,
        } = entry;

        let healthy = checks.iter().all(|c| c.status == PASSING);
        if !healthy {
            tracing::trace!(
                service = %service.service,
                id = %service.id,
                failing = ?checks.iter().filter(|c| c.status != PASSING).map(|c| &c.name).collect::<Vec<_>>(),
                "instance is not passing"
            );
        }

        // Services registered without an explicit address are reachable at their node's.
        let address = if service.address.is_empty() {
            node.address
        } else {
            service.address
        };

        ServiceInstance {
            service_name: service.service,
            id: service.id,
            node: node.node,
            address,
            port: service.port,
            healthy,
            tags: service.tags.into_iter().flatten().collect::<HashSet<_>>(),
            metadata: service.meta.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEALTH: &str = r#"[
        {
            "Node": { "Node": "node-a", "Address": "10.0.0.5" },
            "Service": {
                "ID": "user-service-10.0.0.7:80",
                "Service": "user-service",
                "Tags": ["dapr", "api"],
                "Address": "10.0.0.7",
                "Port": 80,
                "Meta": { "version": "1.4.0", "environment": "prod" }
            },
            "Checks": [
                { "Name": "Serf Health Status", "Status": "passing" },
                { "Name": "Service check", "Status": "passing" }
            ]
        },
        {
            "Node": { "Node": "node-b", "Address": "10.0.0.6" },
            "Service": {
                "ID": "user-service-2",
                "Service": "user-service",
                "Tags": null,
                "Address": "",
                "Port": 8080,
                "Meta": null
            },
            "Checks": [
                { "Name": "Service check", "Status": "critical" }
            ]
        }
    ]"#;

    #[test]
    fn decodes_health_entries() {
        let entries: Vec<HealthEntry> = serde_json::from_str(HEALTH).unwrap();
        let instances = entries
            .into_iter()
            .map(ServiceInstance::from)
            .collect::<Vec<_>>();

        let first = &instances[0];
        assert_eq!(first.service_name, "user-service");
        assert_eq!(first.address, "10.0.0.7");
        assert_eq!(first.port, 80);
        assert!(first.healthy);
        assert!(first.tags.contains("dapr"));
        assert_eq!(first.metadata("version"), Some("1.4.0"));

        let second = &instances[1];
        assert_eq!(second.address, "10.0.0.6", "falls back to the node address");
        assert!(!second.healthy);
        assert!(second.tags.is_empty());
        assert!(second.metadata.is_empty());
    }

    #[test]
    fn decodes_catalog_services() {
        let json = r#"{ "consul": [], "user-service": ["dapr"], "legacy": null }"#;
        let services: CatalogServices = serde_json::from_str(json).unwrap();
        assert_eq!(
            services.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["consul", "legacy", "user-service"]
        );
    }
}
