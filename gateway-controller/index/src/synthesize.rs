use ahash::AHashMap as HashMap;
use gateway_controller_core::{
    ActiveHealthCheck, ClusterConfig, DestinationConfig, DiscoverySet, HealthCheckPolicy,
    LoadBalancingPolicy, MatchKind, RouteConfig, RouteSnapshot, ServiceInstance, HEALTH_PATH,
};
use std::{collections::BTreeMap, time::Duration};

const EXACT_ORDER: u32 = 1;
const WILDCARD_ORDER: u32 = 2;
const CATCH_ALL: &str = "{**catch-all}";

/// Forwarded requests may stay idle this long, so that slow backend calls are not cut off.
const ACTIVITY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const UNKNOWN: &str = "unknown";

/// Maps a logical service name onto the path segment its API is served under, e.g.
/// `user-service` is reachable at `/api/v1/users`.
///
/// Unmapped services are served under their own name.
#[derive(Clone, Debug)]
pub struct PathMappings(HashMap<String, String>);

/// Translates topology into routing configuration.
///
/// Synthesis is deterministic: the same input always yields the same routes and clusters in the
/// same order. Snapshots are returned unversioned; the [`ConfigProvider`](crate::ConfigProvider)
/// stamps them when they are published.
#[derive(Clone, Debug)]
pub struct RouteSynthesizer {
    paths: PathMappings,
    fallback: BTreeMap<String, String>,
}

// === impl PathMappings ===

impl Default for PathMappings {
    fn default() -> Self {
        Self::new([
            ("product-service", "v1/products"),
            ("user-service", "v1/users"),
            ("city-service", "v1/cities"),
            ("event-service", "v1/events"),
            ("coworking-service", "v1/coworking"),
            ("ai-service", "v1/ai"),
            ("search-service", "v1/search"),
            ("gateway", "gateway"),
        ])
    }
}

impl PathMappings {
    pub fn new<K, V>(mappings: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            mappings
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn segment<'a>(&'a self, service: &'a str) -> &'a str {
        self.0.get(service).map(String::as_str).unwrap_or(service)
    }
}

// === impl RouteSynthesizer ===

impl Default for RouteSynthesizer {
    fn default() -> Self {
        Self::new(PathMappings::default(), BTreeMap::new())
    }
}

impl RouteSynthesizer {
    /// `fallback` maps service names to base URLs that are routed to when the registry cannot
    /// provide any topology.
    pub fn new(paths: PathMappings, fallback: BTreeMap<String, String>) -> Self {
        Self { paths, fallback }
    }

    pub fn has_fallback(&self) -> bool {
        !self.fallback.is_empty()
    }

    pub fn synthesize(&self, discovered: &DiscoverySet) -> RouteSnapshot {
        let mut snapshot = RouteSnapshot::default();
        for (service, instances) in discovered {
            tracing::debug!(%service, instances = instances.len(), "Synthesizing routes");
            let cluster_id = cluster_id(service);
            snapshot.routes.extend(self.routes(service, &cluster_id));
            snapshot.clusters.push(ClusterConfig {
                destinations: destinations(service, instances),
                load_balancing_policy: LoadBalancingPolicy::RoundRobin,
                health_check: health_check(Duration::from_secs(10), Duration::from_secs(5)),
                activity_timeout: ACTIVITY_TIMEOUT,
                metadata: BTreeMap::from([("source".to_string(), "registry".to_string())]),
                cluster_id,
            });
        }
        snapshot
    }

    /// Builds a snapshot from the static fallback table, if one is configured.
    pub fn synthesize_static(&self) -> Option<RouteSnapshot> {
        if self.fallback.is_empty() {
            return None;
        }

        let mut snapshot = RouteSnapshot::default();
        for (service, url) in &self.fallback {
            let cluster_id = cluster_id(service);
            snapshot.routes.extend(self.routes(service, &cluster_id));

            let address = url.trim_end_matches('/').to_string();
            let destination = DestinationConfig {
                health_probe_url: format!("{address}{HEALTH_PATH}"),
                address,
                metadata: BTreeMap::new(),
            };
            snapshot.clusters.push(ClusterConfig {
                destinations: BTreeMap::from([(service.clone(), destination)]),
                load_balancing_policy: LoadBalancingPolicy::RoundRobin,
                health_check: health_check(Duration::from_secs(30), Duration::from_secs(10)),
                activity_timeout: ACTIVITY_TIMEOUT,
                metadata: BTreeMap::from([("source".to_string(), "static".to_string())]),
                cluster_id,
            });
        }
        Some(snapshot)
    }

    fn routes(&self, service: &str, cluster_id: &str) -> [RouteConfig; 2] {
        let exact = format!("/api/{}", self.paths.segment(service));
        let wildcard = format!("{exact}/{CATCH_ALL}");
        [
            RouteConfig {
                route_id: route_id(service, &exact),
                cluster_id: cluster_id.to_string(),
                path_pattern: exact,
                match_kind: MatchKind::Exact,
                order: EXACT_ORDER,
            },
            RouteConfig {
                route_id: route_id(service, &wildcard),
                cluster_id: cluster_id.to_string(),
                path_pattern: wildcard,
                match_kind: MatchKind::PrefixWildcard,
                order: WILDCARD_ORDER,
            },
        ]
    }
}

fn cluster_id(service: &str) -> String {
    format!("{service}-cluster")
}

/// `/api/v1/users/{**catch-all}` becomes `{service}-api-v1-users-catch-all-route`.
fn route_id(service: &str, pattern: &str) -> String {
    let sanitized = pattern
        .chars()
        .filter(|c| !matches!(c, '{' | '}' | '*'))
        .map(|c| if c == '/' { '-' } else { c })
        .collect::<String>();
    format!("{service}-{}-route", sanitized.trim_matches('-'))
}

fn destinations(
    service: &str,
    instances: &[ServiceInstance],
) -> BTreeMap<String, DestinationConfig> {
    let multiple = instances.len() > 1;
    instances
        .iter()
        .enumerate()
        .map(|(i, instance)| {
            let id = if multiple {
                format!("{service}-{i}")
            } else {
                service.to_string()
            };
            let address = format!("http://{}:{}", instance.address, instance.port);
            let metadata = BTreeMap::from([
                ("registry.service.id".to_string(), instance.id.clone()),
                ("registry.node".to_string(), instance.node.clone()),
                (
                    "registry.version".to_string(),
                    instance.metadata("version").unwrap_or(UNKNOWN).to_string(),
                ),
                (
                    "registry.environment".to_string(),
                    instance.metadata("environment").unwrap_or(UNKNOWN).to_string(),
                ),
            ]);
            let destination = DestinationConfig {
                health_probe_url: format!("{address}{HEALTH_PATH}"),
                address,
                metadata,
            };
            (id, destination)
        })
        .collect()
}

fn health_check(interval: Duration, timeout: Duration) -> ActiveHealthCheck {
    ActiveHealthCheck {
        interval,
        timeout,
        path: HEALTH_PATH.to_string(),
        policy: HealthCheckPolicy::ConsecutiveFailures,
    }
}
