use super::*;
use gateway_controller_core::{DiscoverySet, MatchKind, RouteSnapshot, ServiceInstance};
use maplit::{btreemap, hashmap};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_test::{assert_pending, assert_ready, task};

const MESH_TAG: &str = "dapr";

fn mk_instance(service: &str, n: usize) -> ServiceInstance {
    ServiceInstance {
        service_name: service.to_string(),
        id: format!("{service}-id-{n}"),
        node: format!("node-{n}"),
        address: format!("10.0.0.{n}"),
        port: 8080,
        healthy: true,
        tags: [MESH_TAG.to_string()].into_iter().collect(),
        metadata: hashmap! {
            "version".to_string() => "1.2.0".to_string(),
        }
        .into_iter()
        .collect(),
    }
}

fn mk_set(services: &[(&str, usize)]) -> DiscoverySet {
    let mut set = DiscoverySet::default();
    for (service, count) in services {
        set.insert_eligible(
            *service,
            (0..*count).map(|n| mk_instance(service, n)),
            MESH_TAG,
        );
    }
    set
}

#[test]
fn every_route_refers_to_a_cluster() {
    let synth = RouteSynthesizer::default();
    let snapshot = synth.synthesize(&mk_set(&[
        ("user-service", 1),
        ("city-service", 2),
        ("unmapped-service", 3),
    ]));
    assert_eq!(snapshot.routes.len(), 6);
    assert_eq!(snapshot.clusters.len(), 3);
    assert!(snapshot.is_consistent());
}

#[test]
fn two_routes_per_service() {
    let synth = RouteSynthesizer::default();
    let snapshot = synth.synthesize(&mk_set(&[("user-service", 1)]));

    let exact = &snapshot.routes[0];
    assert_eq!(exact.path_pattern, "/api/v1/users");
    assert_eq!(exact.match_kind, MatchKind::Exact);
    assert_eq!(exact.order, 1);
    assert_eq!(exact.route_id, "user-service-api-v1-users-route");
    assert_eq!(exact.cluster_id, "user-service-cluster");

    let wildcard = &snapshot.routes[1];
    assert_eq!(wildcard.path_pattern, "/api/v1/users/{**catch-all}");
    assert_eq!(wildcard.match_kind, MatchKind::PrefixWildcard);
    assert_eq!(wildcard.order, 2);
    assert_eq!(wildcard.route_id, "user-service-api-v1-users-catch-all-route");
}

#[test]
fn unmapped_services_are_served_under_their_name() {
    let synth = RouteSynthesizer::default();
    let snapshot = synth.synthesize(&mk_set(&[("inventory", 1)]));
    assert_eq!(snapshot.routes[0].path_pattern, "/api/inventory");

    let synth = RouteSynthesizer::new(
        PathMappings::new([("inventory", "v2/stock")]),
        Default::default(),
    );
    let snapshot = synth.synthesize(&mk_set(&[("inventory", 1)]));
    assert_eq!(snapshot.routes[0].path_pattern, "/api/v2/stock");
}

#[test]
fn one_destination_per_eligible_instance() {
    let synth = RouteSynthesizer::default();

    let mut set = mk_set(&[("city-service", 3)]);
    let mut unhealthy = mk_instance("event-service", 0);
    unhealthy.healthy = false;
    set.insert_eligible("event-service", vec![unhealthy], MESH_TAG);

    let snapshot = synth.synthesize(&set);
    assert!(snapshot.cluster("event-service-cluster").is_none());
    assert!(snapshot
        .routes
        .iter()
        .all(|r| !r.route_id.starts_with("event-service")));

    let cluster = snapshot
        .cluster("city-service-cluster")
        .expect("cluster must exist");
    assert_eq!(
        cluster.destinations.keys().cloned().collect::<Vec<_>>(),
        vec!["city-service-0", "city-service-1", "city-service-2"]
    );
    assert_eq!(cluster.health_check.interval, Duration::from_secs(10));
    assert_eq!(cluster.health_check.timeout, Duration::from_secs(5));
    assert_eq!(cluster.health_check.path, "/health");
    assert_eq!(cluster.activity_timeout, Duration::from_secs(600));
}

#[test]
fn single_instances_use_the_service_name() {
    let synth = RouteSynthesizer::default();
    let mut set = DiscoverySet::default();
    let mut instance = mk_instance("ai-service", 7);
    instance.metadata.clear();
    set.insert_eligible("ai-service", vec![instance], MESH_TAG);

    let snapshot = synth.synthesize(&set);
    let cluster = snapshot.cluster("ai-service-cluster").unwrap();
    let destination = &cluster.destinations["ai-service"];
    assert_eq!(destination.address, "http://10.0.0.7:8080");
    assert_eq!(destination.health_probe_url, "http://10.0.0.7:8080/health");
    assert_eq!(
        destination.metadata,
        btreemap! {
            "registry.environment".to_string() => "unknown".to_string(),
            "registry.node".to_string() => "node-7".to_string(),
            "registry.service.id".to_string() => "ai-service-id-7".to_string(),
            "registry.version".to_string() => "unknown".to_string(),
        }
    );
}

#[test]
fn static_fallback() {
    assert!(RouteSynthesizer::default().synthesize_static().is_none());

    let synth = RouteSynthesizer::new(
        PathMappings::default(),
        btreemap! {
            "user-service".to_string() => "http://user-service:80/".to_string(),
        },
    );
    let snapshot = synth.synthesize_static().expect("fallback is configured");
    assert!(snapshot.is_consistent());
    assert_eq!(snapshot.routes.len(), 2);

    let cluster = snapshot.cluster("user-service-cluster").unwrap();
    assert_eq!(cluster.metadata["source"], "static");
    assert_eq!(cluster.health_check.interval, Duration::from_secs(30));
    assert_eq!(cluster.health_check.timeout, Duration::from_secs(10));
    assert_eq!(
        cluster.destinations["user-service"].address,
        "http://user-service:80"
    );
}

#[test]
fn publish_stamps_increasing_versions() {
    let provider = ConfigProvider::new();
    assert_eq!(provider.version(), 0);
    assert!(provider.get_config().routes.is_empty());

    let synth = RouteSynthesizer::default();
    assert_eq!(provider.publish(synth.synthesize(&mk_set(&[("a", 1)]))), 1);
    assert_eq!(provider.publish(synth.synthesize(&mk_set(&[("b", 1)]))), 2);
    assert_eq!(provider.get_config().version, 2);
    assert_eq!(provider.get_config().clusters[0].cluster_id, "b-cluster");
}

#[test]
fn publish_fires_the_previous_token_after_the_swap() {
    let provider = Arc::new(ConfigProvider::new());
    let initial = provider.get_config();
    let token = initial.change_token.clone();
    assert!(!token.has_changed());

    let mut waiter = task::spawn({
        let provider = provider.clone();
        async move {
            token.changed().await;
            provider.get_config().version
        }
    });
    assert_pending!(waiter.poll());

    provider.publish(RouteSnapshot::default());
    assert!(initial.change_token.has_changed());
    assert!(waiter.is_woken());
    assert_eq!(assert_ready!(waiter.poll()), 1);

    // The new snapshot's token stays armed until the next publish.
    assert!(!provider.get_config().change_token.has_changed());
}

#[test]
fn changed_on_superseded_snapshot_is_already_fired() {
    let provider = ConfigProvider::new();
    let first = provider.get_config();
    assert!(!provider.changed(&first).has_changed());

    provider.publish(RouteSnapshot::default());
    assert!(provider.changed(&first).has_changed());
    assert!(!provider.changed(&provider.get_config()).has_changed());
}

#[test]
fn concurrent_publish_and_read() {
    let provider = ConfigProvider::new();
    let synth = RouteSynthesizer::default();
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let mut last = 0;
                while !done.load(Ordering::Acquire) {
                    let snapshot = provider.get_config();
                    assert!(snapshot.is_consistent());
                    assert!(snapshot.version >= last, "versions must not go backwards");
                    last = snapshot.version;
                }
            });
        }

        let names = ["user-service", "city-service", "event-service", "ai-service"];
        for n in 0..2_000 {
            let services = names
                .iter()
                .enumerate()
                .filter(|(i, _)| (n >> i) & 1 == 1)
                .map(|(i, name)| (*name, i + 1))
                .collect::<Vec<_>>();
            provider.publish(synth.synthesize(&mk_set(&services)));
        }
        done.store(true, Ordering::Release);
    });

    assert_eq!(provider.version(), 2_000);
}

#[test]
fn metrics_report_the_current_snapshot() {
    let provider = ConfigProvider::shared();
    let mut registry = prometheus_client::registry::Registry::default();
    metrics::register(&mut registry, provider.clone());

    provider.publish(RouteSynthesizer::default().synthesize(&mk_set(&[("user-service", 2)])));

    let mut text = String::new();
    prometheus_client::encoding::text::encode(&mut text, &registry).unwrap();
    assert!(text.contains("route_snapshot_version 1"), "{text}");
    assert!(text.contains("route_snapshot_routes 2"), "{text}");
    assert!(text.contains("route_snapshot_clusters 1"), "{text}");
}
