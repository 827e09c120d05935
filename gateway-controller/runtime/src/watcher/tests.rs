use super::*;
use crate::index::{ConfigProvider, PathMappings};
use maplit::btreemap;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

const MESH_TAG: &str = "dapr";

type Topology = BTreeMap<String, Vec<ServiceInstance>>;

/// Answers each poll with the next scripted topology, or fails it.
#[derive(Clone, Default)]
struct FakeRegistry(Arc<Script>);

#[derive(Default)]
struct Script {
    polls: Mutex<VecDeque<Scripted>>,
    current: Mutex<Topology>,
    failing: Mutex<Option<&'static str>>,
    fetched: Mutex<Vec<String>>,
}

enum Scripted {
    Topology(Topology),
    Fail,
    Hang,
    FailService(Topology, &'static str),
}

#[async_trait::async_trait]
impl DiscoverRegistry for FakeRegistry {
    async fn list_services(&self) -> Result<Vec<String>> {
        let next = self.0.polls.lock().pop_front();
        let (topology, failing) = match next {
            Some(Scripted::Topology(topology)) => (topology, None),
            Some(Scripted::FailService(topology, service)) => (topology, Some(service)),
            Some(Scripted::Fail) => bail!("connection refused"),
            Some(Scripted::Hang) => std::future::pending().await,
            None => bail!("script exhausted"),
        };
        let services = topology.keys().cloned().collect();
        *self.0.current.lock() = topology;
        *self.0.failing.lock() = failing;
        Ok(services)
    }

    async fn list_healthy_instances(&self, service: &str) -> Result<Vec<ServiceInstance>> {
        if *self.0.failing.lock() == Some(service) {
            bail!("internal server error");
        }
        self.0.fetched.lock().push(service.to_string());
        Ok(self
            .0
            .current
            .lock()
            .get(service)
            .cloned()
            .unwrap_or_default())
    }
}

fn mk_instance(service: &str, n: usize, tags: &[&str]) -> ServiceInstance {
    ServiceInstance {
        service_name: service.to_string(),
        id: format!("{service}-{n}"),
        node: "node-0".to_string(),
        address: format!("10.0.0.{n}"),
        port: 8080,
        healthy: true,
        tags: tags.iter().map(|t| t.to_string()).collect(),
        metadata: Default::default(),
    }
}

fn eligible(service: &str, count: usize) -> Vec<ServiceInstance> {
    (0..count).map(|n| mk_instance(service, n, &[MESH_TAG])).collect()
}

fn mk_watcher(
    script: impl IntoIterator<Item = Scripted>,
    fallback: BTreeMap<String, String>,
) -> (RegistryWatcher<FakeRegistry>, FakeRegistry, SharedProvider) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let registry = FakeRegistry::default();
    registry.0.polls.lock().extend(script);
    let provider = ConfigProvider::shared();
    let watcher = RegistryWatcher::new(
        registry.clone(),
        RouteSynthesizer::new(PathMappings::default(), fallback),
        provider.clone(),
        WatcherConfig::default(),
        WatcherMetrics::default(),
    );
    (watcher, registry, provider)
}

fn has_trace_of(provider: &ConfigProvider, service: &str) -> bool {
    let snapshot = provider.get_config();
    snapshot.routes.iter().any(|r| r.route_id.starts_with(service))
        || snapshot
            .clusters
            .iter()
            .any(|c| c.cluster_id.starts_with(service))
}

#[test]
fn backoff_doubles_up_to_the_cap_and_resets() {
    let mut backoff = Backoff::new(Duration::from_secs(60));
    let delays = (0..8)
        .map(|_| backoff.next_delay().as_secs())
        .collect::<Vec<_>>();
    assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60, 60]);
    assert_eq!(backoff.failures(), 8);

    backoff.reset();
    assert_eq!(backoff.next_delay(), Duration::from_secs(2));

    let mut backoff = Backoff::new(Duration::from_secs(60));
    let last = (0..100).map(|_| backoff.next_delay()).last();
    assert_eq!(last, Some(Duration::from_secs(60)));
}

#[tokio::test(start_paused = true)]
async fn failures_back_off_and_success_resets() {
    let (mut watcher, _, provider) = mk_watcher(
        [
            Scripted::Fail,
            Scripted::Fail,
            Scripted::Fail,
            Scripted::Topology(btreemap! {
                "user-service".to_string() => eligible("user-service", 1),
            }),
            Scripted::Fail,
        ],
        BTreeMap::new(),
    );

    let mut delays = Vec::new();
    for _ in 0..5 {
        delays.push(watcher.poll_once().await.as_secs());
    }
    assert_eq!(delays, vec![2, 4, 8, 30, 2]);

    // The last failure leaves the registry-derived routes in place.
    assert_eq!(provider.version(), 1);
    assert!(has_trace_of(&provider, "user-service"));
}

#[tokio::test(start_paused = true)]
async fn services_that_become_ineligible_are_dropped() {
    let (mut watcher, _, provider) = mk_watcher(
        [
            Scripted::Topology(btreemap! {
                "user-service".to_string() => eligible("user-service", 2),
                "city-service".to_string() => eligible("city-service", 1),
            }),
            Scripted::Topology(btreemap! {
                "user-service".to_string() => vec![mk_instance("user-service", 0, &["api"])],
                "city-service".to_string() => eligible("city-service", 1),
            }),
        ],
        BTreeMap::new(),
    );

    watcher.poll_once().await;
    assert!(has_trace_of(&provider, "user-service"));
    assert!(has_trace_of(&provider, "city-service"));

    watcher.poll_once().await;
    assert_eq!(provider.version(), 2);
    assert!(!has_trace_of(&provider, "user-service"));
    assert!(has_trace_of(&provider, "city-service"));
    assert!(provider.get_config().is_consistent());
}

#[tokio::test(start_paused = true)]
async fn unchanged_topology_is_not_republished() {
    let topology = || {
        btreemap! {
            "event-service".to_string() => eligible("event-service", 3),
        }
    };
    let (mut watcher, _, provider) = mk_watcher(
        [Scripted::Topology(topology()), Scripted::Topology(topology())],
        BTreeMap::new(),
    );

    watcher.poll_once().await;
    let first = provider.get_config();
    watcher.poll_once().await;
    assert_eq!(provider.version(), 1);
    assert!(!first.change_token.has_changed());
}

#[tokio::test(start_paused = true)]
async fn excluded_services_are_never_fetched() {
    let (mut watcher, registry, provider) = mk_watcher(
        [Scripted::Topology(btreemap! {
            "consul".to_string() => eligible("consul", 1),
            "Gateway".to_string() => eligible("Gateway", 1),
            "ai-service".to_string() => eligible("ai-service", 1),
        })],
        BTreeMap::new(),
    );

    watcher.poll_once().await;
    assert_eq!(*registry.0.fetched.lock(), vec!["ai-service".to_string()]);
    assert_eq!(provider.get_config().clusters.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn a_failed_service_fetch_fails_the_poll() {
    let (mut watcher, _, provider) = mk_watcher(
        [Scripted::FailService(
            btreemap! {
                "user-service".to_string() => eligible("user-service", 1),
                "city-service".to_string() => eligible("city-service", 1),
            },
            "city-service",
        )],
        BTreeMap::new(),
    );

    assert_eq!(watcher.poll_once().await, Duration::from_secs(2));
    assert_eq!(provider.version(), 0);
}

#[tokio::test(start_paused = true)]
async fn timeouts_count_as_failures() {
    let (mut watcher, _, provider) = mk_watcher([Scripted::Hang], BTreeMap::new());

    let started = time::Instant::now();
    assert_eq!(watcher.poll_once().await, Duration::from_secs(2));
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(provider.version(), 0);
}

#[tokio::test(start_paused = true)]
async fn static_fallback_only_until_the_registry_answers() {
    let fallback = btreemap! {
        "user-service".to_string() => "http://user-service:80".to_string(),
    };
    let (mut watcher, _, provider) = mk_watcher(
        [
            Scripted::Fail,
            Scripted::Topology(btreemap! {
                "city-service".to_string() => eligible("city-service", 1),
            }),
            Scripted::Fail,
            Scripted::Topology(BTreeMap::new()),
        ],
        fallback,
    );

    // Nothing published yet: the fallback is served.
    watcher.poll_once().await;
    assert_eq!(provider.version(), 1);
    assert!(has_trace_of(&provider, "user-service"));

    watcher.poll_once().await;
    assert!(!has_trace_of(&provider, "user-service"));
    assert!(has_trace_of(&provider, "city-service"));

    // Registry-derived routes are never replaced by the fallback on failure.
    watcher.poll_once().await;
    assert_eq!(provider.version(), 2);
    assert!(has_trace_of(&provider, "city-service"));

    // An empty registry falls back again.
    watcher.poll_once().await;
    assert_eq!(provider.version(), 3);
    let snapshot = provider.get_config();
    assert_eq!(snapshot.clusters[0].metadata["source"], "static");
}

#[tokio::test(start_paused = true)]
async fn empty_registry_without_fallback_publishes_no_routes() {
    let (mut watcher, _, provider) = mk_watcher(
        [
            Scripted::Topology(btreemap! {
                "user-service".to_string() => eligible("user-service", 1),
            }),
            Scripted::Topology(BTreeMap::new()),
        ],
        BTreeMap::new(),
    );
    watcher.poll_once().await;
    watcher.poll_once().await;
    assert_eq!(provider.version(), 2);
    assert!(provider.get_config().routes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stops_polling_on_shutdown() {
    let (watcher, registry, provider) = mk_watcher(
        (0..10).map(|_| {
            Scripted::Topology(btreemap! {
                "user-service".to_string() => eligible("user-service", 1),
            })
        }),
        BTreeMap::new(),
    );
    let (signal, drain) = drain::channel();
    let task = tokio::spawn(watcher.run(drain));

    time::sleep(Duration::from_secs(45)).await;
    assert_eq!(registry.0.polls.lock().len(), 8, "polled at 0s and 30s");

    signal.drain().await;
    task.await.expect("watcher must exit cleanly");
    assert_eq!(registry.0.polls.lock().len(), 8);
    assert_eq!(provider.version(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_an_in_flight_poll() {
    let (watcher, registry, _) = mk_watcher([Scripted::Hang], BTreeMap::new());
    let (signal, drain) = drain::channel();
    let task = tokio::spawn(watcher.run(drain));
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    assert!(registry.0.polls.lock().is_empty(), "the poll has started");

    let started = time::Instant::now();
    signal.drain().await;
    assert!(
        started.elapsed() >= Duration::from_secs(10),
        "the poll timed out first"
    );
    task.await.expect("watcher must exit cleanly");
}

#[test]
fn metrics_count_polls() {
    let mut prom = Registry::default();
    let metrics = WatcherMetrics::register(&mut prom);
    metrics.polled("failure", 1);
    metrics.polled("failure", 2);
    metrics.polled("success", 0);

    let mut text = String::new();
    prometheus_client::encoding::text::encode(&mut text, &prom).unwrap();
    assert!(
        text.contains(r#"registry_polls_total{result="failure"} 2"#),
        "{text}"
    );
    assert!(
        text.contains(r#"registry_polls_total{result="success"} 1"#),
        "{text}"
    );
    assert!(text.contains("registry_consecutive_failures 0"), "{text}");
}
