use crate::{
    core::{DiscoverRegistry, DiscoverySet, ServiceInstance},
    index::{RouteSynthesizer, SharedProvider},
};
use anyhow::{bail, Context, Result};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::{future::Future, time::Duration};
use tokio::time;
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

#[derive(Clone, Debug)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    pub max_backoff: Duration,

    /// Bounds every registry request, including each per-service fetch.
    pub timeout: Duration,

    pub mesh_tag: String,

    /// Registry entries that are never routed to, such as the registry itself.
    pub exclude: Vec<String>,
}

/// Exponential delays between failed polls: 2s, 4s, 8s, ... up to a maximum.
#[derive(Clone, Debug)]
pub struct Backoff {
    failures: u32,
    max: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct WatcherMetrics {
    polls: Family<PollLabels, Counter>,
    consecutive_failures: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PollLabels {
    result: &'static str,
}

/// Polls a registry and publishes the routes synthesized from each successful poll.
///
/// Failures are retried with [`Backoff`] and never replace a published snapshot, so the last
/// registry-derived routes stay in effect for as long as the registry is unavailable.
#[derive(Debug)]
pub struct RegistryWatcher<R> {
    registry: R,
    synthesizer: RouteSynthesizer,
    provider: SharedProvider,
    config: WatcherConfig,
    backoff: Backoff,
    metrics: WatcherMetrics,
}

// === impl WatcherConfig ===

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_backoff: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
            mesh_tag: "dapr".to_string(),
            exclude: vec!["consul".to_string(), "gateway".to_string()],
        }
    }
}

impl WatcherConfig {
    fn is_excluded(&self, service: &str) -> bool {
        self.exclude.iter().any(|e| e.eq_ignore_ascii_case(service))
    }
}

// === impl Backoff ===

impl Backoff {
    pub fn new(max: Duration) -> Self {
        Self { failures: 0, max }
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let secs = 2u64.checked_pow(self.failures).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.max)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

// === impl WatcherMetrics ===

impl WatcherMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let polls = Family::default();
        prom.register(
            "registry_polls",
            "Count of registry polls by result",
            polls.clone(),
        );

        let consecutive_failures = Gauge::default();
        prom.register(
            "registry_consecutive_failures",
            "The number of registry polls that have failed since the last success",
            consecutive_failures.clone(),
        );

        Self {
            polls,
            consecutive_failures,
        }
    }

    fn polled(&self, result: &'static str, failures: u32) {
        self.polls.get_or_create(&PollLabels { result }).inc();
        self.consecutive_failures.set(i64::from(failures));
    }
}

// === impl RegistryWatcher ===

impl<R> RegistryWatcher<R>
where
    R: DiscoverRegistry + Send + Sync + 'static,
{
    pub fn new(
        registry: R,
        synthesizer: RouteSynthesizer,
        provider: SharedProvider,
        config: WatcherConfig,
        metrics: WatcherMetrics,
    ) -> Self {
        Self {
            backoff: Backoff::new(config.max_backoff),
            registry,
            synthesizer,
            provider,
            config,
            metrics,
        }
    }

    /// Polls until shutdown is signaled.
    ///
    /// A poll that is in flight when shutdown is signaled runs to completion; shutdown only stops
    /// further polls from being scheduled.
    pub async fn run(mut self, drain: drain::Watch) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        loop {
            let delay = self.poll_once().await;
            tokio::select! {
                () = time::sleep(delay) => {}
                _ = &mut shutdown => {
                    info!("Stopped polling");
                    return;
                }
            }
        }
    }

    /// Runs a single poll, publishing its result, and returns the delay before the next poll.
    pub async fn poll_once(&mut self) -> Duration {
        match self.poll().await {
            Ok(discovered) => {
                self.backoff.reset();
                self.metrics.polled("success", 0);
                self.apply(&discovered);
                self.config.poll_interval
            }
            Err(error) => {
                let delay = self.backoff.next_delay();
                let attempt = self.backoff.failures();
                self.metrics.polled("failure", attempt);
                warn!(
                    error = format_args!("{error:#}"),
                    attempt,
                    ?delay,
                    "Failed to poll registry"
                );
                self.fallback_if_unpublished();
                delay
            }
        }
    }

    async fn poll(&self) -> Result<DiscoverySet> {
        let services = self
            .bounded(self.registry.list_services())
            .await
            .context("failed to list services")?;

        let services = services
            .into_iter()
            .filter(|s| !self.config.is_excluded(s))
            .collect::<Vec<_>>();

        // Synthesis waits on every fetch; any one failing fails the whole poll.
        let fetched =
            futures::future::try_join_all(services.into_iter().map(|s| self.instances(s)))
                .await?;

        let mut discovered = DiscoverySet::default();
        for (service, instances) in fetched {
            let total = instances.len();
            let eligible =
                discovered.insert_eligible(service.clone(), instances, &self.config.mesh_tag);
            debug!(%service, total, eligible, "Resolved instances");
        }
        Ok(discovered)
    }

    async fn instances(&self, service: String) -> Result<(String, Vec<ServiceInstance>)> {
        let instances = self
            .bounded(self.registry.list_healthy_instances(&service))
            .await
            .with_context(|| format!("failed to list instances of {service}"))?;
        Ok((service, instances))
    }

    async fn bounded<T>(&self, fetch: impl Future<Output = Result<T>>) -> Result<T> {
        match time::timeout(self.config.timeout, fetch).await {
            Ok(res) => res,
            Err(_) => bail!("timed out after {:?}", self.config.timeout),
        }
    }

    fn apply(&self, discovered: &DiscoverySet) {
        let fallback = discovered
            .is_empty()
            .then(|| self.synthesizer.synthesize_static())
            .flatten();
        let snapshot = fallback.unwrap_or_else(|| self.synthesizer.synthesize(discovered));

        let current = self.provider.get_config();
        if current.version > 0 && current.same_topology(&snapshot) {
            debug!(version = current.version, "Routes unchanged");
            return;
        }

        let (routes, clusters) = (snapshot.routes.len(), snapshot.clusters.len());
        let version = self.provider.publish(snapshot);
        info!(
            version,
            services = discovered.len(),
            instances = discovered.instance_count(),
            routes,
            clusters,
            "Published routes"
        );
    }

    /// Serves the static fallback when nothing has been published yet.
    fn fallback_if_unpublished(&self) {
        if self.provider.version() > 0 {
            return;
        }
        if let Some(snapshot) = self.synthesizer.synthesize_static() {
            let version = self.provider.publish(snapshot);
            warn!(version, "Registry unavailable; serving static routes");
        }
    }
}
