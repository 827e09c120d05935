//! Request admission control.
//!
//! Every named [`RateLimitPolicy`] owns an independent set of partitions, keyed by client. A
//! partition is created the first time a client is seen under a policy and holds a single limiter
//! whose state is private to it, so two policies never share state even for the same client.
//!
//! Partitions are created with an atomic get-or-create on a concurrent map, so concurrent first
//! requests from one client always share one limiter.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
mod concurrency;
mod fixed_window;
mod limiter;
pub mod metrics;
mod rejection;
mod sliding_window;
mod token_bucket;


pub use self::{
    client::{is_exempt, policy_for_path, resolve_client_key},
    metrics::AdmissionMetrics,
    rejection::{Rejected, RejectionBody, DEFAULT_RETRY_AFTER},
};
use self::{
    concurrency::Concurrency,
    fixed_window::FixedWindow,
    limiter::{Limiter, Release},
    sliding_window::SlidingWindow,
    token_bucket::TokenBucket,
};
use dashmap::DashMap;
use gateway_controller_core::{ratelimit, InvalidPolicy, RateLimitPolicy};
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::time::Instant;

#[derive(Debug)]
pub struct AdmissionController {
    policies: BTreeMap<String, Policy>,
    metrics: AdmissionMetrics,
}

/// The receipt of a successful admission.
///
/// Leases issued by concurrency policies hold their permit until dropped; dropping the lease is
/// the only way to return it, so a lease must be held for as long as the request is in flight.
///
/// A lease carries no retry hint: an admitted request has nothing to retry. Retry guidance is
/// only given on rejection, through [`Rejected::retry_after`].
#[derive(Default)]
#[must_use = "concurrency permits are released when the lease is dropped"]
pub struct Lease {
    release: Option<Arc<dyn Release>>,
}

#[derive(Debug)]
struct Policy {
    name: Arc<str>,
    limits: RateLimitPolicy,
    partitions: DashMap<String, Partition>,
}

#[derive(Clone, Debug)]
enum Partition {
    FixedWindow(Arc<Limiter<FixedWindow>>),
    SlidingWindow(Arc<Limiter<SlidingWindow>>),
    TokenBucket(Arc<Limiter<TokenBucket>>),
    Concurrency(Arc<Limiter<Concurrency>>),
}

// === impl AdmissionController ===

impl AdmissionController {
    /// Builds a controller over the given policy table, validating every policy.
    pub fn from_policies(
        policies: impl IntoIterator<Item = (String, RateLimitPolicy)>,
    ) -> Result<Self, InvalidPolicy> {
        let policies = policies.into_iter().collect::<Vec<_>>();
        for (name, limits) in &policies {
            limits.validate(name)?;
        }
        Ok(Self::new(policies))
    }

    fn new(policies: impl IntoIterator<Item = (String, RateLimitPolicy)>) -> Self {
        let policies = policies
            .into_iter()
            .map(|(name, limits)| {
                let policy = Policy {
                    name: name.as_str().into(),
                    limits,
                    partitions: DashMap::new(),
                };
                (name, policy)
            })
            .collect();
        Self {
            policies,
            metrics: AdmissionMetrics::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: AdmissionMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Admits a request under `policy` for the client identified by `key`.
    ///
    /// May wait while the request is queued. Requests under a policy that is not configured are
    /// admitted without limit.
    pub async fn acquire(&self, name: &str, key: &str) -> Result<Lease, Rejected> {
        let Some(policy) = self.policies.get(name) else {
            tracing::debug!(policy = %name, "No such rate-limit policy; admitting");
            return Ok(Lease::default());
        };

        let partition = self.partition(policy, key);
        let result = partition.acquire().await;
        self.metrics.decided(&policy.name, result.is_ok());
        result.map_err(|retry_after| {
            tracing::debug!(policy = %policy.name, client = %key, ?retry_after, "Rejected");
            Rejected::new(policy.name.clone(), retry_after)
        })
    }

    /// The number of live partitions under `policy`.
    pub fn partitions(&self, policy: &str) -> usize {
        self.policies
            .get(policy)
            .map(|p| p.partitions.len())
            .unwrap_or(0)
    }

    /// Drops partitions that hold no state: no outstanding leases, no queued requests, and every
    /// permit replenished. Returns the number of partitions dropped.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        for policy in self.policies.values() {
            let before = policy.partitions.len();
            policy.partitions.retain(|_, partition| !partition.is_evictable(now));
            let after = policy.partitions.len();
            evicted += before.saturating_sub(after);
            self.metrics.set_partitions(&policy.name, after);
        }
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted idle partitions");
        }
        evicted
    }

    fn partition(&self, policy: &Policy, key: &str) -> Partition {
        if let Some(partition) = policy.partitions.get(key) {
            return partition.clone();
        }

        let partition = policy
            .partitions
            .entry(key.to_string())
            .or_insert_with(|| Partition::new(&policy.limits))
            .clone();
        self.metrics.set_partitions(&policy.name, policy.partitions.len());
        partition
    }
}

/// The default policy table.
impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(ratelimit::default_policies())
    }
}

// === impl Partition ===

impl Partition {
    fn new(limits: &RateLimitPolicy) -> Self {
        let now = Instant::now();
        let (queue_limit, order) = (limits.queue_limit(), limits.queue_order());
        match *limits {
            RateLimitPolicy::FixedWindow {
                window,
                permit_limit,
                ..
            } => Self::FixedWindow(Limiter::new(
                FixedWindow::new(window.into(), permit_limit, now),
                queue_limit,
                order,
            )),
            RateLimitPolicy::SlidingWindow {
                window,
                segments,
                permit_limit,
                ..
            } => Self::SlidingWindow(Limiter::new(
                SlidingWindow::new(window.into(), segments, permit_limit, now),
                queue_limit,
                order,
            )),
            RateLimitPolicy::TokenBucket {
                capacity,
                tokens_per_period,
                period,
                ..
            } => Self::TokenBucket(Limiter::new(
                TokenBucket::new(capacity, tokens_per_period, period.into(), now),
                queue_limit,
                order,
            )),
            RateLimitPolicy::Concurrency { max_concurrent, .. } => Self::Concurrency(
                Limiter::new(Concurrency::new(max_concurrent), queue_limit, order),
            ),
        }
    }

    async fn acquire(self) -> Result<Lease, Option<std::time::Duration>> {
        match self {
            Self::FixedWindow(l) => l.acquire().await,
            Self::SlidingWindow(l) => l.acquire().await,
            Self::TokenBucket(l) => l.acquire().await,
            Self::Concurrency(l) => l.acquire().await,
        }
    }

    /// A partition referenced outside the map (by a lease or a pending acquisition) is never
    /// evicted.
    fn is_evictable(&self, now: Instant) -> bool {
        match self {
            Self::FixedWindow(l) => Arc::strong_count(l) == 1 && l.is_idle(now),
            Self::SlidingWindow(l) => Arc::strong_count(l) == 1 && l.is_idle(now),
            Self::TokenBucket(l) => Arc::strong_count(l) == 1 && l.is_idle(now),
            Self::Concurrency(l) => Arc::strong_count(l) == 1 && l.is_idle(now),
        }
    }
}

// === impl Lease ===

impl Lease {
    pub(crate) fn releasing(limiter: Arc<dyn Release>) -> Self {
        Self {
            release: Some(limiter),
        }
    }

    /// Forgets the permit without returning it, for callers that return it themselves.
    pub(crate) fn disarm(&mut self) {
        self.release = None;
    }

    /// Indicates whether dropping this lease returns a permit.
    pub fn is_held(&self) -> bool {
        self.release.is_some()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release.release();
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("held", &self.is_held())
            .finish()
    }
}
