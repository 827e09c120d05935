use serde::Serialize;
use std::{collections::BTreeMap, time::Duration};
use tokio::sync::watch;

/// One immutable, fully-formed routing configuration.
///
/// Snapshots are never mutated once published; a newer poll produces a new snapshot that
/// supersedes this one and fires this snapshot's change token.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RouteSnapshot {
    pub version: u64,
    pub routes: Vec<RouteConfig>,
    pub clusters: Vec<ClusterConfig>,

    #[serde(skip)]
    pub change_token: ChangeToken,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    pub route_id: String,
    pub cluster_id: String,
    pub path_pattern: String,
    pub match_kind: MatchKind,

    /// Lower values take precedence when several routes match a request.
    pub order: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum MatchKind {
    Exact,
    PrefixWildcard,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub cluster_id: String,
    pub destinations: BTreeMap<String, DestinationConfig>,
    pub load_balancing_policy: LoadBalancingPolicy,
    pub health_check: ActiveHealthCheck,

    /// Bounds how long a forwarded request may stay idle before the data plane abandons it.
    #[serde(serialize_with = "crate::duration::serialize")]
    pub activity_timeout: Duration,

    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationConfig {
    pub address: String,
    pub health_probe_url: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub enum LoadBalancingPolicy {
    #[default]
    RoundRobin,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveHealthCheck {
    #[serde(serialize_with = "crate::duration::serialize")]
    pub interval: Duration,
    #[serde(serialize_with = "crate::duration::serialize")]
    pub timeout: Duration,
    pub path: String,
    pub policy: HealthCheckPolicy,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum HealthCheckPolicy {
    ConsecutiveFailures,
}

/// A one-shot signal that a newer snapshot has replaced the one it was issued against.
///
/// Tokens are cheap to clone; every clone observes the same signal. A token that was never
/// attached to a publisher (e.g. on a snapshot that has not been published yet) never fires.
#[derive(Clone, Debug, Default)]
pub struct ChangeToken(Option<watch::Receiver<bool>>);

/// Fires a [`ChangeToken`]. Consumed on use, so a token fires at most once.
#[derive(Debug)]
pub struct ChangeTrigger(watch::Sender<bool>);

// === impl RouteSnapshot ===

impl RouteSnapshot {
    pub fn cluster(&self, cluster_id: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.cluster_id == cluster_id)
    }

    /// Indicates whether every route refers to a cluster present in this snapshot.
    pub fn is_consistent(&self) -> bool {
        self.routes
            .iter()
            .all(|r| self.cluster(&r.cluster_id).is_some())
    }

    /// Compares routing content, ignoring the version and change token.
    pub fn same_topology(&self, other: &Self) -> bool {
        self.routes == other.routes && self.clusters == other.clusters
    }
}

// === impl ChangeToken ===

impl ChangeToken {
    /// Returns a token and the trigger that fires it.
    pub fn pair() -> (ChangeTrigger, Self) {
        let (tx, rx) = watch::channel(false);
        (ChangeTrigger(tx), Self(Some(rx)))
    }

    pub fn has_changed(&self) -> bool {
        match &self.0 {
            // A trigger dropped without firing means the publisher is gone; nothing will ever be
            // newer, but waiters must not hang either.
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
            None => false,
        }
    }

    /// Completes once the token fires.
    pub async fn changed(&self) {
        match &self.0 {
            Some(rx) => {
                let mut rx = rx.clone();
                let _ = rx.wait_for(|changed| *changed).await;
            }
            None => std::future::pending().await,
        }
    }
}

// === impl ChangeTrigger ===

impl ChangeTrigger {
    pub fn fire(self) {
        self.0.send_replace(true);
    }
}
