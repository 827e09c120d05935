#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Gateway control plane core types.
//!
//! The control plane turns a constantly-changing set of registry instances into routing snapshots
//! for a reverse-proxy data plane:
//!
//! ```text
//! [ Registry ] -> [ DiscoverySet ] -> [ RouteSnapshot ] -> [ Data plane ]
//! ```
//!
//! Admission (rate limiting) and authentication gating sit in the request path and consult their
//! own policy tables, independently of the discovery loop.

pub mod authz;
pub mod discovery;
pub mod duration;
pub mod ratelimit;
pub mod routes;

pub use self::{
    authz::{AccessClass, AuthorizationGate, AuthorizationRule, RuleMatch},
    discovery::{DiscoverRegistry, DiscoverySet, ServiceInstance},
    duration::GoDuration,
    ratelimit::{InvalidPolicy, QueueOrder, RateLimitPolicy},
    routes::{
        ActiveHealthCheck, ChangeToken, ChangeTrigger, ClusterConfig, DestinationConfig,
        HealthCheckPolicy, LoadBalancingPolicy, MatchKind, RouteConfig, RouteSnapshot,
    },
};

/// The path probed on every destination by the data plane's active health checks.
pub const HEALTH_PATH: &str = "/health";

/// The path serving Prometheus metrics.
pub const METRICS_PATH: &str = "/metrics";
