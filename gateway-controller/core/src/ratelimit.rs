use crate::GoDuration;
use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};

pub const LOGIN: &str = "login";
pub const REGISTER: &str = "register";
pub const API: &str = "api";
pub const STRICT: &str = "strict";
pub const GLOBAL: &str = "global";

/// The smallest slice of time a window may be divided into.
const MIN_SEGMENT: Duration = Duration::from_millis(1);

/// Describes how a single named policy admits requests within one partition.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RateLimitPolicy {
    /// Permits reset at each window boundary.
    #[serde(rename_all = "camelCase")]
    FixedWindow {
        window: GoDuration,
        permit_limit: u32,
        #[serde(default)]
        queue_limit: u32,
        #[serde(default)]
        queue_order: QueueOrder,
    },

    /// Permits are counted against the rolling sum of the last `segments` window segments.
    #[serde(rename_all = "camelCase")]
    SlidingWindow {
        window: GoDuration,
        segments: u32,
        permit_limit: u32,
        #[serde(default)]
        queue_limit: u32,
        #[serde(default)]
        queue_order: QueueOrder,
    },

    /// A bucket of `capacity` tokens, refilled continuously at `tokens_per_period / period`.
    #[serde(rename_all = "camelCase")]
    TokenBucket {
        capacity: u32,
        tokens_per_period: u32,
        period: GoDuration,
        #[serde(default)]
        queue_limit: u32,
        #[serde(default)]
        queue_order: QueueOrder,
    },

    /// A counting semaphore; leases must be returned when requests complete.
    #[serde(rename_all = "camelCase")]
    Concurrency {
        max_concurrent: u32,
        #[serde(default)]
        queue_limit: u32,
        #[serde(default)]
        queue_order: QueueOrder,
    },
}

/// Which queued request is admitted first when permits become available.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidPolicy {
    #[error("policy {policy}: {field} must be greater than zero")]
    Zero {
        policy: String,
        field: &'static str,
    },

    #[error("policy {policy}: a {window:?} window cannot be divided into {segments} segments")]
    Segments {
        policy: String,
        window: Duration,
        segments: u32,
    },

    #[error("policy {policy} is required but not configured")]
    Missing { policy: &'static str },
}

// === impl RateLimitPolicy ===

impl RateLimitPolicy {
    pub fn queue_limit(&self) -> u32 {
        match self {
            Self::FixedWindow { queue_limit, .. }
            | Self::SlidingWindow { queue_limit, .. }
            | Self::TokenBucket { queue_limit, .. }
            | Self::Concurrency { queue_limit, .. } => *queue_limit,
        }
    }

    pub fn queue_order(&self) -> QueueOrder {
        match self {
            Self::FixedWindow { queue_order, .. }
            | Self::SlidingWindow { queue_order, .. }
            | Self::TokenBucket { queue_order, .. }
            | Self::Concurrency { queue_order, .. } => *queue_order,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::FixedWindow { .. } => "fixed-window",
            Self::SlidingWindow { .. } => "sliding-window",
            Self::TokenBucket { .. } => "token-bucket",
            Self::Concurrency { .. } => "concurrency",
        }
    }

    /// Rejects definitions whose throttling behavior would be undefined.
    pub fn validate(&self, name: &str) -> Result<(), InvalidPolicy> {
        let nonzero = |value: u64, field: &'static str| {
            if value == 0 {
                return Err(InvalidPolicy::Zero {
                    policy: name.to_string(),
                    field,
                });
            }
            Ok(())
        };

        match self {
            Self::FixedWindow {
                window,
                permit_limit,
                ..
            } => {
                nonzero(window.as_duration().as_nanos() as u64, "window")?;
                nonzero(u64::from(*permit_limit), "permitLimit")
            }
            Self::SlidingWindow {
                window,
                segments,
                permit_limit,
                ..
            } => {
                nonzero(window.as_duration().as_nanos() as u64, "window")?;
                nonzero(u64::from(*segments), "segments")?;
                nonzero(u64::from(*permit_limit), "permitLimit")?;
                if window.as_duration() / *segments < MIN_SEGMENT {
                    return Err(InvalidPolicy::Segments {
                        policy: name.to_string(),
                        window: window.as_duration(),
                        segments: *segments,
                    });
                }
                Ok(())
            }
            Self::TokenBucket {
                capacity,
                tokens_per_period,
                period,
                ..
            } => {
                nonzero(u64::from(*capacity), "capacity")?;
                nonzero(u64::from(*tokens_per_period), "tokensPerPeriod")?;
                nonzero(period.as_duration().as_nanos() as u64, "period")
            }
            Self::Concurrency { max_concurrent, .. } => {
                nonzero(u64::from(*max_concurrent), "maxConcurrent")
            }
        }
    }
}

/// The gateway's built-in policy table.
pub fn default_policies() -> BTreeMap<String, RateLimitPolicy> {
    let mut policies = BTreeMap::new();
    policies.insert(
        LOGIN.to_string(),
        RateLimitPolicy::FixedWindow {
            window: GoDuration::from_secs(60),
            permit_limit: 5,
            queue_limit: 2,
            queue_order: QueueOrder::OldestFirst,
        },
    );
    policies.insert(
        REGISTER.to_string(),
        RateLimitPolicy::FixedWindow {
            window: GoDuration::from_secs(60 * 60),
            permit_limit: 3,
            queue_limit: 0,
            queue_order: QueueOrder::OldestFirst,
        },
    );
    policies.insert(
        API.to_string(),
        RateLimitPolicy::SlidingWindow {
            window: GoDuration::from_secs(60),
            segments: 6,
            permit_limit: 100,
            queue_limit: 10,
            queue_order: QueueOrder::OldestFirst,
        },
    );
    policies.insert(
        STRICT.to_string(),
        RateLimitPolicy::TokenBucket {
            capacity: 10,
            tokens_per_period: 2,
            period: GoDuration::from_secs(60),
            queue_limit: 0,
            queue_order: QueueOrder::OldestFirst,
        },
    );
    policies.insert(
        GLOBAL.to_string(),
        RateLimitPolicy::Concurrency {
            max_concurrent: 50,
            queue_limit: 20,
            queue_order: QueueOrder::OldestFirst,
        },
    );
    policies
}

/// Overlays `overrides` onto the default table and validates the result.
///
/// Every policy the request path refers to must remain defined.
pub fn merge_policies(
    overrides: BTreeMap<String, RateLimitPolicy>,
) -> Result<BTreeMap<String, RateLimitPolicy>, InvalidPolicy> {
    let mut policies = default_policies();
    policies.extend(overrides);
    for (name, policy) in &policies {
        policy.validate(name)?;
    }
    for required in [LOGIN, REGISTER, API, STRICT, GLOBAL] {
        if !policies.contains_key(required) {
            return Err(InvalidPolicy::Missing { policy: required });
        }
    }
    Ok(policies)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let policies = merge_policies(BTreeMap::new()).expect("defaults must validate");
        assert_eq!(policies.len(), 5);
        assert_eq!(policies[API].kind(), "sliding-window");
        assert_eq!(policies[GLOBAL].queue_limit(), 20);
    }

    #[test]
    fn deserializes_tagged_policies() {
        let json = r#"{
            "login": { "kind": "fixed-window", "window": "30s", "permitLimit": 2 },
            "strict": {
                "kind": "token-bucket",
                "capacity": 4,
                "tokensPerPeriod": 1,
                "period": "1m",
                "queueOrder": "newest-first"
            }
        }"#;
        let overrides: BTreeMap<String, RateLimitPolicy> = serde_json::from_str(json).unwrap();
        let policies = merge_policies(overrides).unwrap();
        assert_eq!(
            policies[LOGIN],
            RateLimitPolicy::FixedWindow {
                window: GoDuration::from_secs(30),
                permit_limit: 2,
                queue_limit: 0,
                queue_order: QueueOrder::OldestFirst,
            }
        );
        assert_eq!(policies[STRICT].queue_order(), QueueOrder::NewestFirst);
        assert_eq!(policies[REGISTER], default_policies()[REGISTER]);
    }

    #[test]
    fn rejects_zero_permits() {
        let overrides = maplit::btreemap! {
            API.to_string() => RateLimitPolicy::SlidingWindow {
                window: GoDuration::from_secs(60),
                segments: 6,
                permit_limit: 0,
                queue_limit: 0,
                queue_order: QueueOrder::OldestFirst,
            },
        };
        assert_eq!(
            merge_policies(overrides),
            Err(InvalidPolicy::Zero {
                policy: API.to_string(),
                field: "permitLimit",
            })
        );
    }

    #[test]
    fn rejects_oversegmented_windows() {
        let policy = RateLimitPolicy::SlidingWindow {
            window: Duration::from_millis(5).into(),
            segments: 10,
            permit_limit: 1,
            queue_limit: 0,
            queue_order: QueueOrder::OldestFirst,
        };
        assert!(matches!(
            policy.validate("tiny"),
            Err(InvalidPolicy::Segments { segments: 10, .. })
        ));
    }

    #[test]
    fn rejects_unknown_kinds() {
        let json = r#"{ "kind": "leaky-bucket", "capacity": 1 }"#;
        assert!(serde_json::from_str::<RateLimitPolicy>(json).is_err());
    }
}
