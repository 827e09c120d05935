use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{sync::Arc, time::Duration};

/// Used when a limiter cannot tell when a permit will become available.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

const MESSAGE: &str = "Too many requests, please try again later";

/// A request was not admitted by a rate-limit policy.
#[derive(Clone, Debug, thiserror::Error)]
#[error("rate limit exceeded for policy {policy}")]
pub struct Rejected {
    policy: Arc<str>,
    retry_after: Option<Duration>,
}

/// The JSON body of a `429 Too Many Requests` response.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub success: bool,
    pub message: String,
    pub error: &'static str,

    /// Whole seconds until the client should retry.
    pub retry_after: u64,
    pub timestamp: DateTime<Utc>,
}

// === impl Rejected ===

impl Rejected {
    pub(crate) fn new(policy: Arc<str>, retry_after: Option<Duration>) -> Self {
        Self {
            policy,
            retry_after,
        }
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }

    /// The limiter's estimate of when a permit becomes available, if it has one.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// The retry hint rounded up to whole seconds, never less than one.
    pub fn retry_after_secs(&self) -> u64 {
        let retry_after = self.retry_after.unwrap_or(DEFAULT_RETRY_AFTER);
        let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
        secs.max(1)
    }

    pub fn body(&self) -> RejectionBody {
        RejectionBody::new(self.retry_after_secs())
    }
}

// === impl RejectionBody ===

impl RejectionBody {
    pub fn new(retry_after: u64) -> Self {
        Self {
            success: false,
            message: MESSAGE.to_string(),
            error: "Too Many Requests",
            retry_after,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|error| {
            tracing::error!(%error, "Failed to serialize rejection");
            Vec::new()
        })
    }
}
