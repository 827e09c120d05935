use gateway_controller_core::{
    ratelimit::{API, LOGIN, REGISTER, STRICT},
    HEALTH_PATH, METRICS_PATH,
};
use http::HeaderMap;
use std::net::SocketAddr;

const UNKNOWN: &str = "unknown";

static X_FORWARDED_FOR: http::HeaderName = http::HeaderName::from_static("x-forwarded-for");
static X_REAL_IP: http::HeaderName = http::HeaderName::from_static("x-real-ip");

/// Identifies the client a request is partitioned by.
///
/// The first address in `X-Forwarded-For` wins, then `X-Real-IP`, then the connection's remote
/// address. Headers are trusted as-is; the gateway is expected to sit behind a proxy that sets
/// them.
pub fn resolve_client_key(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .find(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    if let Some(ip) = headers
        .get(&X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return ip.to_string();
    }

    remote_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Selects the named policy that throttles requests to `path`, if any.
pub fn policy_for_path(path: &str) -> Option<&'static str> {
    let path = path.to_ascii_lowercase();
    if path.contains("/api/users/login") {
        return Some(LOGIN);
    }
    if path.contains("/api/users/register") {
        return Some(REGISTER);
    }
    if ["/api/users/admin", "/api/users/delete", "/api/users/reset-password"]
        .iter()
        .any(|p| path.contains(p))
    {
        return Some(STRICT);
    }
    if path.starts_with("/api/") {
        return Some(API);
    }
    None
}

/// Health and metrics endpoints are never throttled.
pub fn is_exempt(path: &str) -> bool {
    [HEALTH_PATH, METRICS_PATH].iter().any(|exempt| {
        path.get(..exempt.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(exempt))
            && matches!(path.as_bytes().get(exempt.len()), None | Some(b'/') | Some(b'?'))
    })
}
