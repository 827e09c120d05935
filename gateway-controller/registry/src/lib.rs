#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! A read-only client for the Consul catalog and health HTTP APIs.
//!
//! Only `http://` agents are supported; the client is expected to talk to a local agent or a
//! sidecar. Request deadlines are imposed by the caller.

mod catalog;

use self::catalog::{CatalogServices, HealthEntry};
use bytes::Bytes;
use gateway_controller_core::{DiscoverRegistry, ServiceInstance};
use http::{header, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use serde::de::DeserializeOwned;
use std::{fmt, time::Duration};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ConsulClient {
    base: String,
    datacenter: Option<String>,
    client: Client<HttpConnector, Empty<Bytes>>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid registry address: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    #[error("unsupported registry address {0}: only http:// is supported")]
    UnsupportedScheme(String),

    #[error("invalid service name: {0:?}")]
    InvalidServiceName(String),

    #[error("failed to build request: {0}")]
    Http(#[from] http::Error),

    #[error("request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("failed to read response body: {0}")]
    Body(#[from] hyper::Error),

    #[error("registry responded with {0}")]
    Status(StatusCode),

    #[error("malformed registry response: {0}")]
    Decode(#[from] serde_json::Error),
}

// === impl ConsulClient ===

impl ConsulClient {
    pub fn new(addr: &str, datacenter: Option<String>) -> Result<Self, Error> {
        let uri = addr.parse::<Uri>()?;
        if uri.scheme_str() != Some("http") || uri.authority().is_none() {
            return Err(Error::UnsupportedScheme(addr.to_string()));
        }

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            base: addr.trim_end_matches('/').to_string(),
            datacenter,
            client,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let mut uri = format!("{}{}", self.base, path);
        if let Some(dc) = &self.datacenter {
            uri.push(if path.contains('?') { '&' } else { '?' });
            uri.push_str("dc=");
            uri.push_str(dc);
        }

        let req = Request::get(uri.parse::<Uri>()?)
            .header(header::ACCEPT, "application/json")
            .body(Empty::new())?;
        let rsp = self.client.request(req).await?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(Error::Status(status));
        }

        let body = rsp.into_body().collect().await?.to_bytes();
        Ok(serde_json::from_slice(&body)?)
    }
}

impl fmt::Debug for ConsulClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsulClient")
            .field("base", &self.base)
            .field("datacenter", &self.datacenter)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl DiscoverRegistry for ConsulClient {
    async fn list_services(&self) -> anyhow::Result<Vec<String>> {
        let services = self.get::<CatalogServices>("/v1/catalog/services").await?;
        Ok(services.into_keys().collect())
    }

    async fn list_healthy_instances(&self, service: &str) -> anyhow::Result<Vec<ServiceInstance>> {
        if !is_valid_service_name(service) {
            return Err(Error::InvalidServiceName(service.to_string()).into());
        }
        let path = format!("/v1/health/service/{service}?passing=true");
        let entries = self.get::<Vec<HealthEntry>>(&path).await?;
        Ok(entries.into_iter().map(ServiceInstance::from).collect())
    }
}

/// Consul service names are DNS-compatible; anything else would need escaping in the URI path.
fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_http_agent_address() {
        assert!(ConsulClient::new("http://127.0.0.1:8500", None).is_ok());
        assert!(matches!(
            ConsulClient::new("https://consul.example.com", None),
            Err(Error::UnsupportedScheme(_))
        ));
        assert!(matches!(
            ConsulClient::new("127.0.0.1:8500", None),
            Err(Error::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn validates_service_names() {
        assert!(is_valid_service_name("user-service"));
        assert!(is_valid_service_name("svc_1.v2"));
        assert!(!is_valid_service_name(""));
        assert!(!is_valid_service_name("../agent/self"));
        assert!(!is_valid_service_name("a b"));
    }

    #[tokio::test]
    async fn rejects_invalid_names_without_a_request() {
        let client = ConsulClient::new("http://127.0.0.1:1", None).unwrap();
        let error = client
            .list_healthy_instances("../secrets")
            .await
            .expect_err("name must be rejected");
        assert!(error.downcast_ref::<Error>().is_some());
    }
}
