use crate::{
    core::{HEALTH_PATH, METRICS_PATH},
    empty_response,
    gate::ClientAddr,
    index::SharedProvider,
    json_response, Body,
};
use futures::future;
use hyper::{
    body::Incoming, header, http, server::conn::http1, Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use prometheus_client::registry::Registry;
use std::{convert::Infallible, num::ParseIntError, sync::Arc, task::Poll};
use tokio::{net::TcpListener, time};
use tower::ServiceExt;
use tracing::{debug, info, instrument, warn};

const READY_PATH: &str = "/ready";
const CONFIG_PATH: &str = "/config";

/// Bounds how long a `/config?after=N` request waits for a newer snapshot.
const LONG_POLL_TIMEOUT: time::Duration = time::Duration::from_secs(30);

/// Serves process health, metrics, and the current route snapshot to the data plane.
#[derive(Clone, Debug)]
pub struct Admin {
    provider: SharedProvider,
    prom: Arc<Registry>,
}

// === impl Admin ===

impl Admin {
    pub fn new(provider: SharedProvider, prom: Arc<Registry>) -> Self {
        Self { provider, prom }
    }

    fn health() -> Response<Body> {
        let body = serde_json::json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now(),
        });
        json_response(StatusCode::OK, serde_json::to_vec(&body).unwrap_or_default())
    }

    /// Ready once routes have been published.
    fn readiness(&self) -> Response<Body> {
        if self.provider.version() == 0 {
            return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
        empty_response(StatusCode::OK)
    }

    fn metrics(&self) -> Response<Body> {
        let mut text = String::new();
        if let Err(error) = prometheus_client::encoding::text::encode(&mut text, &self.prom) {
            warn!(%error, "Failed to encode metrics");
            return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
        let mut rsp = Response::new(Body::from(text));
        rsp.headers_mut().insert(
            header::CONTENT_TYPE,
            http::HeaderValue::from_static(
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            ),
        );
        rsp
    }

    /// Returns the current snapshot, first waiting for one newer than `after` if given.
    async fn config(self, after: Option<u64>) -> Response<Body> {
        let mut snapshot = self.provider.get_config();
        if let Some(after) = after {
            if snapshot.version <= after {
                let changed = self.provider.changed(&snapshot);
                if time::timeout(LONG_POLL_TIMEOUT, changed.changed())
                    .await
                    .is_err()
                {
                    return empty_response(StatusCode::NOT_MODIFIED);
                }
                snapshot = self.provider.get_config();
            }
        }

        match serde_json::to_vec(&*snapshot) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(error) => {
                warn!(%error, version = snapshot.version, "Failed to encode snapshot");
                empty_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

impl<B> tower::Service<Request<B>> for Admin {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        if req.method() != Method::GET {
            return Box::pin(future::ok(empty_response(StatusCode::METHOD_NOT_ALLOWED)));
        }

        let rsp = match req.uri().path() {
            HEALTH_PATH => Self::health(),
            READY_PATH => self.readiness(),
            METRICS_PATH => self.metrics(),
            CONFIG_PATH => {
                let after = match after_version(req.uri().query()) {
                    Ok(after) => after,
                    Err(error) => {
                        debug!(%error, "Invalid version");
                        return Box::pin(future::ok(empty_response(StatusCode::BAD_REQUEST)));
                    }
                };
                let admin = self.clone();
                return Box::pin(async move { Ok(admin.config(after).await) });
            }
            _ => empty_response(StatusCode::NOT_FOUND),
        };
        Box::pin(future::ok(rsp))
    }
}

fn after_version(query: Option<&str>) -> Result<Option<u64>, ParseIntError> {
    let after = query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .find_map(|pair| pair.strip_prefix("after="));
    after.map(str::parse).transpose()
}

/// Serves `svc` on every accepted connection until shutdown is signaled, then waits for open
/// connections to finish.
#[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
pub(crate) async fn serve<S>(listener: TcpListener, svc: S, drain: drain::Watch)
where
    S: tower::Service<Request<Incoming>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    info!("Admin server listening");
    let shutdown = drain.clone().signaled();
    tokio::pin!(shutdown);
    loop {
        let (stream, remote) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    continue;
                }
            },
            _ = &mut shutdown => {
                debug!("Stopped accepting connections");
                return;
            }
        };
        if let Err(error) = stream.set_nodelay(true) {
            debug!(%error, "Failed to set TCP_NODELAY");
        }

        let svc = svc.clone();
        let service = hyper::service::service_fn(move |mut req: Request<Incoming>| {
            req.extensions_mut().insert(ClientAddr(remote));
            svc.clone().oneshot(req)
        });
        let drain = drain.clone();
        tokio::spawn(async move {
            let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
            tokio::pin!(conn);
            let res = tokio::select! {
                res = conn.as_mut() => res,
                handle = drain.signaled() => {
                    conn.as_mut().graceful_shutdown();
                    handle.release_after(conn).await
                }
            };
            if let Err(error) = res {
                debug!(%error, %remote, "Connection closed with an error");
            }
        });
    }
}
