use crate::{
    admission::{
        is_exempt, policy_for_path, resolve_client_key, AdmissionController, Lease, Rejected,
    },
    core::{ratelimit::GLOBAL, AccessClass, AuthorizationGate},
    json_response,
    token::TokenVerifier,
    Body,
};
use futures::future;
use hyper::{header, http, Request, Response, StatusCode};
use std::{
    net::SocketAddr,
    sync::Arc,
    task::{Context, Poll},
};
use tracing::{debug, info};

/// The remote address of the connection a request arrived on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// Admits requests before they reach the inner service.
///
/// Requests are throttled by the global per-client concurrency limit and then by the named policy
/// for their path. Requests to protected paths must carry a valid bearer token, and admin-only
/// paths additionally require the admin role. The inner service receives the path's
/// [`AccessClass`], and the token's [`Claims`](crate::Claims) when one was verified, as request
/// extensions.
#[derive(Clone, Debug)]
pub struct GateLayer {
    admission: Arc<AdmissionController>,
    authz: Arc<AuthorizationGate>,
    tokens: Arc<TokenVerifier>,
}

#[derive(Clone, Debug)]
pub struct Gate<S> {
    inner: S,
    admission: Arc<AdmissionController>,
    authz: Arc<AuthorizationGate>,
    tokens: Arc<TokenVerifier>,
}

// === impl GateLayer ===

impl GateLayer {
    pub fn new(
        admission: Arc<AdmissionController>,
        authz: AuthorizationGate,
        tokens: TokenVerifier,
    ) -> Self {
        Self {
            admission,
            authz: Arc::new(authz),
            tokens: Arc::new(tokens),
        }
    }
}

impl<S> tower::Layer<S> for GateLayer {
    type Service = Gate<S>;

    fn layer(&self, inner: S) -> Gate<S> {
        Gate {
            inner,
            admission: self.admission.clone(),
            authz: self.authz.clone(),
            tokens: self.tokens.clone(),
        }
    }
}

// === impl Gate ===

impl<S, B> tower::Service<Request<B>> for Gate<S>
where
    S: tower::Service<Request<B>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
    B: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        if is_exempt(req.uri().path()) {
            return Box::pin(self.inner.call(req));
        }

        // Take the service that was driven to readiness, leaving a clone in its place.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let admission = self.admission.clone();
        let authz = self.authz.clone();
        let tokens = self.tokens.clone();
        Box::pin(async move {
            let path = req.uri().path().to_string();
            let remote = req.extensions().get::<ClientAddr>().map(|ClientAddr(a)| *a);
            let client = resolve_client_key(req.headers(), remote);

            let global = match admission.acquire(GLOBAL, &client).await {
                Ok(lease) => lease,
                Err(rejected) => return Ok(too_many_requests(&rejected, &client)),
            };
            let policy = match policy_for_path(&path) {
                Some(policy) => match admission.acquire(policy, &client).await {
                    Ok(lease) => lease,
                    Err(rejected) => return Ok(too_many_requests(&rejected, &client)),
                },
                None => Lease::default(),
            };

            let class = authz.classify(&path);
            if class != AccessClass::Public {
                let Some(credentials) = credentials(req.headers()) else {
                    debug!(%client, %path, "Missing credentials");
                    return Ok(unauthorized(
                        "Missing Authorization header",
                        "Unauthorized",
                    ));
                };
                let verified = bearer_token(credentials)
                    .ok_or_else(|| "not a bearer token".to_string())
                    .and_then(|token| tokens.verify(token).map_err(|e| e.to_string()));
                let claims = match verified {
                    Ok(claims) => claims,
                    Err(error) => {
                        info!(%client, %path, %error, "Invalid credentials");
                        return Ok(unauthorized(
                            "Unauthorized. Please provide a valid JWT token.",
                            "Missing or invalid Authorization header",
                        ));
                    }
                };
                if class == AccessClass::AdminOnly && !claims.is_admin() {
                    info!(
                        %client,
                        %path,
                        sub = ?claims.sub,
                        role = ?claims.role,
                        "Admin role required"
                    );
                    return Ok(forbidden());
                }
                debug!(%path, sub = ?claims.sub, "Authenticated");
                req.extensions_mut().insert(claims);
            }
            req.extensions_mut().insert(class);

            // Leases are held until the inner service completes, however it completes.
            let rsp = inner.call(req).await;
            drop((policy, global));
            rsp
        })
    }
}

/// Returns the `Authorization` header value, unless it is missing or blank.
fn credentials(headers: &http::HeaderMap) -> Option<&http::HeaderValue> {
    headers
        .get(header::AUTHORIZATION)
        .filter(|v| !v.as_bytes().iter().all(u8::is_ascii_whitespace))
}

fn bearer_token(credentials: &http::HeaderValue) -> Option<&str> {
    let (scheme, token) = credentials.to_str().ok()?.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn too_many_requests(rejected: &Rejected, client: &str) -> Response<Body> {
    debug!(policy = rejected.policy(), %client, "Rate limited");
    let body = rejected.body();
    let mut rsp = json_response(StatusCode::TOO_MANY_REQUESTS, body.to_json());
    rsp.headers_mut()
        .insert(header::RETRY_AFTER, http::HeaderValue::from(body.retry_after));
    rsp
}

fn unauthorized(message: &str, error: &str) -> Response<Body> {
    let body = serde_json::json!({
        "success": false,
        "message": message,
        "error": error,
    });
    json_response(
        StatusCode::UNAUTHORIZED,
        serde_json::to_vec(&body).unwrap_or_default(),
    )
}

fn forbidden() -> Response<Body> {
    let body = serde_json::json!({
        "success": false,
        "message": "Forbidden. Admin access required.",
        "error": "Insufficient permissions",
    });
    json_response(
        StatusCode::FORBIDDEN,
        serde_json::to_vec(&body).unwrap_or_default(),
    )
}
