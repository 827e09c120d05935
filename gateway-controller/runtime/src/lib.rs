#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use gateway_controller_admission as admission;
pub use gateway_controller_core as core;
pub use gateway_controller_index as index;
pub use gateway_controller_registry as registry;

mod admin;
mod args;
mod gate;
mod token;
mod watcher;

pub use self::{
    admin::Admin,
    args::Args,
    gate::{ClientAddr, Gate, GateLayer},
    token::{Claims, TokenVerifier},
    watcher::{Backoff, RegistryWatcher, WatcherConfig, WatcherMetrics},
};

use bytes::Bytes;
use hyper::{header, http, Response, StatusCode};

type Body = http_body_util::Full<Bytes>;

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Body> {
    let mut rsp = Response::new(Body::from(body));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    rsp
}

fn empty_response(status: StatusCode) -> Response<Body> {
    let mut rsp = Response::new(Body::default());
    *rsp.status_mut() = status;
    rsp
}
