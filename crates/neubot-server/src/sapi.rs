//! Server-side API, polled by monitoring probes.

use crate::negotiate::NegotiateServer;
use crate::router::{error_response, json_response, HttpHandler, HttpResponse};
use crate::transport::Connection;
use bytes::Bytes;
use hyper::{Method, Request, StatusCode};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const SAPI_PATH: &str = "/sapi";

/// Body of `GET /sapi/state`.
#[derive(Debug, Serialize)]
pub struct ServerState {
    pub version: &'static str,
    pub negotiate: bool,
    pub open_sessions: BTreeMap<String, usize>,
}

pub struct ServerSideApi {
    negotiate: Option<Arc<NegotiateServer>>,
}

impl ServerSideApi {
    pub fn new(negotiate: Option<Arc<NegotiateServer>>) -> Self {
        Self { negotiate }
    }

    pub fn state(&self) -> ServerState {
        ServerState {
            version: env!("CARGO_PKG_VERSION"),
            negotiate: self.negotiate.is_some(),
            open_sessions: self
                .negotiate
                .as_ref()
                .map(|n| n.open_sessions())
                .unwrap_or_default(),
        }
    }
}

impl HttpHandler for ServerSideApi {
    fn handle(&self, _conn: &Connection, request: &Request<Bytes>) -> HttpResponse {
        if request.method() != Method::GET {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "use GET");
        }
        match request.uri().path().trim_end_matches('/') {
            "/sapi" => json_response(StatusCode::OK, &json!(["/sapi", "/sapi/state"])),
            "/sapi/state" => match serde_json::to_value(self.state()) {
                Ok(state) => json_response(StatusCode::OK, &state),
                Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            },
            _ => error_response(StatusCode::NOT_FOUND, "not found"),
        }
    }
}
