//! Virtual host router: maps URL path prefixes to handlers.
//!
//! Handlers are synchronous. The router collects the request body first, so
//! by the time a handler runs it has everything it needs and never awaits.

use crate::config::ServerConfig;
use crate::transport::Connection;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Largest request body accepted on the shared listener (1 MiB).
pub const MAX_BODY_SIZE: usize = 1_048_576;

pub type HttpResponse = Response<Full<Bytes>>;

/// A child server mounted under a path prefix.
pub trait HttpHandler: Send + Sync {
    fn handle(&self, conn: &Connection, request: &Request<Bytes>) -> HttpResponse;
}

pub struct Router {
    children: Vec<(String, Arc<dyn HttpHandler>)>,
    rootdir: Option<PathBuf>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
            rootdir: None,
        }
    }

    /// Apply the `http_rootdir` setting. `None` turns filesystem serving off.
    pub fn configure(&mut self, config: &ServerConfig) {
        self.rootdir = config.http_rootdir.clone();
        debug!(rootdir = ?self.rootdir, "router configured");
    }

    pub fn serves_filesystem(&self) -> bool {
        self.rootdir.is_some()
    }

    /// Mount `handler` under `prefix`. A later registration of the same
    /// prefix replaces the earlier one.
    pub fn register_child(&mut self, prefix: &str, handler: Arc<dyn HttpHandler>) {
        self.children.retain(|(p, _)| p != prefix);
        self.children.push((prefix.to_string(), handler));
        debug!(prefix, "registered child");
    }

    pub fn prefixes(&self) -> Vec<&str> {
        self.children.iter().map(|(p, _)| p.as_str()).collect()
    }

    /// Collect the body of an incoming request and route it.
    pub async fn dispatch(&self, conn: &Connection, request: Request<Incoming>) -> HttpResponse {
        let (parts, body) = request.into_parts();
        let body = match Limited::new(body, MAX_BODY_SIZE).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(conn = conn.id(), error = %e, "cannot read request body");
                return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
            }
        };
        self.route(conn, &Request::from_parts(parts, body))
    }

    /// Pick the child with the longest matching prefix.
    pub fn route(&self, conn: &Connection, request: &Request<Bytes>) -> HttpResponse {
        let path = request.uri().path();
        let child = self
            .children
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());

        match (child, &self.rootdir) {
            (Some((_, handler)), _) => handler.handle(conn, request),
            (None, Some(root)) => serve_file(root, request),
            (None, None) => error_response(StatusCode::NOT_FOUND, "not found"),
        }
    }
}

fn serve_file(root: &Path, request: &Request<Bytes>) -> HttpResponse {
    if request.method() != Method::GET {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }
    let relative = request.uri().path().trim_start_matches('/');
    if relative.split('/').any(|part| part == "..") {
        return error_response(StatusCode::FORBIDDEN, "forbidden");
    }
    let mut path = root.join(relative);
    if path.is_dir() {
        path = path.join("index.html");
    }
    match std::fs::read(&path) {
        Ok(content) => {
            let mut response = Response::new(Full::new(Bytes::from(content)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type(&path)));
            response
        }
        Err(_) => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

pub fn json_response(status: StatusCode, value: &Value) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::from(value.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub fn error_response(status: StatusCode, message: &str) -> HttpResponse {
    json_response(status, &json!({ "error": message }))
}

#[cfg(test)]
pub(crate) fn request(method: Method, uri: &str, body: &str) -> Request<Bytes> {
    let mut request = Request::new(Bytes::from(body.to_string()));
    *request.method_mut() = method;
    *request.uri_mut() = uri.parse().unwrap();
    request
}

#[cfg(test)]
pub(crate) fn body_bytes(response: HttpResponse) -> Bytes {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
        .block_on(async { response.into_body().collect().await.unwrap().to_bytes() })
}

#[cfg(test)]
pub(crate) fn body_json(response: HttpResponse) -> Value {
    serde_json::from_slice(&body_bytes(response)).unwrap()
}
