//! DASH measurement step: serves video-like chunks to authorized clients.
//!
//! `GET /dash/download[/<bytes>]` with `Authorization: <token>`. Each chunk
//! bumps the session iteration and appends one measurement record.

use super::negotiate::DashNegotiateServer;
use crate::router::{error_response, HttpHandler, HttpResponse};
use crate::transport::Connection;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use neubot_core::{server_timestamp, NeubotError};
use rand::RngCore;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DOWNLOAD_PATH: &str = "/dash/download";

const DEFAULT_CHUNK: usize = 1024;
const MAX_CHUNK: usize = 10 * 1024 * 1024;

/// Chunks a single session may download before it must collect.
pub const MAX_ITERATIONS: u32 = 60;

pub struct DashServer {
    negotiate: Arc<DashNegotiateServer>,
}

impl DashServer {
    pub fn new(negotiate: Arc<DashNegotiateServer>) -> Self {
        Self { negotiate }
    }
}

/// Requested chunk size, `None` if the path is not a download path.
fn chunk_size(path: &str) -> Option<Result<usize, StatusCode>> {
    let rest = path.strip_prefix(DOWNLOAD_PATH)?;
    let rest = rest.trim_matches('/');
    if rest.is_empty() {
        return Some(Ok(DEFAULT_CHUNK));
    }
    Some(match rest.parse::<usize>() {
        Ok(n) => Ok(n.min(MAX_CHUNK)),
        Err(_) => Err(StatusCode::BAD_REQUEST),
    })
}

impl HttpHandler for DashServer {
    fn handle(&self, conn: &Connection, request: &Request<Bytes>) -> HttpResponse {
        let size = match chunk_size(request.uri().path()) {
            None => return error_response(StatusCode::NOT_FOUND, "not found"),
            Some(Err(status)) => return error_response(status, "invalid chunk size"),
            Some(Ok(size)) => size,
        };
        if request.method() != Method::GET {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "use GET");
        }

        let Some(token) = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        else {
            return error_response(StatusCode::FORBIDDEN, "missing authorization");
        };

        let step = self.negotiate.with_session(token, |session| {
            if session.iteration >= MAX_ITERATIONS {
                return Err(session.iteration);
            }
            session.iteration += 1;
            session.measurements.push(json!({
                "iteration": session.iteration,
                "timestamp": server_timestamp(),
                "bytes": size,
            }));
            Ok(session.iteration)
        });

        match step {
            Ok(Ok(iteration)) => {
                debug!(conn = conn.id(), iteration, bytes = size, "dash: chunk");
                let mut chunk = vec![0u8; size];
                rand::thread_rng().fill_bytes(&mut chunk);
                let mut response = Response::new(Full::new(Bytes::from(chunk)));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
                response
            }
            Ok(Err(iteration)) => {
                warn!(conn = conn.id(), iteration, "dash: too many iterations");
                error_response(StatusCode::TOO_MANY_REQUESTS, "too many iterations")
            }
            Err(e @ NeubotError::Unauthorized(_)) => {
                warn!(conn = conn.id(), "dash: download without session");
                error_response(StatusCode::FORBIDDEN, &e.to_string())
            }
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        }
    }
}
