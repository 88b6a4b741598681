//! Negotiate server: authorizes and collects test sessions.
//!
//! The same [`NegotiateServer`] is mounted at `/negotiate/` and `/collect/`.
//! The last path segment names the test module (`/negotiate/dash`), and the
//! request body is the module's JSON request.
//!
//! Module errors are answered to the client and never reach the event loop:
//!
//! | error              | status |
//! |--------------------|--------|
//! | `DuplicateSession` | 400    |
//! | `InvalidMessage`   | 400    |
//! | `Unauthorized`     | 403    |
//! | `UnknownModule`    | 404    |
//! | anything else      | 500    |

use crate::router::{error_response, json_response, HttpHandler, HttpResponse};
use crate::transport::Connection;
use bytes::Bytes;
use hyper::{Method, Request, StatusCode};
use neubot_core::{NegotiateReply, NeubotError, NeubotResult};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A test that clients negotiate before running it.
pub trait NegotiateModule: Send + Sync {
    /// Grant `conn` a session; returns the session parameters sent back.
    fn authorize(&self, conn: &Connection, request: &Value) -> NeubotResult<Map<String, Value>>;

    /// Close the session of `conn` and return the server-side results.
    fn collect(&self, conn: &Connection, request: &Value) -> NeubotResult<Value>;

    /// Sessions authorized but neither collected nor closed yet.
    fn open_sessions(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Negotiate,
    Collect,
}

#[derive(Default)]
pub struct NegotiateServer {
    modules: RwLock<BTreeMap<String, Arc<dyn NegotiateModule>>>,
}

impl NegotiateServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_module(&self, name: &str, module: Arc<dyn NegotiateModule>) {
        debug!(module = name, "negotiate module registered");
        self.modules.write().insert(name.to_string(), module);
    }

    pub fn module(&self, name: &str) -> NeubotResult<Arc<dyn NegotiateModule>> {
        self.modules
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| NeubotError::UnknownModule(name.to_string()))
    }

    /// Open sessions per registered module.
    pub fn open_sessions(&self) -> BTreeMap<String, usize> {
        self.modules
            .read()
            .iter()
            .map(|(name, module)| (name.clone(), module.open_sessions()))
            .collect()
    }

    fn process(
        &self,
        conn: &Connection,
        verb: Verb,
        name: &str,
        body: &[u8],
    ) -> NeubotResult<Value> {
        let module = self.module(name)?;
        let request: Value = if body.iter().all(u8::is_ascii_whitespace) {
            Value::Object(Map::new())
        } else {
            serde_json::from_slice(body)
                .map_err(|e| NeubotError::InvalidMessage(format!("request body: {e}")))?
        };

        match verb {
            Verb::Negotiate => {
                let params = module.authorize(conn, &request)?;
                let reply = NegotiateReply::unchoked(conn.peer_addr().ip().to_string(), params);
                Ok(serde_json::to_value(reply)?)
            }
            Verb::Collect => module.collect(conn, &request),
        }
    }
}

fn parse_path(path: &str) -> Option<(Verb, &str)> {
    if let Some(name) = path.strip_prefix("/negotiate/") {
        Some((Verb::Negotiate, name.trim_end_matches('/')))
    } else {
        path.strip_prefix("/collect/")
            .map(|name| (Verb::Collect, name.trim_end_matches('/')))
    }
}

fn status_for(error: &NeubotError) -> StatusCode {
    match error {
        NeubotError::DuplicateSession(_) | NeubotError::InvalidMessage(_) => {
            StatusCode::BAD_REQUEST
        }
        NeubotError::Unauthorized(_) => StatusCode::FORBIDDEN,
        NeubotError::UnknownModule(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl HttpHandler for NegotiateServer {
    fn handle(&self, conn: &Connection, request: &Request<Bytes>) -> HttpResponse {
        let Some((verb, name)) = parse_path(request.uri().path()) else {
            return error_response(StatusCode::NOT_FOUND, "not found");
        };
        if request.method() != Method::POST {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "use POST");
        }

        match self.process(conn, verb, name, request.body()) {
            Ok(value) => json_response(StatusCode::OK, &value),
            Err(e) => {
                if e.is_protocol() {
                    warn!(
                        conn = conn.id(),
                        module = name,
                        ?verb,
                        error = %e,
                        "negotiate request refused"
                    );
                } else {
                    error!(
                        conn = conn.id(),
                        module = name,
                        ?verb,
                        error = %e,
                        "negotiate request failed"
                    );
                }
                error_response(status_for(&e), &e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{body_json, request};
    use crate::transport::test_connection;
    use neubot_core::session_token;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashSet;

    /// Authorizes each connection once and echoes the request on collect.
    #[derive(Default)]
    struct EchoModule {
        open: Mutex<HashSet<String>>,
    }

    impl NegotiateModule for EchoModule {
        fn authorize(
            &self,
            conn: &Connection,
            _request: &Value,
        ) -> NeubotResult<Map<String, Value>> {
            let token = session_token(conn);
            if !self.open.lock().insert(token.clone()) {
                return Err(NeubotError::DuplicateSession(token));
            }
            let mut params = Map::new();
            params.insert("authorization".into(), Value::String(token));
            Ok(params)
        }

        fn collect(&self, conn: &Connection, request: &Value) -> NeubotResult<Value> {
            let token = session_token(conn);
            if !self.open.lock().remove(&token) {
                return Err(NeubotError::Unauthorized(token));
            }
            Ok(request.clone())
        }

        fn open_sessions(&self) -> usize {
            self.open.lock().len()
        }
    }

    fn server() -> NegotiateServer {
        let server = NegotiateServer::new();
        server.register_module("echo", Arc::new(EchoModule::default()));
        server
    }

    #[test]
    fn negotiate_reply_wraps_module_params() {
        let server = server();
        let conn = test_connection(1);
        let response = server.handle(&conn, &request(Method::POST, "/negotiate/echo", ""));
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response);
        assert_eq!(body["unchoked"], json!(true));
        assert_eq!(body["queue_pos"], json!(0));
        assert_eq!(body["real_address"], json!("192.0.2.1"));
        assert_eq!(body["authorization"], json!(session_token(&*conn)));
        assert_eq!(server.open_sessions()["echo"], 1);
    }

    #[test]
    fn protocol_errors_map_to_statuses() {
        let server = server();
        let conn = test_connection(2);

        let collect = server.handle(&conn, &request(Method::POST, "/collect/echo", "{}"));
        assert_eq!(collect.status(), StatusCode::FORBIDDEN);

        let first = server.handle(&conn, &request(Method::POST, "/negotiate/echo", "{}"));
        assert_eq!(first.status(), StatusCode::OK);
        let again = server.handle(&conn, &request(Method::POST, "/negotiate/echo", "{}"));
        assert_eq!(again.status(), StatusCode::BAD_REQUEST);

        let unknown = server.handle(&conn, &request(Method::POST, "/negotiate/speedtest", "{}"));
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let garbage = server.handle(&conn, &request(Method::POST, "/collect/echo", "{not json"));
        assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn collect_returns_module_result() {
        let server = server();
        let conn = test_connection(3);
        server.handle(&conn, &request(Method::POST, "/negotiate/echo", "{}"));
        let response = server.handle(
            &conn,
            &request(Method::POST, "/collect/echo/", r#"{"rate": 42}"#),
        );
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response), json!({"rate": 42}));
    }

    #[test]
    fn get_is_rejected() {
        let server = server();
        let response =
            server.handle(&test_connection(4), &request(Method::GET, "/negotiate/echo", ""));
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn errors_on_one_connection_leave_others_alone() {
        let server = server();
        let a = test_connection(5);
        let b = test_connection(6);
        server.handle(&a, &request(Method::POST, "/negotiate/echo", "{}"));
        server.handle(&b, &request(Method::POST, "/negotiate/echo", "{}"));
        let dup = server.handle(&a, &request(Method::POST, "/negotiate/echo", "{}"));
        assert_eq!(dup.status(), StatusCode::BAD_REQUEST);
        let ok = server.handle(&b, &request(Method::POST, "/collect/echo", "{}"));
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
