//! DASH negotiate module: tracks one session per authorized connection.
//!
//! Per token: `unauthorized → open (authorize) → collected (collect) | closed
//! (connection lost)`. Both terminal states remove the session. A collected
//! token stays retired while its connection lives, so a keep-alive client
//! cannot negotiate it again; once the connection closes the token can never
//! be presented again because every connection has its own identity.
//!
//! `collect` and the close callback race only in wall-clock time. Both run on
//! the event loop and both look up and remove the session under one lock, so
//! exactly one of them finds it.

use crate::backend::StorageBackend;
use crate::negotiate::NegotiateModule;
use crate::transport::Connection;
use neubot_core::{session_token, DashRecord, NeubotError, NeubotResult};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Port advertised in the authorization payload.
pub const DASH_PORT: u16 = 8080;

/// Key under which collected sessions are stored.
pub const DASH_TEST: &str = "dash";

/// Server-side state of one DASH test.
#[derive(Debug, Clone, Default)]
pub struct DashSession {
    pub iteration: u32,
    /// Side data produced by the measurement step, if any.
    pub artifact_path: Option<PathBuf>,
    /// Measurement records in append order.
    pub measurements: Vec<Value>,
}

impl DashSession {
    /// Flush pending side data into the measurements.
    fn finalize(&mut self) {
        if let Some(path) = self.artifact_path.take() {
            self.measurements
                .push(json!({ "artifact_path": path.display().to_string() }));
        }
    }
}

/// Open sessions plus the collected tokens of still-live connections.
#[derive(Debug, Default)]
struct Sessions {
    open: HashMap<String, DashSession>,
    retired: HashSet<String>,
}

type SessionTable = Arc<Mutex<Sessions>>;

pub struct DashNegotiateServer {
    sessions: SessionTable,
    backend: Arc<dyn StorageBackend>,
}

impl DashNegotiateServer {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(Sessions::default())),
            backend,
        }
    }

    /// Decide the rate ladder for a session. The client's proposal is
    /// accepted as is.
    fn negotiate_rates(&self, proposal: &Value) -> Value {
        proposal.clone()
    }

    /// Run one measurement step against the open session `token`.
    pub fn with_session<R>(
        &self,
        token: &str,
        step: impl FnOnce(&mut DashSession) -> R,
    ) -> NeubotResult<R> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .open
            .get_mut(token)
            .ok_or_else(|| NeubotError::Unauthorized(token.to_string()))?;
        Ok(step(session))
    }
}

/// Close callback: forget the connection's token and drop its session if it
/// went away uncollected.
///
/// Returns whether a session was removed.
fn connection_lost(sessions: &SessionTable, conn: &Connection) -> bool {
    let token = session_token(conn);
    let mut sessions = sessions.lock();
    sessions.retired.remove(&token);
    // A collected session is already gone; that is the normal case.
    if sessions.open.remove(&token).is_some() {
        warn!(conn = conn.id(), token = %token, "dash: del session (ERR)");
        true
    } else {
        false
    }
}

impl NegotiateModule for DashNegotiateServer {
    fn authorize(&self, conn: &Connection, request: &Value) -> NeubotResult<Map<String, Value>> {
        let token = session_token(conn);
        let proposal = request
            .get("dash_rates")
            .ok_or_else(|| NeubotError::InvalidMessage("missing dash_rates".into()))?;
        let rates = self.negotiate_rates(proposal);

        {
            let mut sessions = self.sessions.lock();
            if sessions.open.contains_key(&token) || sessions.retired.contains(&token) {
                return Err(NeubotError::DuplicateSession(token));
            }
            sessions.open.insert(token.clone(), DashSession::default());
        }

        // Reached once per connection, since its token can be authorized only
        // once. Registered outside the lock: on a connection that is already
        // closed the callback runs right away.
        let sessions = self.sessions.clone();
        conn.at_close(Box::new(move |conn: &Connection| {
            connection_lost(&sessions, conn);
        }));
        debug!(conn = conn.id(), token = %token, "dash: add session");

        let mut params = Map::new();
        params.insert("authorization".into(), Value::String(token));
        params.insert("port".into(), json!(DASH_PORT));
        params.insert("dash_rates".into(), rates);
        Ok(params)
    }

    fn collect(&self, conn: &Connection, request: &Value) -> NeubotResult<Value> {
        let token = session_token(conn);
        // Lookup, removal and retirement are one step: a second collect finds
        // nothing and a second authorize is refused.
        let mut session = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .open
                .remove(&token)
                .ok_or_else(|| NeubotError::Unauthorized(token.clone()))?;
            sessions.retired.insert(token.clone());
            session
        };
        session.finalize();
        debug!(conn = conn.id(), token = %token, "dash: del session (OK)");

        let record = DashRecord::new(request.clone(), session.measurements.clone());
        self.backend
            .store(DASH_TEST, &serde_json::to_value(&record)?)?;

        Ok(Value::Array(session.measurements))
    }

    fn open_sessions(&self) -> usize {
        self.sessions.lock().open.len()
    }
}
