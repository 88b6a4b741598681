//! JSON payloads of the negotiate protocol and the stored DASH record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Schema version written into every stored DASH record.
pub const DASH_SCHEMA_VERSION: u32 = 3;

/// Reply to `POST /negotiate/<module>`.
///
/// The dispatcher fields come first; whatever the module returned (the
/// authorization token and negotiated parameters) is flattened next to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiateReply {
    pub unchoked: bool,
    pub queue_pos: u32,
    pub real_address: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl NegotiateReply {
    /// An immediate unchoke: the server does not queue clients.
    pub fn unchoked(real_address: String, params: Map<String, Value>) -> Self {
        Self {
            unchoked: true,
            queue_pos: 0,
            real_address,
            params,
        }
    }
}

/// Result record persisted for one collected DASH session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashRecord {
    pub srvr_schema_version: u32,
    pub srvr_timestamp: u64,
    /// Raw client request body, stored verbatim.
    pub client: Value,
    /// Server-side measurements in append order.
    pub server: Vec<Value>,
}

impl DashRecord {
    pub fn new(client: Value, server: Vec<Value>) -> Self {
        Self {
            srvr_schema_version: DASH_SCHEMA_VERSION,
            srvr_timestamp: server_timestamp(),
            client,
            server,
        }
    }
}

/// Seconds since the Unix epoch.
pub fn server_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
