//! neubot-core: shared protocol library for the neubot server.
//!
//! Provides the error taxonomy, the session identity function that turns a
//! connection into a negotiate token, and the serde payloads exchanged by the
//! negotiate/collect protocol.

pub mod error;
pub mod identity;
pub mod messages;

// Re-export commonly used items at crate root.
pub use error::{NeubotError, NeubotResult};
pub use identity::{session_token, StreamIdentity};
pub use messages::{server_timestamp, DashRecord, NegotiateReply, DASH_SCHEMA_VERSION};
