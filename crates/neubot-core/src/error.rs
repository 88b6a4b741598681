use std::net::SocketAddr;
use thiserror::Error;

/// Errors produced by the neubot server and its negotiate protocol.
#[derive(Debug, Error)]
pub enum NeubotError {
    /// A connection asked to be authorized while its session is still open.
    #[error("multiple unchokes: {0}")]
    DuplicateSession(String),

    /// Collect (or a measurement step) without an open session.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("unknown negotiate module: {0}")]
    UnknownModule(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Malformed command line; the binary answers with the usage text.
    #[error("usage error: {0}")]
    Usage(String),

    #[error("you must be root")]
    NotPrivileged,

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("privilege drop failed: {0}")]
    Privilege(String),

    #[error("daemonize failed: {0}")]
    Daemon(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl NeubotError {
    /// Whether the error belongs to a single negotiate exchange rather than
    /// to the process. Protocol errors are answered to the client and never
    /// stop the server.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            NeubotError::DuplicateSession(_)
                | NeubotError::Unauthorized(_)
                | NeubotError::UnknownModule(_)
                | NeubotError::InvalidMessage(_)
        )
    }
}

pub type NeubotResult<T> = Result<T, NeubotError>;
