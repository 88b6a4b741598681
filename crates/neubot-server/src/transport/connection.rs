//! Per-connection handle shared by the transport and the protocol handlers.

use neubot_core::StreamIdentity;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Callback run once when the connection goes away.
pub type CloseCallback = Box<dyn FnOnce(&Connection) + Send>;

pub type ConnectionHandle = Arc<Connection>;

/// Hands out connection ids; one allocator per event loop.
#[derive(Debug, Default)]
pub struct ConnectionIds {
    next: AtomicU64,
}

impl ConnectionIds {
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// One accepted stream.
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    local: SocketAddr,
    /// `None` once the connection has been closed.
    at_close: Mutex<Option<Vec<CloseCallback>>>,
}

impl Connection {
    pub fn new(id: u64, peer: SocketAddr, local: SocketAddr) -> ConnectionHandle {
        Arc::new(Self {
            id,
            peer,
            local,
            at_close: Mutex::new(Some(Vec::new())),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Subscribe to the close notification.
    ///
    /// On an already closed connection the callback runs immediately.
    pub fn at_close(&self, callback: CloseCallback) {
        let mut guard = self.at_close.lock();
        match guard.as_mut() {
            Some(callbacks) => callbacks.push(callback),
            None => {
                drop(guard);
                callback(self);
            }
        }
    }

    /// Mark the connection closed and run the subscribed callbacks in
    /// registration order. Later calls do nothing.
    pub fn close(&self) {
        let callbacks = self.at_close.lock().take();
        if let Some(callbacks) = callbacks {
            trace!(conn = self.id, count = callbacks.len(), "running close callbacks");
            for callback in callbacks {
                callback(self);
            }
        }
    }

    /// Callbacks waiting for the close notification.
    #[cfg(test)]
    pub(crate) fn pending_close_callbacks(&self) -> usize {
        self.at_close.lock().as_ref().map_or(0, Vec::len)
    }
}

impl StreamIdentity for Connection {
    fn identity_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&self.id.to_be_bytes());
        bytes.extend_from_slice(self.peer.to_string().as_bytes());
        bytes.push(b'|');
        bytes.extend_from_slice(self.local.to_string().as_bytes());
        bytes
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("local", &self.local)
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_connection(id: u64) -> ConnectionHandle {
    let peer: SocketAddr = format!("192.0.2.1:{}", 40000 + id).parse().unwrap();
    let local: SocketAddr = "198.51.100.7:8080".parse().unwrap();
    Connection::new(id, peer, local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use neubot_core::session_token;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn close_runs_callbacks_once_in_order() {
        let conn = test_connection(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            conn.at_close(Box::new(move |_: &Connection| order.lock().push(i)));
        }
        conn.close();
        conn.close();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn subscribe_after_close_runs_immediately() {
        let conn = test_connection(2);
        conn.close();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        conn.at_close(Box::new(move |_: &Connection| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_may_inspect_connection() {
        let conn = test_connection(3);
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        conn.at_close(Box::new(move |c: &Connection| *s.lock() = Some(session_token(c))));
        conn.close();
        assert_eq!(seen.lock().clone(), Some(session_token(&*conn)));
    }

    #[test]
    fn close_clears_pending_callbacks() {
        let conn = test_connection(4);
        conn.at_close(Box::new(|_: &Connection| {}));
        assert_eq!(conn.pending_close_callbacks(), 1);
        conn.close();
        assert_eq!(conn.pending_close_callbacks(), 0);
    }

    #[test]
    fn ids_are_unique() {
        let ids = ConnectionIds::default();
        let a = ids.next();
        let b = ids.next();
        assert_ne!(a, b);
    }

    #[test]
    fn tokens_differ_between_connections() {
        let ids = ConnectionIds::default();
        let peer: SocketAddr = "192.0.2.1:40000".parse().unwrap();
        let local: SocketAddr = "198.51.100.7:8080".parse().unwrap();
        // Same addresses (port reuse after close) still yield a new token.
        let first = Connection::new(ids.next(), peer, local);
        let second = Connection::new(ids.next(), peer, local);
        assert_ne!(session_token(&*first), session_token(&*second));
        assert_eq!(session_token(&*first), session_token(&*first));
    }
}
