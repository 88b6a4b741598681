//! HTTP/1.1 listener using hyper.
//!
//! Each accepted TCP stream becomes one [`Connection`]. Keep-alive requests
//! on that stream share the connection, so a client that negotiates, runs a
//! test and collects over one stream keeps the same session token. When hyper
//! finishes with the stream the connection's close callbacks run.

use super::connection::{Connection, ConnectionIds};
use crate::router::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Pause after a failed accept (usually EMFILE) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept connections forever, serving each one in its own task.
pub async fn accept_loop(listener: TcpListener, router: Arc<Router>, ids: Arc<ConnectionIds>) {
    let local = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "listener has no local address");
            return;
        }
    };
    info!(addr = %local, "HTTP listener started");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let conn = Connection::new(ids.next(), peer, local);
                let router = router.clone();
                tokio::spawn(serve_connection(stream, conn, router));
            }
            Err(e) => {
                error!(addr = %local, error = %e, "TCP accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Serve HTTP on one stream until the peer goes away, then close `conn`.
pub async fn serve_connection(stream: TcpStream, conn: Arc<Connection>, router: Arc<Router>) {
    debug!(
        conn = conn.id(),
        peer = %conn.peer_addr(),
        local = %conn.local_addr(),
        "connection accepted"
    );

    let service = {
        let conn = conn.clone();
        service_fn(move |request: Request<Incoming>| {
            let conn = conn.clone();
            let router = router.clone();
            async move { Ok::<_, Infallible>(router.dispatch(&conn, request).await) }
        })
    };

    if let Err(e) = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(conn = conn.id(), error = %e, "connection error");
    }

    debug!(conn = conn.id(), "connection closed");
    conn.close();
}
