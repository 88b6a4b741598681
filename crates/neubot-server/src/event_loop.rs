//! The server's single event loop.
//!
//! One `current_thread` tokio runtime drives every listener, every connection
//! and every protocol callback, so handlers that touch the same session are
//! strictly ordered. Sockets are bound with [`bind_listener`] while the
//! process is still privileged; the runtime itself is only built after
//! daemonizing, because forking a running runtime is not sound.

use crate::router::Router;
use crate::transport::http::accept_loop;
use crate::transport::ConnectionIds;
use neubot_core::{NeubotError, NeubotResult};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, info};

const LISTEN_BACKLOG: i32 = 128;

/// Bind a listening TCP socket.
///
/// IPv6 sockets are v6-only so that `::` and `0.0.0.0` can share a port.
pub fn bind_listener(addr: SocketAddr) -> std::io::Result<StdTcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Cloneable request-to-stop handle, usable before the loop exists.
#[derive(Clone)]
pub struct LoopHandle {
    stop: Arc<watch::Sender<bool>>,
}

impl Default for LoopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { stop: Arc::new(tx) }
    }

    /// Ask the loop to return. Takes effect between iterations; in-flight
    /// connections are not aborted individually.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub async fn stopped(&self) {
        let mut rx = self.stop.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

pub struct EventLoop {
    runtime: Runtime,
    listeners: Vec<StdTcpListener>,
    handle: LoopHandle,
}

impl EventLoop {
    pub fn new(listeners: Vec<StdTcpListener>, handle: LoopHandle) -> NeubotResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            listeners,
            handle,
        })
    }

    /// Stop the loop on SIGTERM or SIGINT. Cleanup is left to whoever called
    /// [`EventLoop::run`].
    pub fn install_signal_handler(&self) -> NeubotResult<()> {
        let _guard = self.runtime.enter();
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let handle = self.handle.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
            handle.stop();
        });
        debug!("signal handler installed");
        Ok(())
    }

    /// Serve until [`LoopHandle::stop`] is called.
    pub fn run(self, router: Arc<Router>) -> NeubotResult<()> {
        let EventLoop {
            runtime,
            listeners,
            handle,
        } = self;

        runtime.block_on(async move {
            let ids = Arc::new(ConnectionIds::default());
            for listener in listeners {
                let listener = tokio::net::TcpListener::from_std(listener)?;
                tokio::spawn(accept_loop(listener, router.clone(), ids.clone()));
            }
            handle.stopped().await;
            info!("event loop stopped");
            Ok::<(), NeubotError>(())
        })
    }
}
