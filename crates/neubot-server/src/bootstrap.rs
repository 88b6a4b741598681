//! Privileged startup sequence.
//!
//! Each step consumes the previous stage and returns the next one, so the
//! order below is enforced by the types: there is no way to reach
//! [`Bootstrap::drop_privileges`] without having bound every endpoint first.
//!
//! 1. [`verify_privileged`]
//! 2. [`Unconfigured::resolve_configuration`]
//! 3. [`Bootstrap::bind_endpoints`]
//! 4. [`Bootstrap::register_handlers`]
//! 5. [`Bootstrap::load_plugins`]
//! 6. [`Bootstrap::daemonize_if_requested`]
//! 7. [`Bootstrap::install_signal_handler`]
//! 8. [`Bootstrap::drop_privileges`]
//! 9. [`Bootstrap::run`]
//! 10. [`Bootstrap::cleanup`]
//!
//! Steps 1 to 8 are fatal on failure. The loop and the cleanup only log.

use crate::backend::StorageBackend;
use crate::config::{resolve, CliOptions, Defaults, ServerConfig};
use crate::daemon::remove_pidfile;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::negotiate::NegotiateServer;
use crate::platform::Platform;
use crate::plugins::{PluginContext, PluginLoader};
use crate::router::Router;
use crate::sapi::{ServerSideApi, SAPI_PATH};
use neubot_core::{NeubotError, NeubotResult};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Privileges checked, configuration not yet resolved.
pub struct Unconfigured<P> {
    platform: P,
}

/// Fail unless the process runs with the privileges the startup needs.
pub fn verify_privileged<P: Platform>(platform: P) -> NeubotResult<Unconfigured<P>> {
    if !platform.is_privileged() {
        return Err(NeubotError::NotPrivileged);
    }
    Ok(Unconfigured { platform })
}

impl<P: Platform> Unconfigured<P> {
    /// Skip the privilege check (development runs).
    pub fn unchecked(platform: P) -> Self {
        Self { platform }
    }

    pub fn resolve_configuration(
        self,
        cli: &CliOptions,
        defaults: &Defaults,
    ) -> NeubotResult<Bootstrap<P, Configured>> {
        let config = resolve(cli, defaults)?;
        Ok(Bootstrap {
            platform: self.platform,
            config,
            handle: LoopHandle::new(),
            stage: Configured,
        })
    }
}

pub struct Configured;

pub struct Bound {
    listeners: Vec<TcpListener>,
}

pub struct Wired {
    listeners: Vec<TcpListener>,
    router: Router,
    negotiate: Option<Arc<NegotiateServer>>,
    backend: Arc<dyn StorageBackend>,
}

pub struct Loaded {
    listeners: Vec<TcpListener>,
    router: Arc<Router>,
}

pub struct Detached {
    event_loop: EventLoop,
    router: Arc<Router>,
}

pub struct Armed {
    event_loop: EventLoop,
    router: Arc<Router>,
}

pub struct Unprivileged {
    event_loop: EventLoop,
    router: Arc<Router>,
}

pub struct Stopped;

/// The server being brought up; `S` is the last completed step.
pub struct Bootstrap<P, S> {
    platform: P,
    config: ServerConfig,
    handle: LoopHandle,
    stage: S,
}

impl<P, S> Bootstrap<P, S> {
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn loop_handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    fn advance<T>(self, stage: T) -> Bootstrap<P, T> {
        Bootstrap {
            platform: self.platform,
            config: self.config,
            handle: self.handle,
            stage,
        }
    }
}

impl<P: Platform> Bootstrap<P, Configured> {
    /// Bind every (address, port) pair. Any failure aborts the startup and
    /// releases the sockets bound so far.
    pub fn bind_endpoints(mut self) -> NeubotResult<Bootstrap<P, Bound>> {
        let mut listeners = Vec::new();
        for addr in self.config.endpoints()? {
            let listener = self.platform.bind(addr)?;
            info!(%addr, "listening");
            listeners.push(listener);
        }
        Ok(self.advance(Bound { listeners }))
    }
}

impl<P: Platform> Bootstrap<P, Bound> {
    /// Mount the core handlers. Filesystem serving is always turned off on
    /// the shared listener.
    pub fn register_handlers(mut self, backend: Arc<dyn StorageBackend>) -> Bootstrap<P, Wired> {
        self.config = self.config.with_http_rootdir(None);
        let mut router = Router::new();
        router.configure(&self.config);

        let negotiate = if self.config.enabled("server.negotiate") {
            let negotiate = Arc::new(NegotiateServer::new());
            router.register_child("/negotiate/", negotiate.clone());
            router.register_child("/collect/", negotiate.clone());
            Some(negotiate)
        } else {
            None
        };

        if self.config.enabled("server.sapi") {
            router.register_child(SAPI_PATH, Arc::new(ServerSideApi::new(negotiate.clone())));
        }

        let listeners = std::mem::take(&mut self.stage.listeners);
        self.advance(Wired {
            listeners,
            router,
            negotiate,
            backend,
        })
    }
}

impl<P: Platform> Bootstrap<P, Wired> {
    /// Let auxiliary modules attach. Plugin failures are logged by the
    /// loader and never abort the startup.
    pub fn load_plugins(self, loader: &dyn PluginLoader, root: &Path) -> Bootstrap<P, Loaded> {
        let Wired {
            listeners,
            mut router,
            negotiate,
            backend,
        } = self.stage;

        let mut context = PluginContext {
            router: &mut router,
            negotiate,
            backend,
            config: &self.config,
            event_loop: self.handle.clone(),
        };
        let attached = loader.discover(root, "", "server", &mut context);
        debug!(
            ?attached,
            prefixes = ?router.prefixes(),
            filesystem = router.serves_filesystem(),
            "handlers ready"
        );

        Bootstrap {
            platform: self.platform,
            config: self.config,
            handle: self.handle,
            stage: Loaded {
                listeners,
                router: Arc::new(router),
            },
        }
    }
}

impl<P: Platform> Bootstrap<P, Loaded> {
    /// Go to the background when `server.daemonize` is set, then build the
    /// event loop in whichever process survived.
    pub fn daemonize_if_requested(self) -> NeubotResult<Bootstrap<P, Detached>> {
        let Bootstrap {
            mut platform,
            config,
            handle,
            stage: Loaded { listeners, router },
        } = self;
        if config.daemonize() {
            platform.redirect_logs(&config.log_file)?;
            platform.daemonize(&config.pidfile)?;
        }
        let event_loop = EventLoop::new(listeners, handle.clone())?;
        Ok(Bootstrap {
            platform,
            config,
            handle,
            stage: Detached { event_loop, router },
        })
    }
}

impl<P: Platform> Bootstrap<P, Detached> {
    pub fn install_signal_handler(self) -> NeubotResult<Bootstrap<P, Armed>> {
        self.stage.event_loop.install_signal_handler()?;
        let Bootstrap {
            platform,
            config,
            handle,
            stage: Detached { event_loop, router },
        } = self;
        Ok(Bootstrap {
            platform,
            config,
            handle,
            stage: Armed { event_loop, router },
        })
    }
}

impl<P: Platform> Bootstrap<P, Armed> {
    pub fn drop_privileges(self) -> NeubotResult<Bootstrap<P, Unprivileged>> {
        let Bootstrap {
            mut platform,
            config,
            handle,
            stage: Armed { event_loop, router },
        } = self;
        info!("Neubot server -- starting up");
        platform.drop_privileges(&config.unpriv_user)?;
        Ok(Bootstrap {
            platform,
            config,
            handle,
            stage: Unprivileged { event_loop, router },
        })
    }
}

impl<P: Platform> Bootstrap<P, Unprivileged> {
    /// Serve until a stop is requested.
    pub fn run(self) -> Bootstrap<P, Stopped> {
        let Bootstrap {
            platform,
            config,
            handle,
            stage: Unprivileged { event_loop, router },
        } = self;
        if let Err(e) = event_loop.run(router) {
            error!(error = %e, "event loop failed");
        }
        Bootstrap {
            platform,
            config,
            handle,
            stage: Stopped,
        }
    }
}

impl<P: Platform> Bootstrap<P, Stopped> {
    pub fn cleanup(self) {
        info!("Neubot server -- shutting down");
        // Failures are logged by remove_pidfile.
        let _ = remove_pidfile(&self.config.pidfile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::VolatileBackend;
    use crate::plugins::BuiltinPlugins;
    use parking_lot::Mutex;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    /// Records every platform call; binds real loopback sockets.
    #[derive(Clone)]
    struct RecordingPlatform {
        privileged: bool,
        fail_bind_on: Option<u16>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingPlatform {
        fn new(privileged: bool) -> Self {
            Self {
                privileged,
                fail_bind_on: None,
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl Platform for RecordingPlatform {
        fn is_privileged(&self) -> bool {
            self.calls.lock().push("is_privileged".into());
            self.privileged
        }

        fn bind(&mut self, addr: SocketAddr) -> NeubotResult<TcpListener> {
            self.calls.lock().push(format!("bind {}", addr.port()));
            if self.fail_bind_on == Some(addr.port()) {
                return Err(NeubotError::Bind {
                    addr,
                    source: std::io::ErrorKind::AddrInUse.into(),
                });
            }
            Ok(crate::event_loop::bind_listener("127.0.0.1:0".parse().unwrap())?)
        }

        fn redirect_logs(&mut self, _path: &Path) -> NeubotResult<()> {
            self.calls.lock().push("redirect_logs".into());
            Ok(())
        }

        fn daemonize(&mut self, _pidfile: &Path) -> NeubotResult<()> {
            self.calls.lock().push("daemonize".into());
            Ok(())
        }

        fn drop_privileges(&mut self, user: &str) -> NeubotResult<()> {
            self.calls.lock().push(format!("drop_privileges {user}"));
            Ok(())
        }
    }

    fn defaults(dir: &Path, ports: Vec<u16>) -> Defaults {
        Defaults {
            address: "127.0.0.1".into(),
            ports,
            ..Defaults::development(dir, "nobody".into())
        }
    }

    fn cli(defines: &[&str]) -> CliOptions {
        CliOptions {
            defines: defines.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn start(
        platform: RecordingPlatform,
        cli: &CliOptions,
        defaults: &Defaults,
    ) -> NeubotResult<Bootstrap<RecordingPlatform, Unprivileged>> {
        verify_privileged(platform)?
            .resolve_configuration(cli, defaults)?
            .bind_endpoints()?
            .register_handlers(Arc::new(VolatileBackend::default()))
            .load_plugins(&BuiltinPlugins::standard(), Path::new("."))
            .daemonize_if_requested()?
            .install_signal_handler()?
            .drop_privileges()
    }

    #[test]
    fn binding_precedes_privilege_drop() {
        let dir = tempfile::tempdir().unwrap();
        for ports in [vec![8080], vec![80, 8080, 9773], vec![9773, 8080]] {
            let platform = RecordingPlatform::new(true);
            let ready = start(platform.clone(), &cli(&[]), &defaults(dir.path(), ports.clone()))
                .unwrap();
            ready.loop_handle().stop();
            ready.run().cleanup();

            let calls = platform.calls();
            let drop_at = calls
                .iter()
                .position(|c| c.starts_with("drop_privileges"))
                .unwrap();
            let binds: Vec<usize> = calls
                .iter()
                .enumerate()
                .filter(|(_, c)| c.starts_with("bind"))
                .map(|(i, _)| i)
                .collect();
            assert_eq!(binds.len(), ports.len());
            assert!(binds.iter().all(|&i| i < drop_at), "{calls:?}");
            assert_eq!(calls[0], "is_privileged");
            assert_eq!(calls.last().unwrap(), "drop_privileges nobody");
        }
    }

    #[test]
    fn daemonize_redirects_logs_first() {
        let dir = tempfile::tempdir().unwrap();
        let platform = RecordingPlatform::new(true);
        let ready = start(platform.clone(), &cli(&[]), &defaults(dir.path(), vec![8080])).unwrap();
        ready.loop_handle().stop();
        ready.run().cleanup();
        assert_eq!(
            platform.calls(),
            vec![
                "is_privileged",
                "bind 8080",
                "redirect_logs",
                "daemonize",
                "drop_privileges nobody",
            ]
        );
    }

    #[test]
    fn no_daemon_skips_detaching() {
        let dir = tempfile::tempdir().unwrap();
        let platform = RecordingPlatform::new(true);
        let options = CliOptions {
            no_daemon: true,
            ..Default::default()
        };
        let ready = start(platform.clone(), &options, &defaults(dir.path(), vec![8080])).unwrap();
        ready.loop_handle().stop();
        ready.run().cleanup();
        assert!(!platform.calls().iter().any(|c| c == "daemonize"));
    }

    #[test]
    fn unprivileged_start_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let platform = RecordingPlatform::new(false);
        let err = start(platform.clone(), &cli(&[]), &defaults(dir.path(), vec![8080]))
            .err()
            .unwrap();
        assert!(matches!(err, NeubotError::NotPrivileged));
        assert_eq!(platform.calls(), vec!["is_privileged"]);
    }

    #[test]
    fn bind_failure_is_fatal_and_nothing_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut platform = RecordingPlatform::new(true);
        platform.fail_bind_on = Some(9773);
        let err = start(
            platform.clone(),
            &cli(&[]),
            &defaults(dir.path(), vec![8080, 9773, 80]),
        )
        .err()
        .unwrap();
        assert!(matches!(err, NeubotError::Bind { .. }));
        assert_eq!(platform.calls(), vec!["is_privileged", "bind 8080", "bind 9773"]);
    }

    #[test]
    fn unknown_macro_fails_before_binding() {
        let dir = tempfile::tempdir().unwrap();
        let platform = RecordingPlatform::new(true);
        let err = start(
            platform.clone(),
            &cli(&["server.bogus=1"]),
            &defaults(dir.path(), vec![8080]),
        )
        .err()
        .unwrap();
        assert!(matches!(err, NeubotError::Usage(_)));
        assert!(!platform.calls().iter().any(|c| c.starts_with("bind")));
    }

    #[test]
    fn handlers_follow_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let wired = Unconfigured::unchecked(RecordingPlatform::new(false))
            .resolve_configuration(&cli(&["server.sapi=0"]), &defaults(dir.path(), vec![8080]))
            .unwrap()
            .bind_endpoints()
            .unwrap()
            .register_handlers(Arc::new(VolatileBackend::default()));
        assert!(wired.config().http_rootdir.is_none());
        assert!(!wired.stage.router.serves_filesystem());
        assert_eq!(wired.stage.router.prefixes(), vec!["/negotiate/", "/collect/"]);

        let loaded = wired.load_plugins(&BuiltinPlugins::standard(), Path::new("."));
        assert!(loaded.stage.router.prefixes().contains(&"/dash/"));

        let bare = Unconfigured::unchecked(RecordingPlatform::new(false))
            .resolve_configuration(&cli(&["server.negotiate=0"]), &defaults(dir.path(), vec![8080]))
            .unwrap()
            .bind_endpoints()
            .unwrap()
            .register_handlers(Arc::new(VolatileBackend::default()))
            .load_plugins(&BuiltinPlugins::standard(), Path::new("."));
        // The dash plugin needs the negotiate server.
        assert_eq!(bare.stage.router.prefixes(), vec!["/sapi"]);
    }

    #[test]
    fn cleanup_removes_pidfile() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = defaults(dir.path(), vec![8080]);
        let pidfile: PathBuf = defaults.pidfile.clone();
        std::fs::write(&pidfile, "1\n").unwrap();

        let ready = start(RecordingPlatform::new(true), &cli(&[]), &defaults).unwrap();
        ready.loop_handle().stop();
        ready.run().cleanup();
        assert!(!pidfile.exists());
    }
}
