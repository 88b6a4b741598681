//! Operating-system operations the bootstrap performs.

use crate::daemon;
use crate::event_loop::bind_listener;
use crate::logging::LogSink;
use neubot_core::{NeubotError, NeubotResult};
use nix::unistd::{geteuid, getuid, setgid, setuid, Uid, User};
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use tracing::{debug, info};

pub trait Platform {
    /// Whether the process may bind low ports and switch users.
    fn is_privileged(&self) -> bool;

    fn bind(&mut self, addr: SocketAddr) -> NeubotResult<TcpListener>;

    /// Send log output to `path` from now on.
    fn redirect_logs(&mut self, path: &Path) -> NeubotResult<()>;

    /// Detach from the terminal and write `pidfile`.
    fn daemonize(&mut self, pidfile: &Path) -> NeubotResult<()>;

    /// Become `user` for good.
    fn drop_privileges(&mut self, user: &str) -> NeubotResult<()>;
}

pub struct SystemPlatform {
    logs: LogSink,
}

impl SystemPlatform {
    pub fn new(logs: LogSink) -> Self {
        Self { logs }
    }
}

fn privilege_error(step: &'static str) -> impl Fn(nix::Error) -> NeubotError {
    move |e| NeubotError::Privilege(format!("{step}: {e}"))
}

impl Platform for SystemPlatform {
    fn is_privileged(&self) -> bool {
        geteuid().is_root()
    }

    fn bind(&mut self, addr: SocketAddr) -> NeubotResult<TcpListener> {
        bind_listener(addr).map_err(|source| NeubotError::Bind { addr, source })
    }

    fn redirect_logs(&mut self, path: &Path) -> NeubotResult<()> {
        self.logs.redirect(path)
    }

    fn daemonize(&mut self, pidfile: &Path) -> NeubotResult<()> {
        daemon::daemonize()?;
        daemon::write_pidfile(pidfile)
    }

    fn drop_privileges(&mut self, name: &str) -> NeubotResult<()> {
        let user = User::from_name(name)
            .map_err(privilege_error("getpwnam"))?
            .ok_or_else(|| NeubotError::Privilege(format!("no such user: {name}")))?;

        if !geteuid().is_root() {
            // Development runs: already the target user.
            if getuid() == user.uid {
                debug!(user = name, "already unprivileged");
                return Ok(());
            }
            return Err(NeubotError::Privilege(format!(
                "cannot switch to {name} without root"
            )));
        }

        #[cfg(not(any(target_os = "macos", target_os = "ios")))]
        nix::unistd::setgroups(&[user.gid]).map_err(privilege_error("setgroups"))?;
        setgid(user.gid).map_err(privilege_error("setgid"))?;
        setuid(user.uid).map_err(privilege_error("setuid"))?;

        if setuid(Uid::from_raw(0)).is_ok() {
            return Err(NeubotError::Privilege("root privileges were not dropped".into()));
        }
        info!(user = name, uid = user.uid.as_raw(), "privileges dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_failure_names_the_address() {
        let mut platform = SystemPlatform::new(LogSink::stderr());
        let first = platform.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let taken = first.local_addr().unwrap();
        match platform.bind(taken) {
            Err(NeubotError::Bind { addr, .. }) => assert_eq!(addr, taken),
            other => panic!("expected bind error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_user_cannot_be_assumed() {
        let mut platform = SystemPlatform::new(LogSink::stderr());
        let err = platform
            .drop_privileges("neubot-no-such-user-here")
            .unwrap_err();
        assert!(matches!(err, NeubotError::Privilege(_)));
    }
}
