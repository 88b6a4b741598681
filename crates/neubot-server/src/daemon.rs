//! Detaching from the terminal and the pidfile.

use neubot_core::{NeubotError, NeubotResult};
use nix::unistd::{chdir, dup2, fork, setsid, ForkResult};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use tracing::{debug, info, warn};

fn daemon_error(step: &'static str) -> impl Fn(nix::Error) -> NeubotError {
    move |e| NeubotError::Daemon(format!("{step}: {e}"))
}

/// Fork twice, start a new session, and point stdio at `/dev/null`.
///
/// Must run before any thread or async runtime is started. Only the
/// grandchild returns.
pub fn daemonize() -> NeubotResult<()> {
    // SAFETY: the process is still single-threaded at this point.
    if let ForkResult::Parent { .. } = unsafe { fork() }.map_err(daemon_error("fork"))? {
        std::process::exit(0);
    }
    setsid().map_err(daemon_error("setsid"))?;
    // SAFETY: as above; the session leader has no other threads either.
    if let ForkResult::Parent { .. } = unsafe { fork() }.map_err(daemon_error("fork"))? {
        std::process::exit(0);
    }
    chdir("/").map_err(daemon_error("chdir"))?;

    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|e| NeubotError::Daemon(format!("/dev/null: {e}")))?;
    for fd in 0..=2 {
        dup2(devnull.as_raw_fd(), fd).map_err(daemon_error("dup2"))?;
    }
    debug!(pid = std::process::id(), "detached");
    Ok(())
}

/// Write our pid to `path` atomically (temp file + fsync + rename).
pub fn write_pidfile(path: &Path) -> NeubotResult<()> {
    let tmp = path.with_extension("pid.tmp");
    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(NeubotError::Daemon(format!(
            "cannot write pidfile {}: {e}",
            path.display()
        )));
    }
    info!(path = %path.display(), "pidfile written");
    Ok(())
}

/// Remove the pidfile. A missing file is not an error.
pub fn remove_pidfile(path: &Path) -> NeubotResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "pidfile removed");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot remove pidfile");
            Err(e.into())
        }
    }
}
