//! Logging setup.
//!
//! The subscriber writes through a [`LogSink`] that starts on stderr and can
//! be pointed at a log file before the process detaches from its terminal.

use neubot_core::{NeubotError, NeubotResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

enum Target {
    Stderr,
    File(File),
}

/// Switchable log destination shared by every writer the subscriber makes.
#[derive(Clone)]
pub struct LogSink {
    target: Arc<Mutex<Target>>,
}

impl Default for LogSink {
    fn default() -> Self {
        Self::stderr()
    }
}

impl LogSink {
    pub fn stderr() -> Self {
        Self {
            target: Arc::new(Mutex::new(Target::Stderr)),
        }
    }

    /// Append every later log line to `path`.
    pub fn redirect(&self, path: &Path) -> NeubotResult<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| NeubotError::Daemon(format!("cannot open log {}: {e}", path.display())))?;
        *self.target.lock() = Target::File(file);
        Ok(())
    }
}

pub struct SinkWriter {
    target: Arc<Mutex<Target>>,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.target.lock() {
            Target::Stderr => io::stderr().write(buf),
            Target::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.target.lock() {
            Target::Stderr => io::stderr().flush(),
            Target::File(file) => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            target: self.target.clone(),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `-v`.
pub fn init(verbose: bool) -> NeubotResult<LogSink> {
    let sink = LogSink::stderr();
    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(sink.clone())
        .try_init()
        .map_err(|e| NeubotError::Other(format!("cannot install logger: {e}")))?;
    Ok(sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        std::fs::write(&path, "old\n").unwrap();

        let sink = LogSink::stderr();
        sink.redirect(&path).unwrap();

        let mut writer = sink.make_writer();
        writer.write_all(b"new\n").unwrap();
        writer.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old\nnew\n");
    }

    #[test]
    fn redirect_failure_keeps_stderr() {
        let sink = LogSink::stderr();
        let err = sink
            .redirect(Path::new("/nonexistent/dir/server.log"))
            .unwrap_err();
        assert!(matches!(err, NeubotError::Daemon(_)));
        assert!(matches!(*sink.target.lock(), Target::Stderr));
    }

    #[test]
    fn clones_share_the_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        let sink = LogSink::stderr();
        let clone = sink.clone();
        sink.redirect(&path).unwrap();
        clone.make_writer().write_all(b"via clone\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "via clone\n");
    }
}
