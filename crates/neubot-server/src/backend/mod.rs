//! Result storage backends.
//!
//! Protocol modules hand finished records to a [`StorageBackend`] under a
//! test-type key (`"dash"`, ...). The backend is chosen with `-b` and set up
//! while the process is still privileged, so its data directory can be handed
//! to the unprivileged user before the privilege drop.

pub mod mlab;

use crate::config::BackendKind;
use neubot_core::{NeubotError, NeubotResult};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub use mlab::MlabBackend;

pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Persist one record for test `test`.
    fn store(&self, test: &str, record: &Value) -> NeubotResult<()>;
}

/// Create the backend and prepare its data directory.
pub fn setup(
    kind: BackendKind,
    unpriv_user: &str,
    datadir: &Path,
) -> NeubotResult<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match kind {
        BackendKind::Mlab => {
            prepare_datadir(unpriv_user, datadir)?;
            Arc::new(MlabBackend::new(datadir.to_path_buf()))
        }
        BackendKind::Null => Arc::new(NullBackend),
    };
    info!(backend = backend.name(), datadir = %datadir.display(), "storage backend ready");
    Ok(backend)
}

/// Create `datadir` and, when running as root, give it to `unpriv_user`.
fn prepare_datadir(unpriv_user: &str, datadir: &Path) -> NeubotResult<()> {
    std::fs::create_dir_all(datadir)
        .map_err(|e| NeubotError::Storage(format!("cannot create {}: {e}", datadir.display())))?;

    if !nix::unistd::geteuid().is_root() {
        debug!(datadir = %datadir.display(), "not root, leaving datadir ownership alone");
        return Ok(());
    }

    let user = nix::unistd::User::from_name(unpriv_user)
        .map_err(|e| NeubotError::Storage(format!("cannot look up {unpriv_user}: {e}")))?
        .ok_or_else(|| NeubotError::Storage(format!("no such user: {unpriv_user}")))?;
    nix::unistd::chown(datadir, Some(user.uid), Some(user.gid))
        .map_err(|e| NeubotError::Storage(format!("cannot chown {}: {e}", datadir.display())))?;
    debug!(datadir = %datadir.display(), user = unpriv_user, "datadir handed to unprivileged user");
    Ok(())
}

/// Pretends to save results.
#[derive(Debug, Default)]
pub struct NullBackend;

impl StorageBackend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn store(&self, test: &str, _record: &Value) -> NeubotResult<()> {
        debug!(test, "null backend: record discarded");
        Ok(())
    }
}

/// Keeps results in memory so tests can read them back.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct VolatileBackend {
    records: parking_lot::Mutex<Vec<(String, Value)>>,
}

#[cfg(test)]
impl VolatileBackend {
    /// Records stored so far, oldest first.
    pub fn records(&self) -> Vec<(String, Value)> {
        self.records.lock().clone()
    }
}

#[cfg(test)]
impl StorageBackend for VolatileBackend {
    fn name(&self) -> &'static str {
        "volatile"
    }

    fn store(&self, test: &str, record: &Value) -> NeubotResult<()> {
        self.records.lock().push((test.to_string(), record.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn volatile_keeps_order() {
        let backend = VolatileBackend::default();
        backend.store("dash", &json!({"n": 1})).unwrap();
        backend.store("raw", &json!({"n": 2})).unwrap();
        let records = backend.records();
        assert_eq!(records[0], ("dash".to_string(), json!({"n": 1})));
        assert_eq!(records[1].0, "raw");
    }

    #[test]
    fn setup_creates_datadir() {
        let dir = tempfile::tempdir().unwrap();
        let datadir = dir.path().join("results");
        // Ownership is only changed when running as root, and root exists.
        let backend = setup(BackendKind::Mlab, "root", &datadir).unwrap();
        assert_eq!(backend.name(), "mlab");
        assert!(datadir.is_dir());
    }

    #[test]
    fn null_backend_needs_no_datadir() {
        let backend =
            setup(BackendKind::Null, "nobody", Path::new("/nonexistent/neubot")).unwrap();
        assert!(backend.store("dash", &json!({})).is_ok());
    }
}
