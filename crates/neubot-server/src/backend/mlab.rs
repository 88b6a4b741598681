//! `mlab` backend: one gzip-compressed JSON file per record.
//!
//! Layout: `<datadir>/<test>/<timestamp>-<seq>.json.gz`. Files are written to
//! a temporary name and linked into place, so a reader never sees a partial
//! record and an existing record is never replaced.

use super::StorageBackend;
use flate2::write::GzEncoder;
use flate2::Compression;
use neubot_core::{server_timestamp, NeubotError, NeubotResult};
use serde_json::Value;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Names tried before giving up on a store.
const MAX_ATTEMPTS: u32 = 64;

pub struct MlabBackend {
    datadir: PathBuf,
    /// Disambiguates records stored within the same second. Restarts from
    /// zero with the process, so names may already be taken.
    seq: AtomicU64,
}

impl MlabBackend {
    pub fn new(datadir: PathBuf) -> Self {
        Self {
            datadir,
            seq: AtomicU64::new(0),
        }
    }

    fn next_path(&self, test: &str) -> PathBuf {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.datadir
            .join(test)
            .join(format!("{}-{seq:06}.json.gz", server_timestamp()))
    }
}

impl StorageBackend for MlabBackend {
    fn name(&self) -> &'static str {
        "mlab"
    }

    fn store(&self, test: &str, record: &Value) -> NeubotResult<()> {
        if test.is_empty() || test.contains(['/', '.']) {
            return Err(NeubotError::Storage(format!("invalid test name: {test:?}")));
        }
        for _ in 0..MAX_ATTEMPTS {
            let path = self.next_path(test);
            match write_compressed(&path, record) {
                Ok(()) => {
                    debug!(test, path = %path.display(), "record saved");
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    warn!(test, path = %path.display(), "record name taken, trying the next one");
                }
                Err(e) => {
                    return Err(NeubotError::Storage(format!(
                        "cannot write {}: {e}",
                        path.display()
                    )))
                }
            }
        }
        Err(NeubotError::Storage(format!("no free record name for {test}")))
    }
}

fn write_compressed(path: &Path, record: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        return Err(ErrorKind::AlreadyExists.into());
    }
    let tmp = path.with_extension(format!("gz.{}.tmp", std::process::id()));
    {
        let file = std::fs::File::create(&tmp)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        serde_json::to_writer(&mut encoder, record)?;
        encoder.write_all(b"\n")?;
        encoder.finish()?.sync_all()?;
    }
    // Unlike rename, linking fails when the final name exists.
    let published = std::fs::hard_link(&tmp, path);
    std::fs::remove_file(&tmp)?;
    published
}
