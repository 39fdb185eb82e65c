// ABOUTME: At-most-one-migration guards for both hosts
// ABOUTME: In-process async lock on the destination, exclusive lock file on the source

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

/// Serialises destination-side work that mutates the site.
#[derive(Clone, Default)]
pub struct MigrationGuard {
    lock: Arc<Mutex<()>>,
}

impl MigrationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails immediately instead of queueing behind a running operation.
    pub fn try_begin(&self, operation: &str) -> Result<OwnedMutexGuard<()>> {
        self.lock.clone().try_lock_owned().map_err(|_| {
            BridgeError::MigrationInProgress(format!(
                "cannot start {operation} while another migration step is running"
            ))
        })
    }
}

/// Exclusive lock file held for the duration of a source-side pipeline run.
#[derive(Debug)]
pub struct SourceLock {
    path: PathBuf,
}

impl SourceLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => BridgeError::MigrationInProgress(format!(
                    "lock file {} exists; if no migration is running, delete it and retry",
                    path.display()
                )),
                _ => BridgeError::Io(e),
            })?;
        writeln!(file, "{}", std::process::id())?;
        debug!("Acquired migration lock {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for SourceLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove migration lock {}: {}", self.path.display(), e);
        }
    }
}
