// ABOUTME: Removes transient migration artifacts from a host's working directory
// ABOUTME: Missing files and an already-clean directory both count as success

use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{BridgeError, Result};

/// Deletes everything inside `dir`, keeping the directory itself.
/// Returns the number of entries removed.
pub fn cleanup_dir(dir: &Path) -> Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{} does not exist, nothing to clean", dir.display());
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    let mut failures = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                failures.push(e.to_string());
                continue;
            }
        };
        let path = entry.path();
        let result = match entry.file_type() {
            Ok(ft) if ft.is_dir() => std::fs::remove_dir_all(&path),
            _ => std::fs::remove_file(&path),
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => failures.push(format!("{}: {}", path.display(), e)),
        }
    }

    if !failures.is_empty() {
        return Err(BridgeError::Io(std::io::Error::other(format!(
            "Cleanup failed. Some files may still exist: {}",
            failures.join("; ")
        ))));
    }
    info!("Removed {} temporary entries from {}", removed, dir.display());
    Ok(removed)
}
