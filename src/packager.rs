// ABOUTME: Produces the four migration artifacts (database dump and three file bundles)
// ABOUTME: Each run writes to a temp file and renames over the previous artifact of that kind

use std::io::BufWriter;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use tracing::info;

use crate::archive;
use crate::error::{BridgeError, Result};
use crate::site::{dump, Site};
use crate::types::{Artifact, StepKind};

#[derive(Debug, Clone)]
pub struct Packager {
    site: Site,
    temp_dir: PathBuf,
}

impl Packager {
    pub fn new(site: Site, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            site,
            temp_dir: temp_dir.into(),
        }
    }

    pub fn artifact_path(&self, kind: StepKind) -> PathBuf {
        self.temp_dir.join(kind.file_name())
    }

    /// The artifact currently on disk for `kind`, if any.
    pub fn existing(&self, kind: StepKind) -> Option<Artifact> {
        let path = self.artifact_path(kind);
        let meta = std::fs::metadata(&path).ok()?;
        meta.is_file().then(|| Artifact {
            kind,
            path,
            size_bytes: meta.len(),
        })
    }

    /// Builds the artifact for `kind`, replacing any earlier one.
    pub fn package(&self, kind: StepKind) -> Result<Artifact> {
        if kind.is_archive() && !archive::available() {
            return Err(BridgeError::CapabilityMissing(format!(
                "cannot create {} archive: archive support is unavailable on this host",
                kind
            )));
        }
        std::fs::create_dir_all(&self.temp_dir)
            .map_err(|e| BridgeError::step(kind, format!("cannot create temp directory: {e}")))?;

        let mut staging = NamedTempFile::new_in(&self.temp_dir)
            .map_err(|e| BridgeError::step(kind, format!("cannot create staging file: {e}")))?;

        let written = match kind {
            StepKind::Database => self.write_dump(&mut staging),
            _ => self.write_archive(kind, &mut staging),
        };
        let count = written.map_err(|e| match e {
            BridgeError::CapabilityMissing(_) => e,
            other => BridgeError::step(kind, other.to_string()),
        })?;

        let path = self.artifact_path(kind);
        staging
            .persist(&path)
            .map_err(|e| BridgeError::step(kind, format!("cannot move artifact into place: {e}")))?;
        let size_bytes = std::fs::metadata(&path)?.len();

        let artifact = Artifact {
            kind,
            path,
            size_bytes,
        };
        info!(
            "Packaged {} ({} entries, {})",
            kind,
            count,
            artifact.human_size()
        );
        Ok(artifact)
    }

    fn write_dump(&self, staging: &mut NamedTempFile) -> Result<u64> {
        let conn = self.site.open_db()?;
        let mut out = BufWriter::new(staging.as_file_mut());
        dump::export(&conn, &mut out)
    }

    fn write_archive(&self, kind: StepKind, staging: &mut NamedTempFile) -> Result<u64> {
        let dir = self
            .site
            .directory(kind)
            .ok_or_else(|| BridgeError::step(kind, "no directory for this step"))?;
        archive::create(dir, staging.as_file_mut())
    }
}
