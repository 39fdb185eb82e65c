// ABOUTME: Directory-tree archives for the plugins, themes and uploads bundles
// ABOUTME: zip container behind the `zip-archive` feature; without it archiving is a missing capability

use std::path::Path;

use crate::error::Result;

/// Whether this build can create and unpack file bundles.
pub fn available() -> bool {
    cfg!(feature = "zip-archive")
}

/// Packs every file under `source_dir` into a new archive written to `out`.
/// Returns the number of files stored.
pub fn create(source_dir: &Path, out: &mut std::fs::File) -> Result<u64> {
    imp::create(source_dir, out)
}

/// Unpacks `archive_path` into `target_dir`, replacing files that already exist.
/// Returns the number of files written.
pub fn extract(archive_path: &Path, target_dir: &Path) -> Result<u64> {
    imp::extract(archive_path, target_dir)
}

#[cfg(feature = "zip-archive")]
mod imp {
    use std::fs::{self, File};
    use std::io;
    use std::path::{Path, PathBuf};

    use tracing::{debug, warn};
    use zip::write::SimpleFileOptions;
    use zip::{CompressionMethod, ZipArchive, ZipWriter};

    use crate::error::{BridgeError, Result};

    fn zip_err(e: zip::result::ZipError) -> BridgeError {
        match e {
            zip::result::ZipError::Io(io) => BridgeError::Io(io),
            other => BridgeError::MalformedInput(format!("archive error: {other}")),
        }
    }

    fn collect(root: &Path, dir: &Path, entries: &mut Vec<(PathBuf, bool)>) -> io::Result<()> {
        let mut children: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
        children.sort_by_key(|e| e.file_name());
        for child in children {
            let path = child.path();
            let meta = fs::symlink_metadata(&path)?;
            if meta.file_type().is_symlink() {
                debug!("Skipping symlink {}", path.display());
                continue;
            }
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            if meta.is_dir() {
                entries.push((relative, true));
                collect(root, &path, entries)?;
            } else if meta.is_file() {
                entries.push((relative, false));
            }
        }
        Ok(())
    }

    fn entry_name(relative: &Path) -> String {
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn create(source_dir: &Path, out: &mut File) -> Result<u64> {
        let mut entries = Vec::new();
        if source_dir.is_dir() {
            collect(source_dir, source_dir, &mut entries)?;
        } else {
            warn!(
                "{} does not exist, packing an empty archive",
                source_dir.display()
            );
        }

        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut writer = ZipWriter::new(out);
        let mut files = 0u64;
        for (relative, is_dir) in entries {
            let name = entry_name(&relative);
            if is_dir {
                writer.add_directory(name, options).map_err(zip_err)?;
                continue;
            }
            writer.start_file(name, options).map_err(zip_err)?;
            let mut input = File::open(source_dir.join(&relative))?;
            io::copy(&mut input, &mut writer)?;
            files += 1;
        }
        writer.finish().map_err(zip_err)?;
        Ok(files)
    }

    pub fn extract(archive_path: &Path, target_dir: &Path) -> Result<u64> {
        let file = File::open(archive_path)?;
        let mut archive = ZipArchive::new(file).map_err(zip_err)?;
        fs::create_dir_all(target_dir)?;

        let mut files = 0u64;
        for idx in 0..archive.len() {
            let mut entry = archive.by_index(idx).map_err(zip_err)?;
            let Some(relative) = entry.enclosed_name() else {
                warn!("Skipping archive entry with unsafe path: {}", entry.name());
                continue;
            };
            let out_path = target_dir.join(relative);
            if entry.is_dir() {
                fs::create_dir_all(&out_path)?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            // Read-only files from an earlier extract cannot be truncated in place.
            if fs::symlink_metadata(&out_path).is_ok_and(|m| !m.is_dir()) {
                fs::remove_file(&out_path)?;
            }
            let mut output = File::create(&out_path)?;
            io::copy(&mut entry, &mut output)?;
            files += 1;

            #[cfg(unix)]
            if let Some(mode) = entry.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777))?;
            }
        }
        Ok(files)
    }
}

#[cfg(not(feature = "zip-archive"))]
mod imp {
    use std::path::Path;

    use crate::error::{BridgeError, Result};

    fn missing() -> BridgeError {
        BridgeError::CapabilityMissing(
            "archive support is not compiled in (enable the `zip-archive` feature)".to_string(),
        )
    }

    pub fn create(_source_dir: &Path, _out: &mut std::fs::File) -> Result<u64> {
        Err(missing())
    }

    pub fn extract(_archive_path: &Path, _target_dir: &Path) -> Result<u64> {
        Err(missing())
    }
}

#[cfg(all(test, feature = "zip-archive"))]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn test_create_and_extract_preserves_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("plugins");
        write(&src.join("hello/hello.php"), "<?php echo 1;");
        write(&src.join("hello/assets/app.js"), "console.log(1)");
        write(&src.join("index.php"), "silence");
        fs::create_dir_all(src.join("empty")).unwrap();

        let archive_path = dir.path().join("plugins.zip");
        let mut out = fs::File::create(&archive_path).unwrap();
        assert_eq!(create(&src, &mut out).unwrap(), 3);
        drop(out);

        let dest = dir.path().join("restored");
        write(&dest.join("index.php"), "stale");
        assert_eq!(extract(&archive_path, &dest).unwrap(), 3);

        assert_eq!(fs::read_to_string(dest.join("index.php")).unwrap(), "silence");
        assert_eq!(
            fs::read_to_string(dest.join("hello/assets/app.js")).unwrap(),
            "console.log(1)"
        );
        assert!(dest.join("empty").is_dir());
    }

    #[test]
    fn test_missing_source_dir_packs_empty_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("uploads.zip");
        let mut out = fs::File::create(&archive_path).unwrap();
        assert_eq!(create(&dir.path().join("nope"), &mut out).unwrap(), 0);
        drop(out);
        assert!(fs::metadata(&archive_path).unwrap().len() > 0);
        assert_eq!(extract(&archive_path, &dir.path().join("t")).unwrap(), 0);
    }

    #[test]
    fn test_extract_twice_over_read_only_file() {
        use std::io::Write;
        use zip::write::SimpleFileOptions;

        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("themes.zip");
        let mut writer = zip::ZipWriter::new(fs::File::create(&archive_path).unwrap());
        writer
            .start_file(
                "plain/style.css",
                SimpleFileOptions::default().unix_permissions(0o444),
            )
            .unwrap();
        writer.write_all(b"body {}").unwrap();
        writer.finish().unwrap();

        let dest = dir.path().join("themes");
        for _ in 0..2 {
            assert_eq!(extract(&archive_path, &dest).unwrap(), 1);
        }
        let restored = dest.join("plain/style.css");
        assert_eq!(fs::read_to_string(&restored).unwrap(), "body {}");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&restored).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o444);
        }
    }

    #[test]
    fn test_extract_rejects_non_archive() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.zip");
        fs::write(&bogus, "not a zip").unwrap();
        assert!(extract(&bogus, &dir.path().join("t")).is_err());
    }
}
