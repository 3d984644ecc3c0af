use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::SyncError;

fn open_archive(zip_path: &Path) -> Result<ZipArchive<fs::File>, SyncError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| SyncError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    ZipArchive::new(file).map_err(|err| SyncError::Filesystem(err.to_string()))
}

/// Extracts every entry below `target_dir` and returns the extracted file
/// paths.
pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut archive = open_archive(zip_path)?;
    let mut extracted = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(SyncError::Filesystem(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        extracted.push(entry_path);
    }
    Ok(extracted)
}

/// Reads every entry to the end so CRC errors surface before extraction.
pub fn validate_zip(zip_path: &Path) -> Result<(), SyncError> {
    let mut archive = open_archive(zip_path)?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

#[cfg(unix)]
pub fn make_executable(path: &Path) -> Result<(), SyncError> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)
        .map_err(|err| SyncError::Filesystem(err.to_string()))?
        .permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    fs::set_permissions(path, permissions).map_err(|err| SyncError::Filesystem(err.to_string()))
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> Result<(), SyncError> {
    Ok(())
}
