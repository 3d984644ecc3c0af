use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tracing::debug;

use crate::error::SyncError;

/// Shared local storage root; every project keeps its directories below it.
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, SyncError> {
        let root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.data_dir().join("manifest-sync")).ok()
            })
            .ok_or_else(|| {
                SyncError::Filesystem("unable to resolve storage directory".to_string())
            })?;
        Ok(Self { root })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn project_root(&self, project: &str) -> Utf8PathBuf {
        self.root.join(project)
    }

    /// `<root>/<project>/<name>`, created if missing.
    pub fn project_dir(&self, project: &str, name: &str) -> Result<Utf8PathBuf, SyncError> {
        let dir = self.project_root(project).join(name);
        ensure_dir(dir.as_std_path())?;
        debug!(path = %dir, "storage directory ready");
        Ok(dir)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), SyncError> {
        write_bytes_atomic(path.as_std_path(), content)
    }
}

pub fn ensure_dir(path: &Path) -> Result<(), SyncError> {
    fs::create_dir_all(path)
        .map_err(|err| SyncError::Filesystem(format!("create {}: {err}", path.display())))
}

/// Removes `path` when it is an empty directory. Returns true when nothing is
/// left at `path` afterwards.
pub fn remove_dir_if_empty(path: &Path) -> Result<bool, SyncError> {
    if !path.is_dir() {
        return Ok(true);
    }
    let mut entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(_) => return Ok(!path.exists()),
    };
    if entries.next().is_some() {
        return Ok(false);
    }
    match fs::remove_dir(path) {
        Ok(()) => Ok(true),
        // Removed concurrently by the upload worker.
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(true),
        Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => Ok(false),
        Err(err) => Err(SyncError::Filesystem(format!(
            "remove {}: {err}",
            path.display()
        ))),
    }
}

/// Removes `dir` and the directories below it, deepest first, without
/// touching files. A directory that is already gone or holds files again is
/// left as it is.
pub fn remove_empty_dirs(dir: &Path) -> Result<(), SyncError> {
    let mut dirs = vec![dir.to_path_buf()];
    let mut index = 0;
    while index < dirs.len() {
        let children = subdirs(&dirs[index]);
        dirs.extend(children);
        index += 1;
    }
    for path in dirs.iter().rev() {
        match fs::remove_dir(path) {
            Ok(()) => {}
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty
                ) => {}
            Err(err) => {
                return Err(SyncError::Filesystem(format!(
                    "remove {}: {err}",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

/// Writes through a sibling temp file so readers never observe a partial file.
pub fn write_bytes_atomic(path: &Path, content: &[u8]) -> Result<(), SyncError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    ensure_dir(parent)?;
    let temp = tempfile::Builder::new()
        .prefix(".manifest-sync")
        .tempfile_in(parent)
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    fs::write(temp.path(), content).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    temp.persist(path)
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Files `depth` directory levels below `dir` whose extension matches `ext`
/// (case-insensitive). Depth 0 lists `dir` itself. Unreadable entries are
/// skipped.
pub fn list_files(dir: &Path, ext: &str, depth: usize) -> Vec<PathBuf> {
    let mut level = vec![dir.to_path_buf()];
    for _ in 0..depth {
        level = level.iter().flat_map(|path| subdirs(path)).collect();
    }
    let mut files: Vec<PathBuf> = level
        .iter()
        .flat_map(|path| direct_files(path))
        .filter(|path| has_extension(path, ext))
        .collect();
    files.sort();
    files
}

/// Every file below `dir`, at any depth.
pub fn list_files_recursive(dir: &Path) -> Vec<PathBuf> {
    let mut items = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(path) = stack.pop() {
        let Ok(entries) = fs::read_dir(&path) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                items.push(path);
            }
        }
    }
    items.sort();
    items
}

pub(crate) fn subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs
}

pub(crate) fn direct_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    files
}

pub(crate) fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|value| value.eq_ignore_ascii_case(ext.trim_start_matches('.')))
        .unwrap_or(false)
}
