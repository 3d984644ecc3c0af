use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::domain::UploadLogEntry;
use crate::error::SyncError;
use crate::manifest::UploadLog;
use crate::store;

static UPLOAD_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"upload: (?P<local>.+?) to (?P<remote>\S+://\S.*)$").expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedFile {
    pub local: PathBuf,
    pub remote: String,
}

pub trait UploadClient: Send + Sync {
    fn upload_dir(&self, dir: &Path, remote_prefix: &str) -> Result<Vec<UploadedFile>, SyncError>;
}

/// Uploads through `aws s3 cp --recursive`.
#[derive(Debug, Clone)]
pub struct AwsCliUploader {
    program: Option<PathBuf>,
}

impl AwsCliUploader {
    pub fn new() -> Self {
        Self {
            program: find_in_path("aws"),
        }
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    fn require_program(&self) -> Result<&PathBuf, SyncError> {
        self.program
            .as_ref()
            .ok_or_else(|| SyncError::MissingTool("aws".to_string()))
    }
}

impl Default for AwsCliUploader {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadClient for AwsCliUploader {
    fn upload_dir(&self, dir: &Path, remote_prefix: &str) -> Result<Vec<UploadedFile>, SyncError> {
        let program = self.require_program()?;
        let output = Command::new(program)
            .arg("s3")
            .arg("cp")
            .arg(dir)
            .arg(remote_prefix)
            .arg("--recursive")
            .output()
            .map_err(|err| SyncError::UploadCommand(err.to_string()))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let uploaded = parse_upload_output(&stdout);
        if !output.status.success() && uploaded.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("command failed: {}", program.display())
            } else {
                stderr
            };
            return Err(SyncError::UploadCommand(message));
        }
        debug!(dir = %dir.display(), files = uploaded.len(), "upload command finished");
        Ok(uploaded)
    }
}

/// Extracts `upload: <local> to <remote>` lines from the CLI's stdout.
pub fn parse_upload_output(stdout: &str) -> Vec<UploadedFile> {
    stdout
        .lines()
        .filter_map(|line| {
            let caps = UPLOAD_LINE.captures(line.trim())?;
            Some(UploadedFile {
                local: PathBuf::from(caps["local"].trim()),
                remote: caps["remote"].trim().to_string(),
            })
        })
        .collect()
}

/// Remote path as recorded in the log: relative to `bucket` when it lives
/// under it.
pub fn log_path(remote: &str, bucket: &str) -> String {
    let bucket = bucket.trim_end_matches('/');
    match remote.strip_prefix(bucket) {
        Some(rest) if !bucket.is_empty() => rest.to_string(),
        _ => remote.to_string(),
    }
}

/// Remote prefix a project's batches are copied to.
pub fn remote_prefix(bucket: &str, project: &str) -> String {
    format!("{}/{}/", bucket.trim_end_matches('/'), project.trim_matches('/'))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub dir: PathBuf,
    pub uploaded: usize,
    pub bytes: u64,
}

/// Uploads `dir` and appends every uploaded file to the log.
pub fn upload_and_log<U: UploadClient + ?Sized>(
    uploader: &U,
    dir: &Path,
    bucket: &str,
    project: &str,
    log: &UploadLog,
) -> Result<BatchSummary, SyncError> {
    let prefix = remote_prefix(bucket, project);
    let uploaded = uploader.upload_dir(dir, &prefix)?;

    let entries: Vec<UploadLogEntry> = uploaded
        .iter()
        .map(|file| UploadLogEntry {
            remote_path: log_path(&file.remote, bucket),
            file_size: fs::metadata(&file.local).map(|meta| meta.len()).unwrap_or(0),
            timestamp: None,
        })
        .collect();
    log.append(&entries)?;

    let summary = BatchSummary {
        dir: dir.to_path_buf(),
        uploaded: entries.len(),
        bytes: entries.iter().map(|entry| entry.file_size).sum(),
    };
    info!(files = summary.uploaded, bytes = summary.bytes, "batch uploaded");
    Ok(summary)
}

/// [`upload_and_log`], then deletes the batch's files and the emptied
/// staging directory.
///
/// Only files present when the upload started are deleted: once the
/// directory is empty the dispatcher may move the next batch into it.
pub fn upload_batch<U: UploadClient + ?Sized>(
    uploader: &U,
    dir: &Path,
    bucket: &str,
    project: &str,
    log: &UploadLog,
) -> Result<BatchSummary, SyncError> {
    let batch = store::list_files_recursive(dir);
    let summary = upload_and_log(uploader, dir, bucket, project, log)?;
    for file in &batch {
        if let Err(err) = fs::remove_file(file) {
            if err.kind() != ErrorKind::NotFound {
                return Err(SyncError::Filesystem(format!(
                    "remove {}: {err}",
                    file.display()
                )));
            }
        }
    }
    store::remove_empty_dirs(dir)?;
    Ok(summary)
}

pub(crate) fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.is_file() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.is_file() {
            return Some(plain);
        }
    }
    None
}
