//! CSV input/output: the work manifest, generic row readers, and the
//! append-only upload log used as resume state.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use csv::{ByteRecord, ReaderBuilder, WriterBuilder};
use tracing::debug;

use crate::domain::{ManifestEntry, RecordId, UploadLogEntry};
use crate::error::SyncError;

pub const UPLOAD_LOG_HEADER: [&str; 3] = ["S3 Path", "File Size", "Timestamp"];
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub header: Vec<String>,
    pub entries: BTreeMap<RecordId, ManifestEntry>,
}

impl Manifest {
    /// Loads the manifest, keeping only rows whose URL column is non-empty.
    pub fn load(path: &Path, id_column: usize, url_column: usize) -> Result<Self, SyncError> {
        let (header, rows) = read_rows(path)?;
        let mut entries = BTreeMap::new();
        for row in rows {
            let (Some(id), Some(url)) = (row.get(id_column), row.get(url_column)) else {
                continue;
            };
            let url = url.trim().to_string();
            if url.is_empty() {
                continue;
            }
            let id = RecordId::new(id);
            entries.insert(id.clone(), ManifestEntry { id, row, url });
        }
        debug!(path = %path.display(), entries = entries.len(), "manifest loaded");
        Ok(Self { header, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reads a CSV file into its header and data rows. Invalid UTF-8 is replaced
/// rather than rejected and blank lines are skipped.
pub fn read_rows(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>), SyncError> {
    if !path.exists() {
        return Err(SyncError::ManifestNotFound(path.to_path_buf()));
    }
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|err| csv_error(path, err))?;
    let header = record_strings(reader.byte_headers().map_err(|err| csv_error(path, err))?);

    let mut rows = Vec::new();
    let mut record = ByteRecord::new();
    while reader
        .read_byte_record(&mut record)
        .map_err(|err| csv_error(path, err))?
    {
        let row = record_strings(&record);
        if row.iter().all(|cell| cell.is_empty()) {
            continue;
        }
        rows.push(row);
    }
    Ok((header, rows))
}

/// Reads a CSV file keyed by `key_index`. With a `value_index`, rows whose
/// value cell is empty are dropped; without one, every row is kept whole.
pub fn read_keyed(
    path: &Path,
    key_index: usize,
    value_index: Option<usize>,
) -> Result<(Vec<String>, BTreeMap<String, Vec<String>>), SyncError> {
    let (header, rows) = read_rows(path)?;
    let mut items = BTreeMap::new();
    for row in rows {
        let key = row
            .get(key_index)
            .ok_or(SyncError::InvalidColumn {
                index: key_index,
                len: row.len(),
            })?
            .clone();
        match value_index {
            None => {
                items.insert(key, row);
            }
            Some(index) => {
                let value = row.get(index).ok_or(SyncError::InvalidColumn {
                    index,
                    len: row.len(),
                })?;
                if !value.is_empty() {
                    items.insert(key, vec![value.clone()]);
                }
            }
        }
    }
    Ok((header, items))
}

fn record_strings(record: &ByteRecord) -> Vec<String> {
    record
        .iter()
        .map(|field| String::from_utf8_lossy(field).into_owned())
        .collect()
}

fn csv_error(path: &Path, err: csv::Error) -> SyncError {
    SyncError::Csv {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Append-only CSV log of uploaded files.
#[derive(Debug, Clone)]
pub struct UploadLog {
    path: PathBuf,
}

impl UploadLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Creates the log with its header row if it does not exist yet.
    pub fn ensure_header(&self) -> Result<(), SyncError> {
        self.append(&[])
    }

    /// All logged entries; a missing log means nothing was uploaded yet.
    pub fn read(&self) -> Result<Vec<UploadLogEntry>, SyncError> {
        if !self.exists() {
            return Ok(Vec::new());
        }
        let (_, rows) = read_rows(&self.path)?;
        let entries = rows
            .into_iter()
            .map(|row| UploadLogEntry {
                remote_path: row.first().cloned().unwrap_or_default(),
                file_size: row
                    .get(1)
                    .and_then(|size| size.trim().parse().ok())
                    .unwrap_or(0),
                timestamp: row.get(2).and_then(|value| parse_timestamp(value)),
            })
            .collect();
        Ok(entries)
    }

    pub fn append(&self, entries: &[UploadLogEntry]) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        let needs_header = fs::metadata(&self.path)
            .map(|meta| meta.len() == 0)
            .unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| SyncError::Filesystem(format!("{}: {err}", self.path.display())))?;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        if needs_header {
            writer
                .write_record(UPLOAD_LOG_HEADER)
                .map_err(|err| csv_error(&self.path, err))?;
        }
        for entry in entries {
            let timestamp = entry
                .timestamp
                .unwrap_or_else(|| Local::now().naive_local())
                .format(TIMESTAMP_FORMAT)
                .to_string();
            let size = entry.file_size.to_string();
            writer
                .write_record([entry.remote_path.as_str(), size.as_str(), timestamp.as_str()])
                .map_err(|err| csv_error(&self.path, err))?;
        }
        writer
            .flush()
            .map_err(|err: io::Error| SyncError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}
