use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Record identifier, lower-cased and trimmed so that manifest ids, logged
/// remote paths and file stems compare equal regardless of case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(value: &str) -> Self {
        Self(value.trim().to_lowercase())
    }

    /// Identifier recovered from a path's filename stem (`a/b/42.jpg` -> `42`).
    pub fn from_path_stem(path: &str) -> Self {
        let stem = Path::new(path.trim())
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::new(&stem)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub id: RecordId,
    pub row: Vec<String>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadLogEntry {
    pub remote_path: String,
    pub file_size: u64,
    pub timestamp: Option<NaiveDateTime>,
}

impl UploadLogEntry {
    pub fn record_id(&self) -> RecordId {
        RecordId::from_path_stem(&self.remote_path)
    }
}

/// Directory shape assumed when looking for already-downloaded files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScanLayout {
    /// Flat when the directory holds matching files directly, otherwise one
    /// level of subdirectories.
    #[default]
    Auto,
    Flat,
    Nested { depth: usize },
}

impl fmt::Display for ScanLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanLayout::Auto => write!(f, "auto"),
            ScanLayout::Flat => write!(f, "flat"),
            ScanLayout::Nested { depth } => write!(f, "nested:{depth}"),
        }
    }
}

impl FromStr for ScanLayout {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        match normalized.as_str() {
            "auto" => Ok(ScanLayout::Auto),
            "flat" => Ok(ScanLayout::Flat),
            "nested" => Ok(ScanLayout::Nested { depth: 1 }),
            other => {
                let depth = other
                    .strip_prefix("nested:")
                    .and_then(|depth| depth.parse::<usize>().ok())
                    .ok_or_else(|| {
                        SyncError::InvalidConfig(format!("unknown scan layout: {value}"))
                    })?;
                Ok(ScanLayout::Nested { depth })
            }
        }
    }
}

impl TryFrom<String> for ScanLayout {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScanLayout> for String {
    fn from(value: ScanLayout) -> Self {
        value.to_string()
    }
}

/// Result of a fetch that distinguishes "the resource does not exist" from
/// a failure to find out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome<T> {
    Found(T),
    NotFound,
}

impl<T> FetchOutcome<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, FetchOutcome::Found(_))
    }

    pub fn found(self) -> Option<T> {
        match self {
            FetchOutcome::Found(value) => Some(value),
            FetchOutcome::NotFound => None,
        }
    }
}
