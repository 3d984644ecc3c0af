use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("manifest file not found: {0}")]
    ManifestNotFound(PathBuf),

    #[error("CSV error in {path}: {message}")]
    Csv { path: PathBuf, message: String },

    #[error("invalid column index {index} (row has {len} columns)")]
    InvalidColumn { index: usize, len: usize },

    #[error("missing config file manifest-sync.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value: {0}")]
    InvalidConfig(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("HTTP request to {url} returned status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("connection failed for {0}")]
    Connectivity(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("upload command failed: {0}")]
    UploadCommand(String),

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("unable to detect installed Chrome version: {0}")]
    ChromeVersion(String),

    #[error("no chromedriver download for {0}")]
    DriverNotFound(String),

    #[error("background upload worker panicked")]
    WorkerPanicked,
}
