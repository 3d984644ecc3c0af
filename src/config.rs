use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ScanLayout;
use crate::error::SyncError;
use crate::fetch::{ConnectivityRetry, RetryPolicy};
use crate::reconcile::ReconcileSpec;
use crate::store::Store;

pub const DEFAULT_CONFIG_FILE: &str = "manifest-sync.json";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub project: String,
    pub manifest: PathBuf,
    #[serde(default)]
    pub upload_log: Option<PathBuf>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    #[serde(default)]
    pub id_column: Option<usize>,
    #[serde(default)]
    pub url_column: Option<usize>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub layout: Option<ScanLayout>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryEntry>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub verify_tls: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetryEntry {
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub until_online: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub project: String,
    pub manifest: PathBuf,
    pub upload_log: PathBuf,
    pub work_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub reconcile: ReconcileSpec,
    pub bucket: Option<String>,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub verify_tls: bool,
}

impl ResolvedConfig {
    pub fn require_bucket(&self) -> Result<&str, SyncError> {
        self.bucket
            .as_deref()
            .ok_or_else(|| SyncError::InvalidConfig("bucket is required for uploads".to_string()))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>, store: &Store) -> Result<ResolvedConfig, SyncError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(SyncError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config, store)
    }

    pub fn resolve_config(config: Config, store: &Store) -> Result<ResolvedConfig, SyncError> {
        let project = config.project.trim().to_string();
        if project.is_empty() {
            return Err(SyncError::InvalidConfig("project must not be empty".to_string()));
        }
        let project_root = store.project_root(&project).into_std_path_buf();

        let id_column = config.id_column.unwrap_or(0);
        let url_column = config.url_column.unwrap_or(1);
        if id_column == url_column {
            return Err(SyncError::InvalidConfig(
                "id_column and url_column must differ".to_string(),
            ));
        }

        let batch_size = config.batch_size.unwrap_or(100);
        if batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }

        let retry = config.retry.unwrap_or_default();
        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            attempts: retry.attempts.unwrap_or(defaults.attempts).max(1),
            backoff: retry
                .backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff),
            timeout: retry
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            connectivity: if retry.until_online {
                ConnectivityRetry::UntilOnline
            } else {
                ConnectivityRetry::Budgeted
            },
        };

        Ok(ResolvedConfig {
            manifest: config.manifest,
            upload_log: config
                .upload_log
                .unwrap_or_else(|| project_root.join("uploaded.csv")),
            work_dir: config
                .work_dir
                .unwrap_or_else(|| project_root.join("files")),
            staging_dir: config
                .staging_dir
                .unwrap_or_else(|| project_root.join("upload")),
            reconcile: ReconcileSpec {
                id_column,
                url_column,
                extension: config
                    .extension
                    .map(|ext| ext.trim_start_matches('.').to_string())
                    .unwrap_or_else(|| "jpg".to_string()),
                layout: config.layout.unwrap_or_default(),
            },
            bucket: config.bucket.filter(|bucket| !bucket.trim().is_empty()),
            retry,
            poll_interval: Duration::from_millis(config.poll_interval_ms.unwrap_or(500)),
            batch_size,
            verify_tls: config.verify_tls.unwrap_or(true),
            project,
        })
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config: Config =
            serde_json::from_str(r#"{"project": "cards", "manifest": "records.csv"}"#).unwrap();
        let store = Store::new_with_root(Utf8PathBuf::from("/data"));

        let resolved = ConfigLoader::resolve_config(config, &store).unwrap();
        assert_eq!(resolved.reconcile.id_column, 0);
        assert_eq!(resolved.reconcile.url_column, 1);
        assert_eq!(resolved.reconcile.extension, "jpg");
        assert_eq!(resolved.reconcile.layout, ScanLayout::Auto);
        assert_eq!(resolved.work_dir, PathBuf::from("/data/cards/files"));
        assert_eq!(resolved.upload_log, PathBuf::from("/data/cards/uploaded.csv"));
        assert_eq!(resolved.retry.attempts, 2);
        assert!(resolved.bucket.is_none());
    }
}
