//! Remaining-work computation: manifest minus logged uploads minus files
//! already on disk.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::domain::{ManifestEntry, RecordId, ScanLayout};
use crate::error::SyncError;
use crate::manifest::{Manifest, UploadLog};
use crate::store;

#[derive(Debug, Clone)]
pub struct ReconcileSpec {
    pub id_column: usize,
    pub url_column: usize,
    pub extension: String,
    pub layout: ScanLayout,
}

impl Default for ReconcileSpec {
    fn default() -> Self {
        Self {
            id_column: 0,
            url_column: 1,
            extension: "jpg".to_string(),
            layout: ScanLayout::Auto,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub manifest_total: usize,
    pub log_scanned: usize,
    pub log_matched: usize,
    pub disk_scanned: usize,
    pub disk_matched: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RemainingWork {
    pub items: BTreeMap<RecordId, ManifestEntry>,
    pub report: ReconcileReport,
}

impl RemainingWork {
    pub fn ids(&self) -> Vec<&str> {
        self.items.keys().map(|id| id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManifestReconciler {
    spec: ReconcileSpec,
}

impl ManifestReconciler {
    pub fn new(spec: ReconcileSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &ReconcileSpec {
        &self.spec
    }

    pub fn reconcile(
        &self,
        manifest_path: &Path,
        upload_log_path: &Path,
        local_dir: &Path,
    ) -> Result<RemainingWork, SyncError> {
        let manifest = Manifest::load(manifest_path, self.spec.id_column, self.spec.url_column)?;
        let mut items = manifest.entries;
        let mut report = ReconcileReport {
            manifest_total: items.len(),
            ..ReconcileReport::default()
        };
        info!(total = report.manifest_total, "files to upload");

        let log = UploadLog::new(upload_log_path);
        for entry in log.read()? {
            report.log_scanned += 1;
            if remove_id(&mut items, &entry.record_id()) {
                report.log_matched += 1;
            }
        }
        info!(
            uploaded = report.log_matched,
            scanned = report.log_scanned,
            remaining = items.len(),
            "skipped uploaded files"
        );

        for path in downloaded_files(local_dir, &self.spec.extension, self.spec.layout) {
            report.disk_scanned += 1;
            let id = RecordId::from_path_stem(&path.to_string_lossy());
            if remove_id(&mut items, &id) {
                report.disk_matched += 1;
            }
        }
        info!(
            downloaded = report.disk_matched,
            scanned = report.disk_scanned,
            remaining = items.len(),
            "skipped downloaded files"
        );

        report.remaining = items.len();
        Ok(RemainingWork { items, report })
    }
}

fn remove_id<V>(items: &mut BTreeMap<RecordId, V>, id: &RecordId) -> bool {
    if id.is_empty() {
        return false;
    }
    items.remove(id).is_some()
}

/// Files considered "already downloaded" under `dir` for the given layout.
///
/// With [`ScanLayout::Auto`] every direct file counts once any direct file has
/// the extension; otherwise only subdirectories holding matching files are
/// scanned, and within those every file counts.
pub fn downloaded_files(dir: &Path, ext: &str, layout: ScanLayout) -> Vec<PathBuf> {
    match layout {
        ScanLayout::Flat => store::list_files(dir, ext, 0),
        ScanLayout::Nested { depth } => store::list_files(dir, ext, depth),
        ScanLayout::Auto => {
            let direct = store::direct_files(dir);
            if direct.iter().any(|path| store::has_extension(path, ext)) {
                return direct;
            }
            store::subdirs(dir)
                .iter()
                .map(|sub| store::direct_files(sub))
                .filter(|files| files.iter().any(|path| store::has_extension(path, ext)))
                .flatten()
                .collect()
        }
    }
}

/// Pending ids for a numeric range, both ends included.
pub fn generate_ids(start: u64, end: u64) -> BTreeSet<RecordId> {
    (start..=end)
        .map(|id| RecordId::new(&id.to_string()))
        .collect()
}

/// Drops ids whose `<id>.<ext>` file already exists directly in `dir`.
/// Returns how many were removed.
pub fn remove_existing(ids: &mut BTreeSet<RecordId>, dir: &Path, ext: &str) -> usize {
    let mut removed = 0;
    for path in store::list_files(dir, ext, 0) {
        let id = RecordId::from_path_stem(&path.to_string_lossy());
        if !id.is_empty() && ids.remove(&id) {
            removed += 1;
        }
    }
    debug!(removed, dir = %dir.display(), "removed existing ids");
    removed
}
