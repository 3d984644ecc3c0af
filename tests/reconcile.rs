use std::fs;
use std::path::Path;

use assert_matches::assert_matches;

use manifest_sync::domain::{RecordId, ScanLayout};
use manifest_sync::error::SyncError;
use manifest_sync::manifest::{UploadLog, UPLOAD_LOG_HEADER};
use manifest_sync::reconcile::{ManifestReconciler, ReconcileSpec};

const MANIFEST: &str = "card_id,image_url\n1,http://x/1.jpg\n2,http://x/2.jpg\n3,\n";

fn write_manifest(dir: &Path, content: &str) -> std::path::PathBuf {
    let path = dir.join("records.csv");
    fs::write(&path, content).unwrap();
    path
}

fn write_log(dir: &Path, rows: &[&str]) -> std::path::PathBuf {
    let path = dir.join("uploaded.csv");
    let mut content = UPLOAD_LOG_HEADER.join(",");
    content.push('\n');
    for row in rows {
        content.push_str(row);
        content.push('\n');
    }
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn empty_log_and_directory_leaves_entries_with_urls() {
    let temp = tempfile::tempdir().unwrap();
    let manifest = write_manifest(temp.path(), MANIFEST);
    let local = temp.path().join("files");
    fs::create_dir(&local).unwrap();

    let work = ManifestReconciler::default()
        .reconcile(&manifest, &temp.path().join("uploaded.csv"), &local)
        .unwrap();

    assert_eq!(work.ids(), vec!["1", "2"]);
    assert_eq!(work.report.manifest_total, 2);
    assert_eq!(work.report.log_scanned, 0);
    assert_eq!(work.report.remaining, 2);
}

#[test]
fn logged_upload_is_removed() {
    let temp = tempfile::tempdir().unwrap();
    let manifest = write_manifest(temp.path(), MANIFEST);
    let log = write_log(
        temp.path(),
        &[
            "/archive/cards/1.jpg,2048,2026-10-01 10:00:00.000000",
            "/archive/cards/99.jpg,10,2026-10-01 10:00:01.000000",
        ],
    );

    let work = ManifestReconciler::default()
        .reconcile(&manifest, &log, &temp.path().join("missing-dir"))
        .unwrap();

    assert_eq!(work.ids(), vec!["2"]);
    assert_eq!(work.report.log_scanned, 2);
    assert_eq!(work.report.log_matched, 1);
    assert_eq!(work.report.disk_scanned, 0);
}

#[test]
fn downloaded_file_is_removed_regardless_of_log() {
    let temp = tempfile::tempdir().unwrap();
    let manifest = write_manifest(temp.path(), MANIFEST);
    let log = write_log(temp.path(), &[]);
    let local = temp.path().join("files");
    fs::create_dir(&local).unwrap();
    fs::write(local.join("2.jpg"), b"jpeg").unwrap();

    let work = ManifestReconciler::default()
        .reconcile(&manifest, &log, &local)
        .unwrap();

    assert_eq!(work.ids(), vec!["1"]);
    assert_eq!(work.report.disk_scanned, 1);
    assert_eq!(work.report.disk_matched, 1);
}

#[test]
fn empty_url_is_never_pending() {
    let temp = tempfile::tempdir().unwrap();
    let manifest = write_manifest(temp.path(), "id,url\n42,\n43,http://x/43.jpg\n");

    let work = ManifestReconciler::default()
        .reconcile(&manifest, &temp.path().join("none.csv"), &temp.path().join("none"))
        .unwrap();

    assert!(!work.items.keys().any(|id| id.as_str() == "42"));
    assert_eq!(work.ids(), vec!["43"]);
}

#[test]
fn result_never_contains_logged_ids_or_empty_urls() {
    let temp = tempfile::tempdir().unwrap();
    let mut content = String::from("id,name,url\n");
    let mut log_rows = Vec::new();
    for id in 0..50 {
        let url = if id % 7 == 0 { String::new() } else { format!("http://x/{id}.jpg") };
        content.push_str(&format!("ID{id},name {id},{url}\n"));
        if id % 3 == 0 {
            log_rows.push(format!("/p/id{id}.jpg,1,2026-10-01 10:00:00.000000"));
        }
    }
    let manifest = write_manifest(temp.path(), &content);
    let log_refs: Vec<&str> = log_rows.iter().map(String::as_str).collect();
    let log = write_log(temp.path(), &log_refs);

    let reconciler = ManifestReconciler::new(ReconcileSpec {
        id_column: 0,
        url_column: 2,
        ..ReconcileSpec::default()
    });
    let work = reconciler
        .reconcile(&manifest, &log, &temp.path().join("none"))
        .unwrap();

    let logged: Vec<String> = UploadLog::new(&log)
        .read()
        .unwrap()
        .iter()
        .map(|entry| entry.record_id().to_string())
        .collect();
    for (id, entry) in &work.items {
        assert!(!entry.url.is_empty());
        assert!(!logged.contains(&id.to_string()));
    }
    assert!(work.items.contains_key(&RecordId::new("ID1")));
}

#[test]
fn reconciliation_is_idempotent() {
    let temp = tempfile::tempdir().unwrap();
    let manifest = write_manifest(temp.path(), MANIFEST);
    let log = write_log(temp.path(), &["/p/2.jpg,5,2026-10-01 10:00:00.000000"]);
    let local = temp.path().join("files");
    fs::create_dir_all(local.join("batch-1")).unwrap();
    fs::write(local.join("batch-1").join("1.jpg"), b"").unwrap();

    let reconciler = ManifestReconciler::default();
    let first = reconciler.reconcile(&manifest, &log, &local).unwrap();
    let second = reconciler.reconcile(&manifest, &log, &local).unwrap();

    assert_eq!(first.ids(), second.ids());
    assert_eq!(first.report, second.report);
    assert!(first.is_empty());
}

#[test]
fn nested_layout_scans_configured_depth() {
    let temp = tempfile::tempdir().unwrap();
    let manifest = write_manifest(temp.path(), MANIFEST);
    let local = temp.path().join("files");
    fs::create_dir_all(local.join("2026").join("10")).unwrap();
    fs::write(local.join("2026").join("10").join("1.JPG"), b"").unwrap();

    let flat = ManifestReconciler::new(ReconcileSpec {
        layout: ScanLayout::Flat,
        ..ReconcileSpec::default()
    });
    assert_eq!(
        flat.reconcile(&manifest, &temp.path().join("none.csv"), &local)
            .unwrap()
            .ids(),
        vec!["1", "2"]
    );

    let nested = ManifestReconciler::new(ReconcileSpec {
        layout: ScanLayout::Nested { depth: 2 },
        ..ReconcileSpec::default()
    });
    assert_eq!(
        nested
            .reconcile(&manifest, &temp.path().join("none.csv"), &local)
            .unwrap()
            .ids(),
        vec!["2"]
    );
}

#[test]
fn missing_manifest_is_fatal() {
    let temp = tempfile::tempdir().unwrap();
    let result = ManifestReconciler::default().reconcile(
        &temp.path().join("absent.csv"),
        &temp.path().join("uploaded.csv"),
        temp.path(),
    );
    assert_matches!(result, Err(SyncError::ManifestNotFound(_)));
}

#[test]
fn blank_log_paths_are_ignored() {
    let temp = tempfile::tempdir().unwrap();
    let manifest = write_manifest(temp.path(), MANIFEST);
    let log = write_log(temp.path(), &[",0,", "/p/.jpg,0,"]);

    let work = ManifestReconciler::default()
        .reconcile(&manifest, &log, &temp.path().join("none"))
        .unwrap();

    assert_eq!(work.ids(), vec!["1", "2"]);
    assert_eq!(work.report.log_matched, 0);
}
