use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;

use manifest_sync::dispatch::{DispatchTarget, UploadDispatcher};
use manifest_sync::error::SyncError;
use manifest_sync::manifest::UploadLog;
use manifest_sync::output::JsonOutput;
use manifest_sync::store;
use manifest_sync::upload::{UploadClient, UploadedFile};

#[derive(Default)]
struct SlowUploader {
    delay: Duration,
    fail: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    batches: Mutex<Vec<Vec<String>>>,
}

impl UploadClient for SlowUploader {
    fn upload_dir(&self, dir: &Path, remote_prefix: &str) -> Result<Vec<UploadedFile>, SyncError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        thread::sleep(self.delay);

        let files = store::list_files_recursive(dir);
        let names: Vec<String> = files
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        self.batches.lock().unwrap().push(names.clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return Err(SyncError::UploadCommand("access denied".to_string()));
        }
        Ok(files
            .into_iter()
            .zip(names)
            .map(|(local, name)| UploadedFile {
                local,
                remote: format!("{remote_prefix}{name}"),
            })
            .collect())
    }
}

fn dispatcher(
    uploader: Arc<SlowUploader>,
    log: &Path,
) -> UploadDispatcher<SlowUploader> {
    UploadDispatcher::new(
        uploader,
        DispatchTarget {
            bucket: "s3://bucket".to_string(),
            project: "cards".to_string(),
            log: UploadLog::new(log),
        },
        Duration::from_millis(5),
    )
}

#[test]
fn wait_for_idle_returns_immediately_without_staging() {
    let temp = tempfile::tempdir().unwrap();
    let dispatcher = dispatcher(Arc::new(SlowUploader::default()), &temp.path().join("log.csv"));

    let polls = dispatcher
        .wait_for_idle(&temp.path().join("upload"), &JsonOutput)
        .unwrap();
    assert_eq!(polls, 0);
}

#[test]
fn wait_for_idle_blocks_until_staging_empties() {
    let temp = tempfile::tempdir().unwrap();
    let staging = temp.path().join("upload");
    fs::create_dir(&staging).unwrap();
    fs::write(staging.join("1.jpg"), b"jpeg").unwrap();

    let file = staging.join("1.jpg");
    let remover = thread::spawn(move || {
        thread::sleep(Duration::from_millis(60));
        fs::remove_file(file).unwrap();
    });

    let dispatcher = dispatcher(Arc::new(SlowUploader::default()), &temp.path().join("log.csv"));
    let polls = dispatcher.wait_for_idle(&staging, &JsonOutput).unwrap();
    remover.join().unwrap();

    assert!(polls >= 1);
    assert!(!staging.exists());
}

#[test]
fn at_most_one_batch_in_flight() {
    let temp = tempfile::tempdir().unwrap();
    let work = temp.path().join("files");
    let staging = temp.path().join("upload");
    let log = temp.path().join("uploaded.csv");
    fs::create_dir(&work).unwrap();

    let uploader = Arc::new(SlowUploader {
        delay: Duration::from_millis(80),
        ..SlowUploader::default()
    });
    let dispatcher = dispatcher(Arc::clone(&uploader), &log);

    fs::write(work.join("1.jpg"), b"one").unwrap();
    let first = dispatcher.dispatch(&work, &staging, &JsonOutput).unwrap();
    fs::write(work.join("2.jpg"), b"two").unwrap();
    fs::write(work.join("3.jpg"), b"three").unwrap();
    let second = dispatcher.dispatch(&work, &staging, &JsonOutput).unwrap();

    let first = first.join().unwrap();
    let second = second.join().unwrap();

    assert_eq!(uploader.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(
        *uploader.batches.lock().unwrap(),
        vec![vec!["1.jpg".to_string()], vec!["2.jpg".to_string(), "3.jpg".to_string()]]
    );
    assert_eq!(first.uploaded, 1);
    assert_eq!(second.uploaded, 2);
    assert_eq!(second.bytes, 8);
    assert!(work.is_dir());
    assert!(!staging.exists());

    let logged: Vec<String> = UploadLog::new(&log)
        .read()
        .unwrap()
        .into_iter()
        .map(|entry| entry.remote_path)
        .collect();
    assert_eq!(logged, vec!["/cards/1.jpg", "/cards/2.jpg", "/cards/3.jpg"]);
}

#[test]
fn failed_batch_is_requeued() {
    let temp = tempfile::tempdir().unwrap();
    let work = temp.path().join("files");
    let staging = temp.path().join("upload");
    let log = temp.path().join("uploaded.csv");
    fs::create_dir(&work).unwrap();
    fs::write(work.join("7.jpg"), b"seven").unwrap();

    let uploader = Arc::new(SlowUploader {
        fail: true,
        ..SlowUploader::default()
    });
    let handle = dispatcher(uploader, &log)
        .dispatch(&work, &staging, &JsonOutput)
        .unwrap();

    assert_matches!(handle.join(), Err(SyncError::UploadCommand(_)));
    assert!(!staging.exists());
    assert_eq!(fs::read(work.join("7.jpg")).unwrap(), b"seven");
    assert!(UploadLog::new(&log).read().unwrap().is_empty());
}

#[test]
fn back_to_back_failed_batches_lose_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let work = temp.path().join("files");
    let staging = temp.path().join("upload");
    fs::create_dir(&work).unwrap();

    let uploader = Arc::new(SlowUploader {
        delay: Duration::from_millis(1),
        fail: true,
        ..SlowUploader::default()
    });
    let dispatcher = UploadDispatcher::new(
        Arc::clone(&uploader),
        DispatchTarget {
            bucket: "s3://bucket".to_string(),
            project: "cards".to_string(),
            log: UploadLog::new(temp.path().join("uploaded.csv")),
        },
        Duration::ZERO,
    );

    let mut handles = Vec::new();
    for round in 0..60 {
        for item in 0..5 {
            fs::write(work.join(format!("{round}-{item}.jpg")), b"x").unwrap();
        }
        handles.push(dispatcher.dispatch(&work, &staging, &JsonOutput).unwrap());
        fs::write(work.join(format!("{round}-b.jpg")), b"b").unwrap();
        handles.push(dispatcher.dispatch(&work, &staging, &JsonOutput).unwrap());
    }
    for handle in handles {
        assert_matches!(handle.join(), Err(SyncError::UploadCommand(_)));
    }

    assert_eq!(uploader.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(store::list_files_recursive(&work).len(), 60 * 6);
    assert!(!staging.exists());
}
