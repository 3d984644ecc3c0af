//! Hand-off between the downloading caller and the single background upload
//! worker. A batch moves from the work directory to the staging directory
//! only once the previous batch has left it, so at most one upload is ever in
//! flight.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::error::SyncError;
use crate::manifest::UploadLog;
use crate::store;
use crate::upload::{self, BatchSummary, UploadClient};

#[derive(Debug, Clone)]
pub struct DispatchTarget {
    pub bucket: String,
    pub project: String,
    pub log: UploadLog,
}

pub struct UploadDispatcher<U: UploadClient + 'static> {
    uploader: Arc<U>,
    target: DispatchTarget,
    poll_interval: Duration,
}

impl<U: UploadClient + 'static> UploadDispatcher<U> {
    pub fn new(uploader: Arc<U>, target: DispatchTarget, poll_interval: Duration) -> Self {
        Self {
            uploader,
            target,
            poll_interval,
        }
    }

    /// Blocks until `staging_dir` is absent or empty, removing it when empty.
    /// Returns how many times it had to wait.
    pub fn wait_for_idle(
        &self,
        staging_dir: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<usize, SyncError> {
        let mut polls = 0usize;
        while !store::remove_dir_if_empty(staging_dir)? {
            if polls == 0 {
                debug!(dir = %staging_dir.display(), "previous batch still uploading");
            }
            sink.event(ProgressEvent::transient("uploading previous batch..."));
            polls += 1;
            thread::sleep(self.poll_interval);
        }
        Ok(polls)
    }

    /// Moves the contents of `work_dir` into `staging_dir`, recreates
    /// `work_dir`, and uploads the batch on a background thread.
    pub fn dispatch(
        &self,
        work_dir: &Path,
        staging_dir: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<UploadHandle, SyncError> {
        self.wait_for_idle(staging_dir, sink)?;

        if let Some(parent) = staging_dir.parent() {
            store::ensure_dir(parent)?;
        }
        fs::rename(work_dir, staging_dir).map_err(|err| {
            SyncError::Filesystem(format!(
                "move {} to {}: {err}",
                work_dir.display(),
                staging_dir.display()
            ))
        })?;
        store::ensure_dir(work_dir)?;
        sink.event(ProgressEvent::message("batch handed off for upload"));

        let uploader = Arc::clone(&self.uploader);
        let target = self.target.clone();
        let staging = staging_dir.to_path_buf();
        let work = work_dir.to_path_buf();
        let handle = thread::Builder::new()
            .name("upload-worker".to_string())
            .spawn(move || run_batch(uploader.as_ref(), &target, &staging, &work))
            .map_err(|err| SyncError::Filesystem(format!("spawn upload worker: {err}")))?;
        Ok(UploadHandle { handle })
    }
}

fn run_batch<U: UploadClient + ?Sized>(
    uploader: &U,
    target: &DispatchTarget,
    staging: &Path,
    work: &Path,
) -> Result<BatchSummary, SyncError> {
    let result = upload::upload_batch(
        uploader,
        staging,
        &target.bucket,
        &target.project,
        &target.log,
    );
    if let Err(err) = &result {
        error!(%err, dir = %staging.display(), "batch upload failed, requeueing files");
        if let Err(requeue_err) = requeue(staging, work) {
            warn!(%requeue_err, "failed to requeue batch files");
        }
    }
    result
}

/// Returns a failed batch's files to the work directory so the next batch
/// picks them up, then removes the emptied staging directory.
///
/// The caller may be polling `staging` concurrently and moves the next batch
/// in as soon as it is empty, so nothing here removes it recursively.
pub(crate) fn requeue(staging: &Path, work: &Path) -> Result<(), SyncError> {
    store::ensure_dir(work)?;
    for file in store::list_files_recursive(staging) {
        let Some(name) = file.file_name() else {
            continue;
        };
        let target: PathBuf = work.join(name);
        fs::rename(&file, &target).map_err(|err| {
            SyncError::Filesystem(format!(
                "move {} to {}: {err}",
                file.display(),
                target.display()
            ))
        })?;
    }
    store::remove_empty_dirs(staging)
}

/// Handle to a running batch upload. Dropping it detaches the worker.
pub struct UploadHandle {
    handle: JoinHandle<Result<BatchSummary, SyncError>>,
}

impl UploadHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<BatchSummary, SyncError> {
        self.handle.join().map_err(|_| SyncError::WorkerPanicked)?
    }
}
