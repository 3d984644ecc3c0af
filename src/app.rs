use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::ResolvedConfig;
use crate::dispatch::{self, DispatchTarget, UploadDispatcher, UploadHandle};
use crate::domain::FetchOutcome;
use crate::error::SyncError;
use crate::fetch::Fetcher;
use crate::manifest::UploadLog;
use crate::reconcile::{ManifestReconciler, ReconcileReport, RemainingWork};
use crate::store;
use crate::text::RunClock;
use crate::upload::{self, BatchSummary, UploadClient};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub batch_size: Option<usize>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanItem {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanResult {
    pub report: ReconcileReport,
    pub remaining: Vec<PlanItem>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunResult {
    pub report: ReconcileReport,
    pub downloaded: usize,
    pub not_found: Vec<String>,
    pub failed: Vec<String>,
    pub batches: Vec<BatchSummary>,
    pub failed_batches: usize,
    pub dry_run: bool,
    pub elapsed: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub summary: BatchSummary,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
    /// Status line that the next event replaces.
    pub transient: bool,
}

impl ProgressEvent {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
            transient: true,
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<F: Fetcher, U: UploadClient + 'static> {
    fetcher: F,
    uploader: Arc<U>,
    clock: RunClock,
}

impl<F: Fetcher, U: UploadClient + 'static> App<F, U> {
    pub fn new(fetcher: F, uploader: U, clock: RunClock) -> Self {
        Self {
            fetcher,
            uploader: Arc::new(uploader),
            clock,
        }
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Remaining work without downloading anything.
    pub fn plan(
        &self,
        config: &ResolvedConfig,
        sink: &dyn ProgressSink,
    ) -> Result<PlanResult, SyncError> {
        let work = self.reconcile(config, sink)?;
        let remaining = work
            .items
            .values()
            .map(|entry| PlanItem {
                id: entry.id.to_string(),
                url: entry.url.clone(),
            })
            .collect();
        Ok(PlanResult {
            report: work.report,
            remaining,
        })
    }

    /// Downloads every remaining entry into the work directory, handing off a
    /// batch for upload every `batch_size` downloads when a bucket is set.
    pub fn run(
        &self,
        config: &ResolvedConfig,
        options: RunOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RunResult, SyncError> {
        if !options.dry_run {
            store::ensure_dir(&config.work_dir)?;
            UploadLog::new(&config.upload_log).ensure_header()?;
            self.recover_staging(config)?;
        }

        let work = self.reconcile(config, sink)?;
        let mut result = RunResult {
            report: work.report.clone(),
            dry_run: options.dry_run,
            ..RunResult::default()
        };
        if options.dry_run {
            result.elapsed = self.clock.format_elapsed();
            return Ok(result);
        }

        let dispatcher = match &config.bucket {
            Some(bucket) => Some(UploadDispatcher::new(
                Arc::clone(&self.uploader),
                DispatchTarget {
                    bucket: bucket.clone(),
                    project: config.project.clone(),
                    log: UploadLog::new(&config.upload_log),
                },
                config.poll_interval,
            )),
            None => {
                warn!("no bucket configured, files stay in the work directory");
                None
            }
        };

        let batch_size = options.batch_size.unwrap_or(config.batch_size).max(1);
        let total = work.len();
        // Files left over from an earlier run still need uploading.
        let mut in_batch = store::list_files_recursive(&config.work_dir).len();
        let mut pending: Option<UploadHandle> = None;

        for (index, entry) in work.items.values().enumerate() {
            let destination = config
                .work_dir
                .join(format!("{}.{}", entry.id, config.reconcile.extension));
            match self.fetcher.fetch_file(&entry.url, &destination) {
                Ok(FetchOutcome::Found(_)) => {
                    result.downloaded += 1;
                    in_batch += 1;
                }
                Ok(FetchOutcome::NotFound) => {
                    warn!(id = %entry.id, url = %entry.url, "file not found");
                    result.not_found.push(entry.id.to_string());
                }
                Err(err) => {
                    warn!(id = %entry.id, %err, "download failed");
                    result.failed.push(entry.id.to_string());
                }
            }
            sink.event(
                ProgressEvent::transient(format!(
                    "[{}] downloaded {}/{} | not found {} | failed {}",
                    self.clock.format_elapsed(),
                    index + 1,
                    total,
                    result.not_found.len(),
                    result.failed.len()
                ))
                .with_elapsed(self.clock.elapsed()),
            );

            if let Some(dispatcher) = &dispatcher {
                if in_batch >= batch_size {
                    let handle = dispatcher.dispatch(&config.work_dir, &config.staging_dir, sink)?;
                    if let Some(previous) = pending.replace(handle) {
                        record_batch(&mut result, previous.join());
                    }
                    in_batch = 0;
                }
            }
        }

        if let Some(dispatcher) = &dispatcher {
            if !store::list_files_recursive(&config.work_dir).is_empty() {
                let handle = dispatcher.dispatch(&config.work_dir, &config.staging_dir, sink)?;
                if let Some(previous) = pending.replace(handle) {
                    record_batch(&mut result, previous.join());
                }
            }
            if let Some(last) = pending.take() {
                sink.event(ProgressEvent::message("waiting for the last upload batch"));
                record_batch(&mut result, last.join());
            }
        }

        result.elapsed = self.clock.format_elapsed();
        info!(
            downloaded = result.downloaded,
            not_found = result.not_found.len(),
            failed = result.failed.len(),
            batches = result.batches.len(),
            elapsed = %result.elapsed,
            "run finished"
        );
        Ok(result)
    }

    /// Uploads `dir` in the foreground and logs the uploaded files. The
    /// directory is left in place.
    pub fn upload(
        &self,
        config: &ResolvedConfig,
        dir: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<UploadResult, SyncError> {
        let bucket = config.require_bucket()?;
        if !dir.is_dir() {
            return Err(SyncError::Filesystem(format!(
                "not a directory: {}",
                dir.display()
            )));
        }
        sink.event(ProgressEvent::message(format!(
            "uploading {} to {}",
            dir.display(),
            upload::remote_prefix(bucket, &config.project)
        )));
        let summary = upload::upload_and_log(
            self.uploader.as_ref(),
            dir,
            bucket,
            &config.project,
            &UploadLog::new(&config.upload_log),
        )?;
        Ok(UploadResult { summary })
    }

    fn reconcile(
        &self,
        config: &ResolvedConfig,
        sink: &dyn ProgressSink,
    ) -> Result<RemainingWork, SyncError> {
        sink.event(ProgressEvent::message(format!(
            "reconciling {}",
            config.manifest.display()
        )));
        let reconciler = ManifestReconciler::new(config.reconcile.clone());
        let work = reconciler.reconcile(&config.manifest, &config.upload_log, &config.work_dir)?;
        let report = &work.report;
        sink.event(ProgressEvent::message(format!(
            "total {} | uploaded {}/{} | downloaded {}/{} | remaining {}",
            report.manifest_total,
            report.log_matched,
            report.log_scanned,
            report.disk_matched,
            report.disk_scanned,
            report.remaining
        )));
        Ok(work)
    }

    /// A staging directory left behind by an interrupted run holds files that
    /// were never logged; move them back so they are counted as downloaded
    /// and uploaded with the next batch.
    fn recover_staging(&self, config: &ResolvedConfig) -> Result<(), SyncError> {
        let staging: &PathBuf = &config.staging_dir;
        if store::remove_dir_if_empty(staging)? {
            return Ok(());
        }
        warn!(dir = %staging.display(), "requeueing files from an interrupted upload");
        dispatch::requeue(staging, &config.work_dir)
    }
}

fn record_batch(result: &mut RunResult, outcome: Result<BatchSummary, SyncError>) {
    match outcome {
        Ok(summary) => result.batches.push(summary),
        Err(err) => {
            warn!(%err, "upload batch failed");
            result.failed_batches += 1;
        }
    }
}
