use crossbeam_channel::Sender;
use serde::Serialize;
use std::fs::{self, File};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::{info, warn};

use crate::config::DownloadOptions;
use crate::domain::{FileDescriptor, Outcome, Signature, Snapshot};
use crate::error::{Result, SalvageError};
use crate::ledger::{Outcomes, SignatureManager};
use crate::pipeline::executor::Executor;
use crate::pipeline::worker::Context;
use crate::repo::{BackupService, KeyBag, PathMapper};
use crate::select::FileFilter;
use crate::snapshot::{BASELINE_ID, SnapshotResolver};
use crate::stats::{Summary, Tally};

#[derive(Clone, Debug, Serialize)]
pub struct DownloadReport {
    pub snapshot: u64,
    pub tally: Tally,
    pub summary: Summary,
    /// Files that did not end up as usable plaintext, sorted by path.
    pub failed_files: Vec<(FileDescriptor, Outcome)>,
    /// Signatures whose content could not be fetched within the retry budget.
    pub failed_signatures: Vec<Signature>,
    /// Chunks written without a checksum to verify them against.
    pub unverified_chunks: usize,
}

pub struct Downloader {
    service: Arc<dyn BackupService>,
    keys: Arc<dyn KeyBag>,
    paths: Arc<dyn PathMapper>,
    opts: DownloadOptions,
    progress: Option<Sender<Outcomes>>,
    interrupt: Arc<AtomicBool>,
}

impl Downloader {
    pub fn new(
        service: Arc<dyn BackupService>,
        keys: Arc<dyn KeyBag>,
        paths: Arc<dyn PathMapper>,
        opts: DownloadOptions,
    ) -> Self {
        Self {
            service,
            keys,
            paths,
            opts,
            progress: None,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stream per-file outcomes as signatures settle.
    pub fn with_progress(mut self, tx: Sender<Outcomes>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Storing `true` stops running downloads with [`SalvageError::Cancelled`].
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.opts
    }

    /// Turn a requested id into a snapshot whose file list is available.
    pub fn resolve(&self, backup: &str, requested: i64) -> Result<Snapshot> {
        let resolver = SnapshotResolver::new(&self.service.snapshots(backup)?);
        let found = match resolver.resolve(requested) {
            Some(id) => self.service.snapshot(backup, id)?,
            None => None,
        };
        let found = match found {
            Some(s) => Some(s),
            None if requested == BASELINE_ID as i64 => {
                resolver.hunt_baseline(self.opts.hunt_limit, |id| self.service.snapshot(backup, id))?
            }
            None => None,
        };
        found.ok_or(SalvageError::SnapshotUnavailable(requested))
    }

    /// A resumable download of the files of `snapshot` selected by `filter`.
    pub fn session(&self, backup: &str, snapshot: Snapshot, filter: &FileFilter) -> SnapshotDownload<'_> {
        SnapshotDownload::new(self, backup, snapshot, filter)
    }

    pub fn download(&self, backup: &str, requested: i64, filter: &FileFilter) -> Result<DownloadReport> {
        let snapshot = self.resolve(backup, requested)?;
        self.session(backup, snapshot, filter).run()
    }
}

/// One snapshot being restored. Owns the ledger, so after an
/// authentication failure `run` may be called again to continue.
pub struct SnapshotDownload<'d> {
    downloader: &'d Downloader,
    backup: String,
    snapshot: u64,
    ledger: SignatureManager,
    /// Files with nothing to fetch, written on the first run.
    unsigned: Vec<FileDescriptor>,
    failed_signatures: Vec<Signature>,
    unverified_chunks: usize,
}

impl<'d> SnapshotDownload<'d> {
    fn new(downloader: &'d Downloader, backup: &str, snapshot: Snapshot, filter: &FileFilter) -> Self {
        let files = filter.apply(&snapshot.files);
        let (signed, unsigned): (Vec<_>, Vec<_>) =
            files.into_iter().partition(|f| f.has_signature() && f.size > 0);
        info!(
            snapshot = snapshot.id,
            selected = signed.len() + unsigned.len(),
            listed = snapshot.files.len(),
            "snapshot selected"
        );
        Self {
            downloader,
            backup: backup.to_owned(),
            snapshot: snapshot.id,
            ledger: SignatureManager::new(signed),
            unsigned,
            failed_signatures: Vec::new(),
            unverified_chunks: 0,
        }
    }

    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    pub fn ledger(&self) -> &SignatureManager {
        &self.ledger
    }

    pub fn is_done(&self) -> bool {
        self.unsigned.is_empty() && self.ledger.is_done()
    }

    pub fn run(&mut self) -> Result<DownloadReport> {
        let d = self.downloader;
        d.opts.validate()?;
        self.write_unsigned();

        let ctx = Context {
            service: d.service.as_ref(),
            keys: d.keys.as_ref(),
            paths: d.paths.as_ref(),
            ledger: &self.ledger,
            opts: &d.opts,
            backup: &self.backup,
            snapshot: self.snapshot,
            interrupt: d.interrupt.as_ref(),
            progress: d.progress.as_ref(),
        };
        let executor = Executor::new(ctx);
        let res = executor.run();
        let unverified = executor.unverified();
        drop(executor);
        self.unverified_chunks += unverified;
        self.failed_signatures.extend(res?);
        if self.unverified_chunks > 0 {
            warn!(chunks = self.unverified_chunks, "chunks restored without checksum");
        }

        let report = self.report();
        info!(
            snapshot = self.snapshot,
            succeeded = report.summary.succeeded(),
            failed = report.summary.failed(),
            out_bytes = report.tally.out_bytes,
            failed_bytes = report.tally.failed_bytes,
            "snapshot finished"
        );
        Ok(report)
    }

    /// Empty files and files without content are created directly.
    fn write_unsigned(&mut self) {
        let mut outcomes = Outcomes::new();
        for file in std::mem::take(&mut self.unsigned) {
            let outcome = match self
                .downloader
                .paths
                .path(self.snapshot, &file)
                .and_then(|p| create_empty(&p))
            {
                Ok(()) => Outcome::Success,
                Err(e) => {
                    warn!(path = %file.relative_path, error = %e, "could not create empty file");
                    Outcome::FailedDownload
                }
            };
            self.ledger.record(file.clone(), outcome);
            outcomes.insert(file, outcome);
        }
        if let (Some(tx), false) = (&self.downloader.progress, outcomes.is_empty()) {
            let _ = tx.send(outcomes);
        }
    }

    pub fn report(&self) -> DownloadReport {
        let mut failed_files: Vec<(FileDescriptor, Outcome)> = self
            .ledger
            .outcomes()
            .into_iter()
            .filter(|(_, o)| !o.is_success())
            .collect();
        failed_files.sort_by(|a, b| {
            (&a.0.domain, &a.0.relative_path).cmp(&(&b.0.domain, &b.0.relative_path))
        });
        DownloadReport {
            snapshot: self.snapshot,
            tally: self.ledger.tally(),
            summary: self.ledger.summary(),
            failed_files,
            failed_signatures: self.failed_signatures.clone(),
            unverified_chunks: self.unverified_chunks,
        }
    }
}

fn create_empty(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(path)?;
    Ok(())
}
