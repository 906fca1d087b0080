use backon::{BlockingRetryable, ExponentialBuilder};
use crossbeam_channel::Sender;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use time::OffsetDateTime;
use tracing::{debug, trace, warn};

use crate::config::DownloadOptions;
use crate::crypto::chunk::ChunkDecrypter;
use crate::crypto::file::{FileDecrypter, encrypted_path};
use crate::domain::{Container, FileDescriptor, FileGroup, Outcome, Signature, SignatureReferences};
use crate::error::{Result, SalvageError};
use crate::ledger::{Outcomes, SignatureManager};
use crate::queue::bundler::Batch;
use crate::repo::{BackupService, KeyBag, PathMapper};
use crate::store::chunks::{self, ChunkStore};

/// Everything a worker shares with its siblings for one download.
pub struct Context<'a> {
    pub service: &'a dyn BackupService,
    pub keys: &'a dyn KeyBag,
    pub paths: &'a dyn PathMapper,
    pub ledger: &'a SignatureManager,
    pub opts: &'a DownloadOptions,
    pub backup: &'a str,
    pub snapshot: u64,
    /// Set from outside the pool to stop the download.
    pub interrupt: &'a AtomicBool,
    pub progress: Option<&'a Sender<Outcomes>>,
}

pub struct Worker<'a> {
    id: usize,
    ctx: &'a Context<'a>,
    /// Set when a sibling hit a fatal error.
    cancelled: &'a AtomicBool,
    chunks: ChunkDecrypter,
    files: FileDecrypter,
}

impl<'a> Worker<'a> {
    pub fn new(id: usize, ctx: &'a Context<'a>, cancelled: &'a AtomicBool) -> Self {
        Self {
            id,
            ctx,
            cancelled,
            chunks: ChunkDecrypter::new(),
            files: FileDecrypter::new(),
        }
    }

    /// `Err(Cancelled)` once interrupted from outside; `Ok(true)` when a
    /// sibling already stopped the pool.
    fn stopping(&self) -> Result<bool> {
        if self.ctx.interrupt.load(Ordering::Acquire) {
            return Err(SalvageError::Cancelled);
        }
        Ok(self.cancelled.load(Ordering::Acquire))
    }

    /// Chunks accepted without a checksum so far.
    pub fn unverified(&self) -> usize {
        self.chunks.unverified()
    }

    /// Process `batch`. `Ok(Some(_))` is leftover work to requeue; `Err` is
    /// fatal for the whole pool.
    pub fn process(&mut self, batch: Batch) -> Result<Option<Batch>> {
        if self.stopping()? {
            return Ok(None);
        }
        trace!(worker = self.id, signatures = batch.len(), bytes = batch.bytes, "batch acquired");

        let groups = match self.ctx.service.authorize(
            self.ctx.backup,
            self.ctx.snapshot,
            &batch.representatives(),
        ) {
            Ok(groups) => groups,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(worker = self.id, error = %e, "authorization failed");
                return Ok(self.leftover(&batch));
            }
        };

        let wanted: HashSet<&Signature> = batch.signatures().collect();
        for group in &groups {
            if self.stopping()? {
                return Ok(None);
            }
            self.process_group(group, &wanted)?;
        }
        Ok(self.leftover(&batch))
    }

    /// Signatures of `batch` still open, if the batch may be requeued again.
    fn leftover(&self, batch: &Batch) -> Option<Batch> {
        if batch.attempt >= self.ctx.opts.requeue_limit {
            return None;
        }
        let mut next = Batch {
            attempt: batch.attempt + 1,
            ..Default::default()
        };
        for group in self.ctx.ledger.outstanding(batch.signatures().cloned()) {
            next.push(group);
        }
        if next.is_empty() {
            None
        } else {
            debug!(worker = self.id, signatures = next.len(), attempt = next.attempt, "requeueing");
            Some(next)
        }
    }

    fn process_group(&mut self, group: &FileGroup, wanted: &HashSet<&Signature>) -> Result<()> {
        let ledger = self.ctx.ledger;
        let refs: Vec<&SignatureReferences> = group
            .references
            .iter()
            .filter(|r| wanted.contains(&r.signature) && ledger.contains(&r.signature))
            .collect();
        if refs.is_empty() {
            return Ok(());
        }

        let mut store = match chunks::for_group(group.byte_len(), self.ctx.opts) {
            Ok(s) => s,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(worker = self.id, error = %e, "could not open chunk store");
                return Ok(());
            }
        };

        let mut failed = HashSet::new();
        for (idx, container) in group.containers.iter().enumerate() {
            if !refs.iter().any(|r| r.touches(idx)) {
                continue;
            }
            if self.stopping()? {
                return Ok(());
            }
            match self.fetch_decoded(container) {
                Ok(plain) => {
                    if let Err(e) = store.put(idx, plain) {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        warn!(worker = self.id, container = idx, error = %e, "could not buffer container");
                        failed.insert(idx);
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(worker = self.id, container = idx, host = %container.host, error = %e, "container failed");
                    failed.insert(idx);
                }
            }
        }

        for r in refs {
            if failed.iter().any(|&c| r.touches(c)) {
                continue;
            }
            let outcomes =
                ledger.write(&r.signature, |f| self.write_file(f, r, store.as_ref()))?;
            self.report(outcomes);
        }
        Ok(())
    }

    /// Fetch one container and decode it, retrying transient failures with
    /// exponential backoff.
    fn fetch_decoded(&mut self, container: &Container) -> Result<Vec<Vec<u8>>> {
        let opts = self.ctx.opts;
        let backoff = ExponentialBuilder::default()
            .with_min_delay(opts.backoff_min())
            .with_max_delay(opts.backoff_max())
            .with_max_times(opts.fetch_attempts.saturating_sub(1));
        let service = self.ctx.service;
        let decrypter = &mut self.chunks;
        let id = self.id;

        (|| -> Result<Vec<Vec<u8>>> {
            let raw = service.fetch(container)?;
            Ok(decrypter.decrypt(container, &raw)?)
        })
        .retry(backoff)
        .when(SalvageError::is_transient)
        .notify(|e, wait| debug!(worker = id, error = %e, ?wait, "retrying container"))
        .call()
    }

    /// Write one destination of `refs`. `Err` is fatal and leaves the
    /// signature open for a later run.
    fn write_file(
        &self,
        file: &FileDescriptor,
        refs: &SignatureReferences,
        store: &dyn ChunkStore,
    ) -> Result<Outcome> {
        self.stopping()?;
        let path = match self.ctx.paths.path(self.ctx.snapshot, file) {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %file.relative_path, error = %e, "no local path");
                return Ok(Outcome::FailedDownload);
            }
        };
        if let Err(e) = materialize(&path, refs, store) {
            let _ = fs::remove_file(&path);
            if e.is_fatal() {
                return Err(e);
            }
            warn!(path = %path.display(), error = %e, "write failed");
            return Ok(Outcome::FailedDownload);
        }

        let outcome = if file.is_encrypted() {
            self.decrypt(file, &path)
        } else {
            Outcome::Success
        };
        if outcome.is_success() {
            set_modified(&path, file.last_modified);
        }
        Ok(outcome)
    }

    fn decrypt(&self, file: &FileDescriptor, path: &Path) -> Outcome {
        let Some(key) = self.ctx.keys.file_key(file) else {
            // Park the ciphertext so it is not mistaken for plaintext.
            if let Err(e) = fs::rename(path, encrypted_path(path)) {
                warn!(path = %path.display(), error = %e, "could not park ciphertext");
            }
            return Outcome::FailedDecryptNoKey;
        };
        if !path.is_file() {
            return Outcome::FailedDecryptNoFile;
        }
        match self.files.decrypt(path, &key, file.decrypted_size) {
            Ok(_) => Outcome::SuccessDecrypted,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "decryption failed");
                Outcome::FailedDecryptError
            }
        }
    }

    fn report(&self, outcomes: Outcomes) {
        if outcomes.is_empty() {
            return;
        }
        if let Some(tx) = self.ctx.progress {
            // A dropped receiver only means nobody is watching.
            let _ = tx.send(outcomes);
        }
    }
}

fn materialize(path: &Path, refs: &SignatureReferences, store: &dyn ChunkStore) -> Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(path)?);
    let n = store.write_refs(&refs.chunks, &mut out)?;
    out.flush()?;
    Ok(n)
}

fn set_modified(path: &Path, unix_secs: i64) {
    let Ok(at) = OffsetDateTime::from_unix_timestamp(unix_secs) else {
        return;
    };
    let res = File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::from(at)));
    if let Err(e) = res {
        debug!(path = %path.display(), error = %e, "could not set modification time");
    }
}
