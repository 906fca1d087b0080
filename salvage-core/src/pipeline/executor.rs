//! Worker pool and retry rounds.
//!
//! Each round rebuilds a signature map from what the ledger still holds and
//! lets a scoped pool drain it through a [`WorkQueue`]. Whatever is still open
//! after the last round is failed permanently. A fatal error or an interrupt
//! stops the pool at once and leaves the ledger untouched so the download
//! can resume.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use tracing::{error, info, warn};

use crate::domain::Signature;
use crate::error::{Result, SalvageError};
use crate::queue::bundler::{Batch, Bundler};
use crate::queue::pool::WorkQueue;

use super::worker::{Context, Worker};

/// Poisons the queue if the owning worker unwinds, so siblings blocked in
/// `acquire` still observe shutdown.
struct PoisonOnPanic<'q>(&'q WorkQueue<Batch>);

impl Drop for PoisonOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.poison();
        }
    }
}

pub struct Executor<'a> {
    ctx: Context<'a>,
    unverified: AtomicUsize,
}

impl<'a> Executor<'a> {
    pub fn new(ctx: Context<'a>) -> Self {
        Self {
            ctx,
            unverified: AtomicUsize::new(0),
        }
    }

    /// Chunks accepted without a checksum, over every worker of every round.
    pub fn unverified(&self) -> usize {
        self.unverified.load(Ordering::Relaxed)
    }

    fn interrupted(&self) -> Result<()> {
        if self.ctx.interrupt.load(Ordering::Acquire) {
            return Err(SalvageError::Cancelled);
        }
        Ok(())
    }

    /// Run up to `retry_count + 1` rounds; returns the signatures that failed
    /// permanently.
    pub fn run(&self) -> Result<Vec<Signature>> {
        let opts = self.ctx.opts;
        for round in 0..=opts.retry_count {
            if self.ctx.ledger.is_done() {
                break;
            }
            self.interrupted()?;
            self.round(round)?;
        }

        let failed = self.ctx.ledger.remaining_signatures();
        if !failed.is_empty() {
            self.interrupted()?;
        }
        for signature in &failed {
            let outcomes = self.ctx.ledger.fail(signature);
            if let Some(tx) = self.ctx.progress {
                let _ = tx.send(outcomes);
            }
        }
        if !failed.is_empty() {
            warn!(signatures = failed.len(), "retries exhausted");
        }
        Ok(failed)
    }

    fn round(&self, round: u32) -> Result<()> {
        let map = Arc::new(self.ctx.ledger.remaining_map());
        let open = map.len();
        let threads = self.ctx.opts.threads.min(open).max(1);
        info!(round, signatures = open, threads, "round started");

        let queue = WorkQueue::draining(Bundler::new(map, self.ctx.opts.batch_min_bytes));
        let cancelled = AtomicBool::new(false);
        let ctx = &self.ctx;
        let unverified = &self.unverified;

        let res = thread::scope(|s| {
            let mut handles = Vec::with_capacity(threads);
            for id in 0..threads {
                if id > 0 {
                    thread::sleep(ctx.opts.stagger());
                }
                if cancelled.load(Ordering::Acquire) {
                    break;
                }
                let queue = &queue;
                let cancelled = &cancelled;
                let spawned = thread::Builder::new()
                    .name(format!("salvage-worker-{id}"))
                    .spawn_scoped(s, move || -> Result<()> {
                        let _guard = PoisonOnPanic(queue);
                        let mut worker = Worker::new(id, ctx, cancelled);
                        let mut res = Ok(());
                        while let Some(batch) = queue.acquire() {
                            match worker.process(batch) {
                                Ok(next) => queue.release(next),
                                Err(e) => {
                                    error!(worker = id, error = %e, "stopping pool");
                                    cancelled.store(true, Ordering::Release);
                                    queue.poison();
                                    queue.release(None);
                                    res = Err(e);
                                    break;
                                }
                            }
                        }
                        unverified.fetch_add(worker.unverified(), Ordering::Relaxed);
                        res
                    });
                match spawned {
                    Ok(h) => handles.push(h),
                    Err(e) if handles.is_empty() => return Err(SalvageError::Io(e)),
                    Err(e) => {
                        warn!(error = %e, started = handles.len(), "could not start more workers");
                        break;
                    }
                }
            }

            let mut first_error: Option<SalvageError> = None;
            for handle in handles {
                let res = match handle.join() {
                    Ok(r) => r,
                    Err(_panic) => Err(SalvageError::Worker("worker panicked".into())),
                };
                if let Err(e) = res {
                    cancelled.store(true, Ordering::Release);
                    first_error.get_or_insert(e);
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        });

        let left = self.ctx.ledger.remaining_signatures().len();
        info!(round, remaining = left, "round finished");
        res
    }
}
