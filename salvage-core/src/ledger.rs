//! Per-download dedup ledger.
//!
//! Holds every outstanding signature with the destination files that share
//! it. A signature leaves the ledger exactly once, either through `write`
//! (content was fetched) or `fail` (retries exhausted). Outcomes are kept
//! per file: files behind one signature may still end up differently, for
//! example when only some of them have an unwrappable key.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::domain::{FileDescriptor, Outcome, Signature};
use crate::error::Result;
use crate::queue::bundler::{SignatureGroup, SignatureMap};
use crate::stats::{Summary, Tally};

pub type Outcomes = HashMap<FileDescriptor, Outcome>;

#[derive(Default)]
struct Book {
    open: HashMap<Signature, Vec<FileDescriptor>>,
    outcomes: Outcomes,
    tally: Tally,
}

impl Book {
    fn settle(&mut self, file: FileDescriptor, outcome: Outcome) {
        if outcome.is_success() {
            self.tally.out_bytes += file.size;
        } else {
            self.tally.failed_bytes += file.size;
        }
        self.outcomes.insert(file, outcome);
    }
}

#[derive(Default)]
pub struct SignatureManager {
    book: Mutex<Book>,
}

impl SignatureManager {
    pub fn new(files: impl IntoIterator<Item = FileDescriptor>) -> Self {
        let mut open: HashMap<Signature, Vec<FileDescriptor>> = HashMap::new();
        for f in files.into_iter().filter(FileDescriptor::has_signature) {
            let set = open.entry(f.signature.clone()).or_default();
            if !set.contains(&f) {
                set.push(f);
            }
        }
        Self {
            book: Mutex::new(Book {
                open,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self, signature: &Signature) -> Option<Vec<FileDescriptor>> {
        let mut book = self.lock();
        let files = book.open.remove(signature)?;
        book.tally.total_bytes += files.iter().map(|f| f.size).sum::<u64>();
        Some(files)
    }

    /// Claim `signature` and run `writer` once per file that references it.
    ///
    /// The writer runs outside the lock; a second call for the same
    /// signature writes nothing and returns an empty map. An `Err` from
    /// `writer` stops at that file and hands the signature back unsettled.
    pub fn write<F>(&self, signature: &Signature, mut writer: F) -> Result<Outcomes>
    where
        F: FnMut(&FileDescriptor) -> Result<Outcome>,
    {
        let Some(files) = self.claim(signature) else {
            warn!(%signature, "signature already settled; ignoring write");
            return Ok(Outcomes::new());
        };
        let mut done = Vec::with_capacity(files.len());
        let mut failure = None;
        for f in &files {
            match writer(f) {
                Ok(o) => done.push(o),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            self.unclaim(signature, files);
            return Err(e);
        }

        let mut book = self.lock();
        let mut out = Outcomes::with_capacity(done.len());
        for (f, o) in files.into_iter().zip(done) {
            book.settle(f.clone(), o);
            out.insert(f, o);
        }
        debug!(%signature, files = out.len(), "signature written");
        Ok(out)
    }

    fn unclaim(&self, signature: &Signature, files: Vec<FileDescriptor>) {
        let mut book = self.lock();
        book.tally.total_bytes -= files.iter().map(|f| f.size).sum::<u64>();
        book.open.insert(signature.clone(), files);
        debug!(%signature, "signature returned unsettled");
    }

    /// Mark every file behind `signature` as `FailedDownload`.
    pub fn fail(&self, signature: &Signature) -> Outcomes {
        let Some(files) = self.claim(signature) else {
            warn!(%signature, "signature already settled; ignoring failure");
            return Outcomes::new();
        };
        let mut book = self.lock();
        let mut out = Outcomes::with_capacity(files.len());
        for f in files {
            book.settle(f.clone(), Outcome::FailedDownload);
            out.insert(f, Outcome::FailedDownload);
        }
        out
    }

    /// Record a file that never had a signature to fetch.
    pub fn record(&self, file: FileDescriptor, outcome: Outcome) {
        let mut book = self.lock();
        book.tally.total_bytes += file.size;
        book.settle(file, outcome);
    }

    pub fn contains(&self, signature: &Signature) -> bool {
        self.lock().open.contains_key(signature)
    }

    pub fn remaining_signatures(&self) -> Vec<Signature> {
        let mut v: Vec<Signature> = self.lock().open.keys().cloned().collect();
        v.sort();
        v
    }

    pub fn remaining_files(&self) -> Vec<FileDescriptor> {
        self.lock().open.values().flatten().cloned().collect()
    }

    /// Outstanding work as a fresh map for the next round.
    pub fn remaining_map(&self) -> SignatureMap {
        let map = SignatureMap::new();
        for (s, files) in self.lock().open.iter() {
            map.merge(s.clone(), files.clone());
        }
        map
    }

    /// Outstanding groups restricted to `signatures`.
    pub fn outstanding(&self, signatures: impl IntoIterator<Item = Signature>) -> Vec<SignatureGroup> {
        let book = self.lock();
        signatures
            .into_iter()
            .filter_map(|s| {
                let files = book.open.get(&s)?.clone();
                Some(SignatureGroup {
                    signature: s,
                    files,
                })
            })
            .collect()
    }

    pub fn is_done(&self) -> bool {
        self.lock().open.is_empty()
    }

    pub fn tally(&self) -> Tally {
        self.lock().tally
    }

    pub fn outcomes(&self) -> Outcomes {
        self.lock().outcomes.clone()
    }

    pub fn summary(&self) -> Summary {
        let mut s = Summary::default();
        for o in self.lock().outcomes.values() {
            s.record(*o);
        }
        s
    }
}
