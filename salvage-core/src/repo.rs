// salvage_core/src/repo.rs
use crate::domain::{Container, FileDescriptor, FileGroup, Snapshot, SnapshotInfo};
use crate::error::Result;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct OpenParams {
    pub root: PathBuf,
}

/// The remote side of a backup: listings, authorization and container bodies.
pub trait BackupService: Send + Sync {
    fn snapshots(&self, backup: &str) -> Result<Vec<SnapshotInfo>>;

    /// `Ok(None)` when the snapshot's file list cannot be obtained.
    fn snapshot(&self, backup: &str, id: u64) -> Result<Option<Snapshot>>;

    /// Group `files` by signature and say which containers hold them.
    fn authorize(
        &self,
        backup: &str,
        snapshot: u64,
        files: &[FileDescriptor],
    ) -> Result<Vec<FileGroup>>;

    fn fetch(&self, container: &Container) -> Result<Vec<u8>>;
}

/// Unwraps per-file keys.
pub trait KeyBag: Send + Sync {
    fn file_key(&self, file: &FileDescriptor) -> Option<Vec<u8>>;
}

/// Keys looked up by the wrapped key bytes carried in the listing.
#[derive(Clone, Debug, Default)]
pub struct MemKeyBag {
    keys: HashMap<Vec<u8>, Vec<u8>>,
}

impl MemKeyBag {
    pub fn new(keys: HashMap<Vec<u8>, Vec<u8>>) -> Self {
        Self { keys }
    }

    pub fn insert(&mut self, wrapped: Vec<u8>, key: Vec<u8>) {
        self.keys.insert(wrapped, key);
    }
}

impl KeyBag for MemKeyBag {
    fn file_key(&self, file: &FileDescriptor) -> Option<Vec<u8>> {
        let wrapped = file.encryption_key.as_ref()?;
        self.keys.get(wrapped).cloned()
    }
}

/// Where a file lands on local disk.
pub trait PathMapper: Send + Sync {
    fn path(&self, snapshot: u64, file: &FileDescriptor) -> Result<PathBuf>;
}
