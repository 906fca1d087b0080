#![forbid(unsafe_code)]

pub mod config;
pub mod domain;
pub mod error;
pub mod stats;

pub mod util {
    pub mod hash_forward;
}

pub mod crypto {
    pub mod chunk;
    pub mod file;
    pub mod hex;
}

pub mod store {
    pub mod chunks;
}

pub mod queue {
    pub mod bundler;
    pub mod pool;
}

pub mod pipeline {
    pub mod executor;
    pub mod worker;
}

pub mod download;
pub mod ledger;
pub mod paths;
pub mod repo;
pub mod repo_factory;
pub mod repo_fs;
pub mod select;
pub mod snapshot;

// Re-exports: stable API surface
pub use config::DownloadOptions;
pub use domain::{FileDescriptor, Outcome, Signature, Snapshot, SnapshotInfo};
pub use download::{DownloadReport, Downloader, SnapshotDownload};
pub use error::{DecodeFailure, Result, SalvageError};
pub use paths::SnapshotPathMapper;
pub use repo::{BackupService, KeyBag, MemKeyBag, OpenParams, PathMapper};
pub use select::FileFilter;
