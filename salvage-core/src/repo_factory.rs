use std::sync::Arc;

use crate::error::Result;
use crate::repo::{BackupService, KeyBag, OpenParams};
use crate::repo_fs::{Catalog, FsBackupService};

pub enum Backend {
    Fs,
}

pub fn open_service(backend: Backend, p: OpenParams) -> Result<Arc<dyn BackupService>> {
    match backend {
        Backend::Fs => Ok(Arc::new(FsBackupService::new(p)?)),
    }
}

pub fn open_keys(backend: Backend, p: &OpenParams) -> Result<Arc<dyn KeyBag>> {
    match backend {
        Backend::Fs => Ok(Arc::new(Catalog::load(&p.root)?.key_bag()?)),
    }
}
