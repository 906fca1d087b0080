use std::path::{Component, Path, PathBuf};

use crate::domain::FileDescriptor;
use crate::error::{Result, SalvageError};
use crate::repo::PathMapper;

/// `root/<snapshot>/<domain>/<relative_path>`.
#[derive(Clone, Debug)]
pub struct SnapshotPathMapper {
    pub root: PathBuf,
}

impl SnapshotPathMapper {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PathMapper for SnapshotPathMapper {
    fn path(&self, snapshot: u64, file: &FileDescriptor) -> Result<PathBuf> {
        let base = self.root.join(snapshot.to_string());
        let base = if file.domain.is_empty() {
            base
        } else {
            safe_join(&base, &file.domain)?
        };
        safe_join(&base, &file.relative_path)
    }
}

pub fn safe_join(root: &Path, rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);
    let escapes = p
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if rel.is_empty() || escapes || rel.contains("..\\") {
        return Err(SalvageError::Format(format!("unsafe path: {rel}")));
    }
    Ok(root.join(p))
}
