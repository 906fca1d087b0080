use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::crypto::hex::parse_hex;
use crate::domain::{Container, FileDescriptor, FileGroup, Signature, Snapshot, SnapshotInfo};
use crate::error::{Result, SalvageError};
use crate::paths::safe_join;
use crate::repo::{BackupService, MemKeyBag, OpenParams};

pub const CATALOG_FILE: &str = "catalog.json";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BackupEntry {
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    #[serde(default)]
    pub groups: Vec<FileGroup>,
    /// Every authorization answers with an authentication error.
    #[serde(default)]
    pub unauthorized: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub backups: BTreeMap<String, BackupEntry>,
    /// Hex wrapped key to hex file key.
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
}

impl Catalog {
    pub fn load(root: &Path) -> Result<Self> {
        let f = File::open(root.join(CATALOG_FILE))?;
        Ok(serde_json::from_reader(BufReader::new(f))?)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let f = File::create(root.join(CATALOG_FILE))?;
        serde_json::to_writer_pretty(BufWriter::new(f), self)?;
        Ok(())
    }

    pub fn key_bag(&self) -> Result<MemKeyBag> {
        let mut bag = MemKeyBag::default();
        for (wrapped, key) in &self.keys {
            bag.insert(parse_hex(wrapped)?, parse_hex(key)?);
        }
        Ok(bag)
    }
}

/// Backups described by `root/catalog.json`; container bodies are files
/// under `root` named by each container's `host`.
pub struct FsBackupService {
    root: PathBuf,
    catalog: Catalog,
}

impl FsBackupService {
    pub fn new(params: OpenParams) -> Result<Self> {
        let catalog = Catalog::load(&params.root)?;
        debug!(root = %params.root.display(), backups = catalog.backups.len(), "catalog loaded");
        Ok(Self {
            root: params.root,
            catalog,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn backup(&self, backup: &str) -> Result<&BackupEntry> {
        self.catalog
            .backups
            .get(backup)
            .ok_or_else(|| SalvageError::Format(format!("unknown backup: {backup}")))
    }

    fn container_path(&self, host: &str) -> Result<PathBuf> {
        let rel = host.strip_prefix("file://").unwrap_or(host);
        safe_join(&self.root, rel.trim_start_matches('/'))
    }
}

impl BackupService for FsBackupService {
    fn snapshots(&self, backup: &str) -> Result<Vec<SnapshotInfo>> {
        Ok(self.backup(backup)?.snapshots.iter().map(Snapshot::info).collect())
    }

    fn snapshot(&self, backup: &str, id: u64) -> Result<Option<Snapshot>> {
        Ok(self
            .backup(backup)?
            .snapshots
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    fn authorize(
        &self,
        backup: &str,
        snapshot: u64,
        files: &[FileDescriptor],
    ) -> Result<Vec<FileGroup>> {
        let entry = self.backup(backup)?;
        if entry.unauthorized {
            return Err(SalvageError::from_status(401, format!("backup {backup}")));
        }
        let wanted: HashSet<&Signature> = files.iter().map(|f| &f.signature).collect();
        let groups: Vec<FileGroup> = entry
            .groups
            .iter()
            .filter_map(|g| {
                let references: Vec<_> = g
                    .references
                    .iter()
                    .filter(|r| wanted.contains(&r.signature))
                    .cloned()
                    .collect();
                (!references.is_empty()).then(|| FileGroup {
                    containers: g.containers.clone(),
                    references,
                })
            })
            .collect();
        debug!(backup, snapshot, files = files.len(), groups = groups.len(), "authorized");
        Ok(groups)
    }

    fn fetch(&self, container: &Container) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.container_path(&container.host)?)?)
    }
}
