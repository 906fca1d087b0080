use tracing::{debug, info};

use crate::domain::{Snapshot, SnapshotInfo};
use crate::error::Result;

/// The conventional id of a backup's first snapshot.
pub const BASELINE_ID: u64 = 1;

#[derive(Clone, Debug, Default)]
pub struct SnapshotResolver {
    /// Committed ids, ascending.
    committed: Vec<u64>,
}

impl SnapshotResolver {
    pub fn new(infos: &[SnapshotInfo]) -> Self {
        let mut committed: Vec<u64> = infos.iter().filter(|s| s.committed).map(|s| s.id).collect();
        committed.sort_unstable();
        committed.dedup();
        Self { committed }
    }

    pub fn committed(&self) -> &[u64] {
        &self.committed
    }

    /// `0` is the earliest committed snapshot, a positive id names itself and
    /// `-k` counts back from the most recent one. Uncommitted ids never resolve.
    pub fn resolve(&self, requested: i64) -> Option<u64> {
        match requested {
            0 => self.committed.first().copied(),
            id if id > 0 => {
                let id = id as u64;
                self.committed.binary_search(&id).ok().map(|_| id)
            }
            back => {
                let k = back.unsigned_abs() as usize;
                self.committed
                    .len()
                    .checked_sub(k)
                    .map(|i| self.committed[i])
            }
        }
    }

    /// Try ids after a missing baseline, returning the first snapshot whose
    /// listing can be fetched.
    ///
    /// Hunting stops at the next committed id, or after `limit` ids when no
    /// later snapshot is known.
    pub fn hunt_baseline<F>(&self, limit: u64, mut lookup: F) -> Result<Option<Snapshot>>
    where
        F: FnMut(u64) -> Result<Option<Snapshot>>,
    {
        let last = self
            .committed
            .iter()
            .copied()
            .find(|&id| id > BASELINE_ID)
            .unwrap_or(BASELINE_ID + limit);
        for id in BASELINE_ID + 1..=last {
            debug!(id, "looking for baseline snapshot");
            if let Some(s) = lookup(id)? {
                info!(requested = BASELINE_ID, found = id, "baseline snapshot substituted");
                return Ok(Some(s));
            }
        }
        Ok(None)
    }
}
