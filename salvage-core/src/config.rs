use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SalvageError};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadOptions {
    /// Worker threads in the pool.
    pub threads: usize,
    /// Delay between worker launches.
    pub stagger_ms: u64,
    /// Extra rounds after the first one.
    pub retry_count: u32,
    /// Times a batch may go back on the queue within one round.
    pub requeue_limit: u32,
    /// A batch is closed once its content exceeds this many bytes.
    pub batch_min_bytes: u64,
    /// Groups above this size decode into a temp file instead of memory.
    pub spill_threshold: u64,
    pub spill_dir: Option<PathBuf>,
    /// Attempts per container fetch before the container counts as failed.
    pub fetch_attempts: usize,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    /// Ids tried past a missing baseline when no later snapshot is known.
    pub hunt_limit: u64,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            threads: 4,
            stagger_ms: 50,
            retry_count: 3,
            requeue_limit: 1,
            batch_min_bytes: 16 * 1024 * 1024,
            spill_threshold: 256 * 1024 * 1024,
            spill_dir: None,
            fetch_attempts: 3,
            backoff_min_ms: 200,
            backoff_max_ms: 5_000,
            hunt_limit: 16,
        }
    }
}

impl DownloadOptions {
    pub fn from_json(path: &Path) -> Result<Self> {
        let f = std::fs::File::open(path)?;
        let opts: Self = serde_json::from_reader(std::io::BufReader::new(f))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(SalvageError::Config("threads must be at least 1".into()));
        }
        if self.fetch_attempts == 0 {
            return Err(SalvageError::Config(
                "fetch_attempts must be at least 1".into(),
            ));
        }
        if self.backoff_min_ms > self.backoff_max_ms {
            return Err(SalvageError::Config(
                "backoff_min_ms exceeds backoff_max_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}
