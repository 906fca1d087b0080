use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::Outcome;

/// Byte counters for one snapshot download. Only ever grow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub total_bytes: u64,
    pub out_bytes: u64,
    pub failed_bytes: u64,
}

/// Files per outcome kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub counts: BTreeMap<Outcome, u64>,
}

impl Summary {
    pub fn record(&mut self, outcome: Outcome) {
        *self.counts.entry(outcome).or_default() += 1;
    }

    pub fn get(&self, outcome: Outcome) -> u64 {
        self.counts.get(&outcome).copied().unwrap_or(0)
    }

    pub fn succeeded(&self) -> u64 {
        self.counts
            .iter()
            .filter(|(o, _)| o.is_success())
            .map(|(_, n)| n)
            .sum()
    }

    pub fn failed(&self) -> u64 {
        self.counts
            .iter()
            .filter(|(o, _)| !o.is_success())
            .map(|(_, n)| n)
            .sum()
    }
}
