//! Bounded retention of population-by-species snapshots.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::Tick;

/// Population of one species at snapshot time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpeciesCount {
    pub species_id: u32,
    pub population: u32,
}

/// Census taken at a species identification pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PopulationSnapshot {
    pub tick: Tick,
    pub total: u32,
    pub species: Vec<SpeciesCount>,
}

/// Ring buffer of recent population snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analytics {
    window: VecDeque<PopulationSnapshot>,
    capacity: usize,
}

impl Analytics {
    /// Create a buffer retaining at most `capacity` snapshots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append a snapshot, evicting the oldest once at capacity.
    pub fn record(&mut self, snapshot: PopulationSnapshot) {
        if self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(snapshot);
    }

    /// Most recent snapshot, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&PopulationSnapshot> {
        self.window.back()
    }

    /// Iterate retained snapshots oldest-first.
    pub fn iter(&self) -> impl Iterator<Item = &PopulationSnapshot> {
        self.window.iter()
    }

    /// Number of retained snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Returns true when nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
