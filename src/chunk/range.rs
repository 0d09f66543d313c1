// Half-open key ranges. A chunk owns `[min, max)`; the ranges of one
// collection are pairwise disjoint and together cover the whole key space.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::chunk::key::Key;
use crate::error::{Result, ShardError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    min: Key,
    max: Key,
}

impl ChunkRange {
    pub fn new(min: Key, max: Key) -> Result<Self> {
        if min >= max {
            return Err(ShardError::InvalidInput(format!(
                "invalid chunk range: min {} must be less than max {}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> &Key {
        &self.min
    }

    pub fn max(&self) -> &Key {
        &self.max
    }

    /// `min <= key < max`
    pub fn contains(&self, key: &Key) -> bool {
        &self.min <= key && key < &self.max
    }

    /// Whether two half-open ranges share any key.
    pub fn overlaps(&self, other: &ChunkRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// Whether `other` is entirely inside this range.
    pub fn covers(&self, other: &ChunkRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    /// Whether this range ends exactly where `other` begins.
    pub fn abuts(&self, other: &ChunkRange) -> bool {
        self.max == other.min
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}
