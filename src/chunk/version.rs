// # Chunk Versions
//
// The two-number version stamped on every routing decision. `major`
// increments when a chunk changes owner (migration), `minor` when a chunk is
// carved up in place (split). The epoch identifies the collection
// incarnation; versions from different epochs are incomparable, and callers
// must check `same_epoch` before asking for an ordering.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, ShardError};

/// Opaque identifier for one incarnation of a sharded collection. Assigned
/// when the collection is first sharded, regenerated on drop + recreate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch(Uuid);

impl Epoch {
    /// A fresh epoch for a newly sharded collection.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The epoch carried by `ChunkVersion::UNSHARDED`.
    pub const fn unsharded() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_unsharded(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(epoch, major, minor)` stamp identifying a chunk's age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkVersion {
    epoch: Epoch,
    major: u32,
    minor: u32,
}

impl ChunkVersion {
    /// Denotes "collection is not sharded".
    pub const UNSHARDED: ChunkVersion = ChunkVersion {
        epoch: Epoch::unsharded(),
        major: 0,
        minor: 0,
    };

    pub fn new(epoch: Epoch, major: u32, minor: u32) -> Self {
        Self {
            epoch,
            major,
            minor,
        }
    }

    /// The zero version within an epoch: every real chunk version in that
    /// epoch is newer. Used as the refresh floor for a full reload.
    pub fn zero(epoch: Epoch) -> Self {
        Self {
            epoch,
            major: 0,
            minor: 0,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Whether this version carries any actual history (non-zero counter).
    pub fn is_set(&self) -> bool {
        self.major != 0 || self.minor != 0
    }

    pub fn same_epoch(&self, other: &ChunkVersion) -> bool {
        self.epoch == other.epoch
    }

    /// Lexicographic `(major, minor)` comparison within a shared epoch.
    /// Epoch flips are catastrophic (collection recreated) and must never be
    /// masked by numeric ordering, so cross-epoch comparison is an error.
    pub fn is_older_than(&self, other: &ChunkVersion) -> Result<bool> {
        if !self.same_epoch(other) {
            return Err(ShardError::IncompatibleEpoch(format!(
                "cannot compare versions from different epochs ({} vs {})",
                self.epoch, other.epoch
            )));
        }
        Ok(self.packed() < other.packed())
    }

    /// Migration: new owner, counters restart below the new major.
    pub fn increment_major(&self) -> Self {
        Self {
            epoch: self.epoch,
            major: self.major + 1,
            minor: 0,
        }
    }

    /// Split: same owner, finer-grained chunk.
    pub fn increment_minor(&self) -> Self {
        Self {
            epoch: self.epoch,
            major: self.major,
            minor: self.minor + 1,
        }
    }

    /// The combined counter packed `major:minor` into one 64-bit value, the
    /// wire and comparison form of the counter pair.
    pub fn packed(&self) -> u64 {
        (u64::from(self.major) << 32) | u64::from(self.minor)
    }

    /// Rebuild from the packed counter plus epoch.
    pub fn from_packed(epoch: Epoch, packed: u64) -> Self {
        Self {
            epoch,
            major: (packed >> 32) as u32,
            minor: (packed & 0xffff_ffff) as u32,
        }
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_within_epoch() {
        let e = Epoch::new();
        let v10 = ChunkVersion::new(e, 1, 0);
        let v11 = ChunkVersion::new(e, 1, 1);
        let v20 = ChunkVersion::new(e, 2, 0);

        assert!(v10.is_older_than(&v11).unwrap());
        assert!(v11.is_older_than(&v20).unwrap());
        assert!(!v20.is_older_than(&v10).unwrap());
        assert!(!v10.is_older_than(&v10).unwrap());
    }

    #[test]
    fn test_cross_epoch_comparison_fails() {
        let a = ChunkVersion::new(Epoch::new(), 1, 0);
        let b = ChunkVersion::new(Epoch::new(), 5, 0);
        assert!(!a.same_epoch(&b));
        assert!(matches!(
            a.is_older_than(&b),
            Err(ShardError::IncompatibleEpoch(_))
        ));
    }

    #[test]
    fn test_increments() {
        let e = Epoch::new();
        let v = ChunkVersion::new(e, 3, 7);
        assert_eq!(v.increment_major(), ChunkVersion::new(e, 4, 0));
        assert_eq!(v.increment_minor(), ChunkVersion::new(e, 3, 8));
    }

    #[test]
    fn test_packed_round_trip() {
        let e = Epoch::new();
        let v = ChunkVersion::new(e, 0xdead, 0xbeef);
        assert_eq!(ChunkVersion::from_packed(e, v.packed()), v);
        assert_eq!(v.packed(), 0x0000_dead_0000_beef);
    }

    #[test]
    fn test_unsharded_constant() {
        assert!(!ChunkVersion::UNSHARDED.is_set());
        assert!(ChunkVersion::UNSHARDED.epoch().is_unsharded());
    }
}
