// # Chunk Map
//
// Ordered map of a collection's chunks, keyed by each range's exclusive
// upper bound. `upper_bound(k)` — the first entry whose key is strictly
// greater than `k` — locates the chunk containing `k`, because the previous
// entry's max is `<= k` and therefore that chunk's min is too. The
// MinKey/MaxKey sentinels guarantee total coverage, so a lookup can only
// miss if the map itself is inconsistent.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::chunk::key::Key;
use crate::chunk::range::ChunkRange;
use crate::chunk::version::ChunkVersion;
use crate::chunk::Chunk;
use crate::common::ShardId;
use crate::error::{Result, ShardError};

/// Shard-key bounds a predicate restricts a query to. `max_inclusive`
/// distinguishes an equality/`$lte` upper bound from the half-open form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBounds {
    pub min: Key,
    pub max: Key,
    pub max_inclusive: bool,
}

impl KeyBounds {
    pub fn point(key: Key) -> Self {
        Self {
            min: key.clone(),
            max: key,
            max_inclusive: true,
        }
    }

    pub fn half_open(min: Key, max: Key) -> Self {
        Self {
            min,
            max,
            max_inclusive: false,
        }
    }
}

/// Ordered map of half-open key ranges to owning shards.
#[derive(Debug, Clone, Default)]
pub struct ChunkMap {
    /// Keyed by each chunk's exclusive `max`.
    chunks: BTreeMap<Key, Chunk>,
}

impl ChunkMap {
    pub fn new() -> Self {
        Self {
            chunks: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    /// The collection version: the maximum chunk version in the map.
    pub fn version(&self) -> ChunkVersion {
        self.chunks
            .values()
            .max_by_key(|c| c.version.packed())
            .map(|c| c.version)
            .unwrap_or(ChunkVersion::UNSHARDED)
    }

    /// The newest version held by a particular shard, if it owns any chunk.
    /// Routers identify "what version does shard X hold" by this maximum.
    pub fn shard_version(&self, shard: &ShardId) -> Option<ChunkVersion> {
        self.chunks
            .values()
            .filter(|c| &c.shard == shard)
            .max_by_key(|c| c.version.packed())
            .map(|c| c.version)
    }

    /// First entry whose key (range max) is strictly greater than `key`.
    fn upper_bound(&self, key: &Key) -> Option<&Chunk> {
        self.chunks
            .range((Bound::Excluded(key.clone()), Bound::Unbounded))
            .next()
            .map(|(_, c)| c)
    }

    /// The chunk containing `key`.
    pub fn find_chunk(&self, key: &Key) -> Result<&Chunk> {
        let chunk = self.upper_bound(key).ok_or_else(|| {
            ShardError::ChunkNotFound(format!("no chunk contains key {}", key))
        })?;
        if !chunk.range.contains(key) {
            return Err(ShardError::ChunkNotFound(format!(
                "chunk map has a coverage gap at key {}",
                key
            )));
        }
        Ok(chunk)
    }

    /// The chunk whose range is exactly `[min, max)`, if present.
    pub fn find_exact(&self, range: &ChunkRange) -> Option<&Chunk> {
        self.chunks
            .get(range.max())
            .filter(|c| c.range == *range)
    }

    /// Every shard owning a chunk that intersects `[min, max)`.
    pub fn shards_for_range(&self, min: &Key, max: &Key) -> BTreeSet<ShardId> {
        let mut shards = BTreeSet::new();
        for (_, chunk) in self
            .chunks
            .range((Bound::Excluded(min.clone()), Bound::Unbounded))
        {
            if chunk.range.min() >= max {
                break;
            }
            shards.insert(chunk.shard.clone());
        }
        shards
    }

    /// Every shard a predicate restricted to `bounds` may touch.
    pub fn shards_for_query(&self, bounds: &KeyBounds) -> BTreeSet<ShardId> {
        if bounds.max_inclusive {
            let mut shards = self.shards_for_range(&bounds.min, &bounds.max);
            // Half-open scan misses the chunk owning the inclusive upper
            // bound itself when max lands on a chunk boundary.
            if let Ok(chunk) = self.find_chunk(&bounds.max) {
                shards.insert(chunk.shard.clone());
            }
            shards
        } else {
            self.shards_for_range(&bounds.min, &bounds.max)
        }
    }

    /// Every shard owning any chunk of the collection.
    pub fn all_shards(&self) -> BTreeSet<ShardId> {
        self.chunks.values().map(|c| c.shard.clone()).collect()
    }

    /// Insert a chunk, asserting it does not overlap an existing one.
    pub fn insert_chunk(&mut self, chunk: Chunk) -> Result<()> {
        if let Some(existing) = self.upper_bound(chunk.range.min()) {
            if existing.range.overlaps(&chunk.range) {
                return Err(ShardError::RangeOverlap(format!(
                    "chunk {} overlaps existing chunk {}",
                    chunk.range, existing.range
                )));
            }
        }
        self.chunks.insert(chunk.range.max().clone(), chunk);
        Ok(())
    }

    /// Apply a batch of changed chunks whose versions are strictly newer
    /// than the current maximum. For each incoming chunk, every entry whose
    /// range overlaps it is removed (located by two upper-bound probes, one
    /// at the incoming min and one at the incoming max) and the incoming
    /// chunk inserted in their place.
    ///
    /// Replaying the same batch reaches the same final state. A batch from a
    /// different epoch is NOT mergeable; the caller must rebuild from
    /// scratch, and a mid-batch epoch mismatch fails here with
    /// `ConflictingOperationInProgress`.
    pub fn apply_incremental_update(&mut self, mut changed: Vec<Chunk>) -> Result<()> {
        changed.sort_by_key(|c| c.version.packed());

        let epoch = self.version().epoch();
        for chunk in changed {
            if !self.is_empty() && !chunk.version.epoch().is_unsharded() {
                if chunk.version.epoch() != epoch {
                    return Err(ShardError::ConflictingOperationInProgress(format!(
                        "chunk {} has epoch {} different from that of the collection {}",
                        chunk.range,
                        chunk.version.epoch(),
                        epoch
                    )));
                }
            }

            // Entries with max in (chunk.min, chunk.max] overlap the
            // incoming range; collect then remove.
            let overlapping: Vec<Key> = self
                .chunks
                .range((
                    Bound::Excluded(chunk.range.min().clone()),
                    Bound::Included(chunk.range.max().clone()),
                ))
                .map(|(k, _)| k.clone())
                .collect();
            for k in overlapping {
                self.chunks.remove(&k);
            }

            self.chunks.insert(chunk.range.max().clone(), chunk);
        }
        Ok(())
    }

    /// Verify the structural invariants: ranges pairwise disjoint, each
    /// abutting the next, covering `[global min, global max)`, and every
    /// version in the same epoch.
    pub fn validate_coverage(&self, global_min: &Key, global_max: &Key) -> Result<()> {
        if self.chunks.is_empty() {
            return Err(ShardError::ConflictingOperationInProgress(
                "chunk map is empty".into(),
            ));
        }

        let epoch = self.version().epoch();
        let mut expected_min = global_min.clone();
        for chunk in self.chunks.values() {
            if chunk.range.min() != &expected_min {
                return Err(ShardError::ConflictingOperationInProgress(format!(
                    "chunk map has a gap or overlap: expected a chunk starting at {}, found {}",
                    expected_min, chunk.range
                )));
            }
            if chunk.version.epoch() != epoch {
                return Err(ShardError::ConflictingOperationInProgress(format!(
                    "chunk {} has epoch {} different from that of the collection {}",
                    chunk.range,
                    chunk.version.epoch(),
                    epoch
                )));
            }
            expected_min = chunk.range.max().clone();
        }
        if &expected_min != global_max {
            return Err(ShardError::ConflictingOperationInProgress(format!(
                "chunk map does not reach the key space maximum: last bound is {}",
                expected_min
            )));
        }
        Ok(())
    }
}
