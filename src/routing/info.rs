// # Routing Snapshots
//
// The immutable per-collection view a router operates on: shard key, chunk
// map, and the collection version derived from it. Snapshots are shared by
// `Arc`; a refresh builds a new snapshot and swaps the cache's pointer, and
// old snapshots live until their last reader finishes. Nothing mutates a
// published snapshot.

use std::sync::Arc;
use tracing::debug;

use crate::catalog::CollectionAndChunks;
use crate::chunk::{Chunk, ChunkMap, ChunkVersion, Epoch, Key, KeyBounds, ShardKeyPattern};
use crate::common::{Namespace, ShardId};
use crate::error::Result;

#[derive(Debug)]
pub struct CollectionRoutingInfo {
    ns: Namespace,
    epoch: Epoch,
    pattern: ShardKeyPattern,
    chunk_map: ChunkMap,
    version: ChunkVersion,
}

impl CollectionRoutingInfo {
    pub fn ns(&self) -> &Namespace {
        &self.ns
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn pattern(&self) -> &ShardKeyPattern {
        &self.pattern
    }

    pub fn version(&self) -> ChunkVersion {
        self.version
    }

    pub fn num_chunks(&self) -> usize {
        self.chunk_map.len()
    }

    pub fn find_chunk(&self, key: &Key) -> Result<&Chunk> {
        self.chunk_map.find_chunk(key)
    }

    pub fn shards_for_query(&self, bounds: &KeyBounds) -> std::collections::BTreeSet<ShardId> {
        self.chunk_map.shards_for_query(bounds)
    }

    pub fn all_shards(&self) -> std::collections::BTreeSet<ShardId> {
        self.chunk_map.all_shards()
    }

    /// The version a particular shard advertises according to this
    /// snapshot: the max across the chunks it owns.
    pub fn shard_version(&self, shard: &ShardId) -> ChunkVersion {
        self.chunk_map
            .shard_version(shard)
            .unwrap_or_else(|| ChunkVersion::zero(self.epoch))
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunk_map.iter()
    }
}

/// Produce a new routing snapshot from an existing one plus the chunk diff
/// the catalog returned.
///
/// An epoch change discards the basis and rebuilds from scratch (the diff
/// then carries the full chunk list). When the diff turns out to be empty
/// the existing snapshot is returned unchanged, so callers can rely on
/// pointer identity to detect an unchanged map. Inconsistent metadata
/// (gaps, overlaps, mixed epochs) fails with
/// `ConflictingOperationInProgress`; the caller retries the whole reload a
/// bounded number of times.
pub fn refresh_routing_info(
    ns: &Namespace,
    existing: Option<Arc<CollectionRoutingInfo>>,
    update: CollectionAndChunks,
) -> Result<Arc<CollectionRoutingInfo>> {
    let pattern = update.collection.key.clone();
    let epoch = update.collection.epoch;

    let (mut chunk_map, starting_version) = match &existing {
        Some(info) if info.epoch == epoch => (info.chunk_map.clone(), info.version),
        Some(_) => {
            debug!(ns = %ns, "collection epoch changed, rebuilding routing info from scratch");
            (ChunkMap::new(), ChunkVersion::zero(epoch))
        }
        None => (ChunkMap::new(), ChunkVersion::zero(epoch)),
    };

    chunk_map.apply_incremental_update(update.changed_chunks)?;
    chunk_map.validate_coverage(&pattern.global_min(), &pattern.global_max())?;

    let version = chunk_map.version();
    if let Some(info) = existing {
        if info.epoch == epoch && info.version == version {
            // No diff applied; keep the snapshot (and its identity).
            return Ok(info);
        }
    }

    Ok(Arc::new(CollectionRoutingInfo {
        ns: ns.clone(),
        epoch,
        pattern,
        chunk_map,
        version,
    }))
}
