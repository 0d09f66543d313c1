// # Chunk Model
//
// The partitioning vocabulary: shard-key space, half-open ranges, chunk
// versions, and the ordered chunk map every routing decision consults.

pub mod key;
pub mod map;
pub mod range;
pub mod version;

pub use key::{Key, KeyDirection, KeyValue, ShardKeyField, ShardKeyPattern};
pub use map::{ChunkMap, KeyBounds};
pub use range::ChunkRange;
pub use version::{ChunkVersion, Epoch};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::{Namespace, ShardId};

/// A contiguous key range of one collection, owned by exactly one shard.
/// The version is the newest version the owning shard has ever held for
/// this range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub ns: Namespace,
    pub range: ChunkRange,
    pub shard: ShardId,
    pub version: ChunkVersion,
}

impl Chunk {
    pub fn new(ns: Namespace, range: ChunkRange, shard: ShardId, version: ChunkVersion) -> Self {
        Self {
            ns,
            range,
            shard,
            version,
        }
    }

    /// Catalog document id: `ns-min`.
    pub fn id(&self) -> String {
        format!("{}-{}", self.ns, self.range.min())
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} on {} at {}",
            self.ns, self.range, self.shard, self.version
        )
    }
}
