// # Catalog Documents
//
// Serde-serializable document types persisted in the authoritative catalog:
// one collection each for shards, sharded collections, chunks, the
// changelog, and distributed locks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::chunk::{Chunk, ChunkVersion, Epoch, ShardKeyPattern};
use crate::common::{Namespace, ShardId};

/// One document per shard in the `shards` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    #[serde(rename = "_id")]
    pub id: ShardId,

    /// Connection string for the shard.
    pub host: String,

    pub state: ShardState,

    /// Zone tags assigned by the administrator. Placement policy is outside
    /// this layer; the tags ride along as data.
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Size hint in megabytes; `None` means unlimited.
    #[serde(default)]
    pub max_size_mb: Option<u64>,

    /// Set when the shard is being decommissioned; a draining shard is not
    /// a valid migration recipient.
    #[serde(default)]
    pub draining: bool,
}

impl ShardEntry {
    pub fn new(id: impl Into<ShardId>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            state: ShardState::Active,
            tags: BTreeSet::new(),
            max_size_mb: None,
            draining: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardState {
    Active,
    Removed,
}

/// One document per sharded collection in the `collections` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionEntry {
    #[serde(rename = "_id")]
    pub ns: Namespace,

    pub epoch: Epoch,

    /// The shard key specification; immutable for the collection's life.
    pub key: ShardKeyPattern,

    #[serde(default)]
    pub unique: bool,

    /// Tombstone left behind by a drop; a recreate assigns a fresh epoch.
    #[serde(default)]
    pub dropped: bool,
}

/// Result of asking the catalog for chunks newer than a known version:
/// collection metadata plus the changed chunks. When the epoch differs
/// from the caller's, the chunk list is the full contents for the
/// namespace and the caller rebuilds from scratch.
#[derive(Debug, Clone)]
pub struct CollectionAndChunks {
    pub collection: CollectionEntry,
    pub changed_chunks: Vec<Chunk>,
}

/// Append-only operational history in the capped `changelog` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangelogEntry {
    #[serde(rename = "_id")]
    pub id: Uuid,

    /// Hostname of the process that wrote the entry.
    pub server: String,

    pub client_addr: String,

    pub time: DateTime<Utc>,

    /// Event kind, e.g. `moveChunk.start`, `split`, `merge`.
    pub what: String,

    pub ns: String,

    pub details: serde_json::Value,
}

/// Current holder of a distributed lock in the `locks` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEntry {
    #[serde(rename = "_id")]
    pub resource: String,

    /// Identity of the holder, `hostname:port:random`.
    pub who: String,

    /// Unique id of this acquisition; release must present it.
    pub ts: Uuid,

    pub why: String,

    /// Instant past which the lock is considered abandoned and may be
    /// stolen.
    pub expires_at: DateTime<Utc>,
}

/// A single mutation inside an atomic `apply_chunk_ops` batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChunkOp {
    /// Insert or replace the chunk document for the chunk's range.
    Upsert(Chunk),
    /// Remove the chunk document whose range max equals `max`.
    Delete {
        ns: Namespace,
        max: crate::chunk::Key,
    },
}

/// Assertion evaluated atomically with an `apply_chunk_ops` batch: the
/// catalog's current maximum version for the collection must equal
/// `expected_version`. A failed assertion means a concurrent commit won.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Precondition {
    pub ns: Namespace,
    pub expected_version: ChunkVersion,
}

/// Outcome of draining/removing a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveShardResult {
    /// Draining has just begun.
    Started,
    /// Draining continues; this many chunks still live on the shard.
    Ongoing { remaining_chunks: usize },
    /// The shard holds nothing and has been removed.
    Completed,
}

impl fmt::Display for RemoveShardResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoveShardResult::Started => write!(f, "draining started"),
            RemoveShardResult::Ongoing { remaining_chunks } => {
                write!(f, "draining ongoing, {} chunks remaining", remaining_chunks)
            }
            RemoveShardResult::Completed => write!(f, "shard removed"),
        }
    }
}
