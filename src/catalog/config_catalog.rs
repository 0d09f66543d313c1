// # In-Process Catalog
//
// Authoritative catalog state behind the `CatalogClient` surface: the set
// of shards, the chunk map of every sharded collection, the changelog, and
// the distributed lock table. Serves as the config service for in-process
// clusters and the harness the integration suite drives.
//
// All reads reflect fully applied writes only (the single state mutex
// stands in for majority read concern), and `apply_chunk_ops` evaluates its
// precondition atomically with the batch.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use async_trait::async_trait;

use crate::catalog::client::{CatalogClient, DistLock, LockReleaser};
use crate::catalog::types::{
    ChangelogEntry, ChunkOp, CollectionAndChunks, CollectionEntry, LockEntry, Precondition,
    RemoveShardResult, ShardEntry, ShardState,
};
use crate::chunk::{Chunk, ChunkRange, ChunkVersion, Epoch, Key, ShardKeyPattern};
use crate::common::{Namespace, ShardId};
use crate::error::{Result, ShardError};

const CHANGELOG_CAP: usize = 10_000;

#[derive(Default)]
struct CatalogState {
    shards: BTreeMap<ShardId, ShardEntry>,
    collections: BTreeMap<Namespace, CollectionEntry>,
    /// Per collection, chunks keyed by their exclusive range max.
    chunks: BTreeMap<Namespace, BTreeMap<Key, Chunk>>,
    changelog: VecDeque<ChangelogEntry>,
}

impl CatalogState {
    fn collection_version(&self, ns: &Namespace) -> ChunkVersion {
        self.chunks
            .get(ns)
            .and_then(|m| m.values().max_by_key(|c| c.version.packed()))
            .map(|c| c.version)
            .unwrap_or(ChunkVersion::UNSHARDED)
    }

    fn live_collection(&self, ns: &Namespace) -> Result<&CollectionEntry> {
        match self.collections.get(ns) {
            Some(entry) if !entry.dropped => Ok(entry),
            _ => Err(ShardError::NamespaceNotFound(ns.to_string())),
        }
    }
}

struct LockTable {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl LockTable {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn try_acquire(&self, resource: &str, who: &str, why: &str, ttl: Duration) -> Result<Uuid> {
        let mut entries = self.entries.lock();
        let now = Utc::now();
        if let Some(existing) = entries.get(resource) {
            if existing.expires_at > now {
                return Err(ShardError::LockBusy(format!(
                    "resource '{}' is locked by {} ({})",
                    resource, existing.who, existing.why
                )));
            }
            warn!(
                resource,
                expired_holder = %existing.who,
                "stealing expired distributed lock"
            );
        }
        let ts = Uuid::new_v4();
        entries.insert(
            resource.to_string(),
            LockEntry {
                resource: resource.to_string(),
                who: who.to_string(),
                ts,
                why: why.to_string(),
                expires_at: now
                    + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(15)),
            },
        );
        Ok(ts)
    }
}

impl LockReleaser for LockTable {
    fn release(&self, resource: &str, ts: Uuid) {
        let mut entries = self.entries.lock();
        // Only the acquisition that holds the lock may free it; a stolen
        // lock's original holder must not clobber the thief.
        if entries.get(resource).is_some_and(|e| e.ts == ts) {
            entries.remove(resource);
        }
    }
}

pub struct ConfigCatalog {
    state: Mutex<CatalogState>,
    locks: Arc<LockTable>,
    /// Test hook: make the next `apply_chunk_ops` apply its batch but report
    /// a network failure, simulating a lost commit acknowledgement.
    drop_next_apply_ack: AtomicBool,
}

impl ConfigCatalog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CatalogState::default()),
            locks: Arc::new(LockTable::new()),
            drop_next_apply_ack: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------
    // Administrative operations
    // ------------------------------------------------------------------

    pub fn add_shard(&self, entry: ShardEntry) -> Result<()> {
        let mut state = self.state.lock();
        if state.shards.contains_key(&entry.id) {
            return Err(ShardError::InvalidInput(format!(
                "shard '{}' already exists",
                entry.id
            )));
        }
        info!(shard = %entry.id, host = %entry.host, "adding shard");
        state.shards.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Shard a collection: record its key pattern under a fresh epoch and
    /// create the initial chunk `[MinKey, MaxKey)` at version (1, 0) on the
    /// primary shard. Re-sharding a dropped namespace assigns a new epoch.
    pub fn shard_collection(
        &self,
        ns: Namespace,
        key: ShardKeyPattern,
        unique: bool,
        primary_shard: &ShardId,
    ) -> Result<Epoch> {
        let mut state = self.state.lock();
        if !state.shards.contains_key(primary_shard) {
            return Err(ShardError::ShardNotFound(primary_shard.to_string()));
        }
        if let Some(existing) = state.collections.get(&ns) {
            if !existing.dropped {
                return Err(ShardError::InvalidInput(format!(
                    "collection {} is already sharded",
                    ns
                )));
            }
        }

        let epoch = Epoch::new();
        let range = ChunkRange::new(key.global_min(), key.global_max())?;
        let initial = Chunk::new(
            ns.clone(),
            range,
            primary_shard.clone(),
            ChunkVersion::new(epoch, 1, 0),
        );

        info!(ns = %ns, epoch = %epoch, key = %key, "sharding collection");
        state.collections.insert(
            ns.clone(),
            CollectionEntry {
                ns: ns.clone(),
                epoch,
                key,
                unique,
                dropped: false,
            },
        );
        let mut chunks = BTreeMap::new();
        chunks.insert(initial.range.max().clone(), initial);
        state.chunks.insert(ns, chunks);
        Ok(epoch)
    }

    /// Drop a sharded collection: tombstone the entry and discard its
    /// chunks. A later `shard_collection` on the same namespace starts a
    /// new incarnation with a new epoch.
    pub fn drop_collection(&self, ns: &Namespace) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .collections
            .get_mut(ns)
            .ok_or_else(|| ShardError::NamespaceNotFound(ns.to_string()))?;
        entry.dropped = true;
        state.chunks.remove(ns);
        info!(ns = %ns, "dropped collection");
        Ok(())
    }

    /// Begin or advance draining of a shard. The first call marks the shard
    /// draining; later calls report progress until no chunks remain, at
    /// which point the shard is removed.
    pub fn remove_shard(&self, id: &ShardId) -> Result<RemoveShardResult> {
        let mut state = self.state.lock();
        if !state.shards.contains_key(id) {
            return Err(ShardError::ShardNotFound(id.to_string()));
        }

        if !state.shards[id].draining {
            let entry = state.shards.get_mut(id).expect("checked above");
            entry.draining = true;
            info!(shard = %id, "shard draining started");
            return Ok(RemoveShardResult::Started);
        }

        let remaining: usize = state
            .chunks
            .values()
            .flat_map(|m| m.values())
            .filter(|c| &c.shard == id)
            .count();
        if remaining > 0 {
            return Ok(RemoveShardResult::Ongoing {
                remaining_chunks: remaining,
            });
        }

        let entry = state.shards.get_mut(id).expect("checked above");
        entry.state = ShardState::Removed;
        entry.draining = false;
        info!(shard = %id, "shard removed");
        Ok(RemoveShardResult::Completed)
    }

    /// All changelog entries, newest last. Primarily for operational
    /// inspection and tests.
    pub fn changelog(&self) -> Vec<ChangelogEntry> {
        self.state.lock().changelog.iter().cloned().collect()
    }

    /// The catalog's current maximum version for a collection.
    pub fn collection_version(&self, ns: &Namespace) -> ChunkVersion {
        self.state.lock().collection_version(ns)
    }

    /// Arrange for the next `apply_chunk_ops` to apply and then report a
    /// network error, as if the acknowledgement was lost in flight.
    pub fn drop_next_apply_ack(&self) {
        self.drop_next_apply_ack.store(true, Ordering::SeqCst);
    }
}

impl Default for ConfigCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CatalogClient for ConfigCatalog {
    async fn read_chunks_since(
        &self,
        ns: &Namespace,
        since: &ChunkVersion,
    ) -> Result<CollectionAndChunks> {
        let state = self.state.lock();
        let collection = state.live_collection(ns)?.clone();

        let chunks = state.chunks.get(ns).cloned().unwrap_or_default();
        let mut changed: Vec<Chunk> = if collection.epoch != since.epoch() {
            // New incarnation: the caller rebuilds from the full list.
            chunks.into_values().collect()
        } else {
            chunks
                .into_values()
                .filter(|c| c.version.packed() > since.packed())
                .collect()
        };
        // Consumers apply diffs in increasing version order.
        changed.sort_by_key(|c| c.version.packed());

        debug!(
            ns = %ns,
            since = %since,
            returned = changed.len(),
            "serving chunk diff"
        );
        Ok(CollectionAndChunks {
            collection,
            changed_chunks: changed,
        })
    }

    async fn apply_chunk_ops(&self, ops: Vec<ChunkOp>, precondition: Precondition) -> Result<()> {
        let mut state = self.state.lock();
        state.live_collection(&precondition.ns)?;

        let current = state.collection_version(&precondition.ns);
        let expected = precondition.expected_version;
        if !current.same_epoch(&expected) || current.packed() != expected.packed() {
            return Err(ShardError::PreconditionFailed(format!(
                "collection {} version is {}, expected {}",
                precondition.ns, current, expected
            )));
        }

        let chunks = state.chunks.entry(precondition.ns.clone()).or_default();
        for op in ops {
            match op {
                ChunkOp::Upsert(chunk) => {
                    chunks.insert(chunk.range.max().clone(), chunk);
                }
                ChunkOp::Delete { max, .. } => {
                    chunks.remove(&max);
                }
            }
        }

        if self.drop_next_apply_ack.swap(false, Ordering::SeqCst) {
            warn!(ns = %precondition.ns, "chunk ops applied but acknowledgement dropped");
            return Err(ShardError::Network(
                "connection reset while awaiting applyOps acknowledgement".into(),
            ));
        }
        Ok(())
    }

    async fn log_change(&self, what: &str, ns: &str, details: serde_json::Value) {
        let entry = ChangelogEntry {
            id: Uuid::new_v4(),
            server: hostname(),
            client_addr: "local".to_string(),
            time: Utc::now(),
            what: what.to_string(),
            ns: ns.to_string(),
            details,
        };
        let mut state = self.state.lock();
        if state.changelog.len() >= CHANGELOG_CAP {
            state.changelog.pop_front();
        }
        state.changelog.push_back(entry);
    }

    async fn acquire_dist_lock(
        &self,
        resource: &str,
        who: &str,
        why: &str,
        ttl: Duration,
    ) -> Result<DistLock> {
        let ts = self.locks.try_acquire(resource, who, why, ttl)?;
        debug!(resource, who, "acquired distributed lock");
        Ok(DistLock::new(
            resource.to_string(),
            ts,
            Arc::clone(&self.locks) as Arc<dyn LockReleaser>,
        ))
    }

    async fn get_collection(&self, ns: &Namespace) -> Result<CollectionEntry> {
        self.state.lock().live_collection(ns).cloned()
    }

    async fn get_shards(&self) -> Result<Vec<ShardEntry>> {
        Ok(self
            .state
            .lock()
            .shards
            .values()
            .filter(|s| s.state == ShardState::Active)
            .cloned()
            .collect())
    }

    async fn get_shard(&self, id: &ShardId) -> Result<ShardEntry> {
        self.state
            .lock()
            .shards
            .get(id)
            .filter(|s| s.state == ShardState::Active)
            .cloned()
            .ok_or_else(|| ShardError::ShardNotFound(id.to_string()))
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
