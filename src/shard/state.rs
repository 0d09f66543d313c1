// # Shard-Side Sharding State
//
// What a shard knows about each sharded collection: the collection epoch
// and shard key, its own current version (the max across chunks it owns),
// and the exact ranges it owns. Incoming requests are validated against
// this table before touching storage; a request stamped with an older
// version is rejected so its router refreshes.
//
// The per-collection critical-section gate makes migration commits
// boundary-safe: while a donor sits between its local version bump and the
// catalog commit, writes to the moving range block here rather than fail.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

use crate::chunk::{ChunkRange, ChunkVersion, Epoch, Key, ShardKeyPattern};
use crate::common::{Namespace, ShardId};
use crate::error::{Result, ShardError};

#[derive(Clone)]
pub struct CollectionShardState {
    pub epoch: Epoch,
    pub pattern: ShardKeyPattern,
    /// Max version across the chunks this shard owns; what the shard
    /// advertises in stale-version replies.
    pub version: ChunkVersion,
    pub owned: Vec<ChunkRange>,
}

/// Write gate for a collection's moving range during commit.
///
/// The barrier plays the role of the collection-level writer lock: each
/// write holds a read side across its ownership check and apply, and the
/// donor entering the critical section takes the write side once, so no
/// write can be mid-apply when the final mods are drained.
pub struct CriticalSection {
    active: AtomicBool,
    released: Notify,
    range: RwLock<Option<ChunkRange>>,
    barrier: tokio::sync::RwLock<()>,
}

impl CriticalSection {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            released: Notify::new(),
            range: RwLock::new(None),
            barrier: tokio::sync::RwLock::new(()),
        }
    }

    /// Begin blocking writes to `range`, then wait out every write already
    /// past the gate.
    pub async fn enter(&self, range: ChunkRange) {
        *self.range.write() = Some(range);
        self.active.store(true, Ordering::SeqCst);
        drop(self.barrier.write().await);
    }

    pub fn leave(&self) {
        self.active.store(false, Ordering::SeqCst);
        *self.range.write() = None;
        self.released.notify_waiters();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn blocks(&self, key: &Key) -> bool {
        if !self.is_active() {
            return false;
        }
        self.range
            .read()
            .as_ref()
            .map(|r| r.contains(key))
            .unwrap_or(false)
    }

    /// Block until writes to `key` are allowed, then take a permit that
    /// must be held across the write's check-and-apply.
    pub async fn write_permit(&self, key: &Key) -> tokio::sync::RwLockReadGuard<'_, ()> {
        loop {
            self.wait_for_write(key).await;
            let permit = self.barrier.read().await;
            // The section may have activated between the wait and the
            // permit; writes must not slip in behind the donor.
            if !self.blocks(key) {
                return permit;
            }
            drop(permit);
        }
    }

    /// Block until writes to `key` are allowed again.
    pub async fn wait_for_write(&self, key: &Key) {
        loop {
            let released = self.released.notified();
            if !self.blocks(key) {
                return;
            }
            released.await;
        }
    }
}

pub struct ShardingState {
    shard_id: ShardId,
    collections: RwLock<HashMap<Namespace, CollectionShardState>>,
    critical: RwLock<HashMap<Namespace, Arc<CriticalSection>>>,
}

impl ShardingState {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            collections: RwLock::new(HashMap::new()),
            critical: RwLock::new(HashMap::new()),
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Install or replace the collection state, typically after a refresh
    /// from the catalog.
    pub fn install(&self, ns: Namespace, state: CollectionShardState) {
        debug!(
            shard = %self.shard_id,
            ns = %ns,
            version = %state.version,
            owned = state.owned.len(),
            "installing collection shard state"
        );
        self.collections.write().insert(ns, state);
    }

    pub fn forget(&self, ns: &Namespace) {
        self.collections.write().remove(ns);
    }

    pub fn get(&self, ns: &Namespace) -> Option<CollectionShardState> {
        self.collections.read().get(ns).cloned()
    }

    /// The version this shard advertises for `ns`.
    pub fn version_of(&self, ns: &Namespace) -> ChunkVersion {
        self.collections
            .read()
            .get(ns)
            .map(|s| s.version)
            .unwrap_or(ChunkVersion::UNSHARDED)
    }

    /// Validate a request's version stamp against local state.
    ///
    /// - Same epoch, older stamp: `StaleShardVersion` carrying the local
    ///   version, so the router can tell whether its refresh caught up.
    /// - Different epoch: `IncompatibleEpoch`; the router must discard the
    ///   whole cache entry, not diff it.
    /// - Newer stamp: `Ok(false)` — the shard itself is behind and the
    ///   caller should refresh local state from the catalog, then recheck.
    pub fn check_version(&self, ns: &Namespace, received: &ChunkVersion) -> Result<bool> {
        let local = self.version_of(ns);

        if !received.same_epoch(&local) {
            // A shard that has never heard of the collection refreshes
            // before judging the epoch.
            if !local.is_set() && local.epoch().is_unsharded() {
                return Ok(false);
            }
            return Err(ShardError::IncompatibleEpoch(format!(
                "request epoch {} does not match collection epoch {} for {}",
                received.epoch(),
                local.epoch(),
                ns
            )));
        }

        if received.packed() < local.packed() {
            return Err(ShardError::StaleShardVersion {
                received: *received,
                wanted: local,
            });
        }
        Ok(received.packed() == local.packed())
    }

    /// Whether this shard owns the chunk containing `key`.
    pub fn owns_key(&self, ns: &Namespace, key: &Key) -> bool {
        self.collections
            .read()
            .get(ns)
            .map(|s| s.owned.iter().any(|r| r.contains(key)))
            .unwrap_or(false)
    }

    /// Remove an owned range and advance the local version; the donor's
    /// local half of a migration commit.
    pub fn relinquish_range(&self, ns: &Namespace, range: &ChunkRange, new_version: ChunkVersion) {
        let mut collections = self.collections.write();
        if let Some(state) = collections.get_mut(ns) {
            state.owned.retain(|r| r != range);
            state.version = new_version;
        }
    }

    pub fn critical_section(&self, ns: &Namespace) -> Arc<CriticalSection> {
        if let Some(cs) = self.critical.read().get(ns) {
            return Arc::clone(cs);
        }
        let mut table = self.critical.write();
        Arc::clone(
            table
                .entry(ns.clone())
                .or_insert_with(|| Arc::new(CriticalSection::new())),
        )
    }
}
