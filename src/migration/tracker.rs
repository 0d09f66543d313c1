// # Pending-Mod Tracker
//
// The donor's record of writes that hit the moving range after the clone
// snapshot was taken. The write path appends identities; the transfer
// stream drains them, looking document contents up at drain time so the
// latest write wins no matter how often an identity was touched.
//
// The tracker enforces the migration memory cap: when the two lists exceed
// the budget, the migration cannot keep up with the write rate and must
// abort rather than grow without bound.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::warn;

use crate::chunk::{ChunkRange, ShardKeyPattern};
use crate::common::Namespace;
use crate::migration::commands::TransferModsBatch;
use crate::shard::store::{DocId, MemStore, WriteObserver};

struct TrackerInner {
    /// Identities written (inserted or updated) inside the range.
    reload: VecDeque<DocId>,
    reload_members: HashSet<DocId>,
    /// Identities deleted from the range.
    deleted: VecDeque<DocId>,
    /// Approximate bytes held by both lists.
    bytes: u64,
    exceeded: bool,
}

pub struct ModTracker {
    ns: Namespace,
    pattern: ShardKeyPattern,
    range: ChunkRange,
    memory_limit: u64,
    inner: Mutex<TrackerInner>,
}

impl ModTracker {
    pub fn new(
        ns: Namespace,
        pattern: ShardKeyPattern,
        range: ChunkRange,
        memory_limit: u64,
    ) -> Self {
        Self {
            ns,
            pattern,
            range,
            memory_limit,
            inner: Mutex::new(TrackerInner {
                reload: VecDeque::new(),
                reload_members: HashSet::new(),
                deleted: VecDeque::new(),
                bytes: 0,
                exceeded: false,
            }),
        }
    }

    fn in_range(&self, doc: &serde_json::Value) -> bool {
        self.pattern
            .extract(doc)
            .map(|key| self.range.contains(&key))
            .unwrap_or(false)
    }

    fn note(&self, id: DocId, deleted: bool) {
        let mut inner = self.inner.lock();
        let size = id.approximate_size() as u64;
        if deleted {
            inner.reload_members.remove(&id);
            inner.deleted.push_back(id);
        } else if inner.reload_members.insert(id.clone()) {
            inner.reload.push_back(id);
        } else {
            // Already queued for reload; contents are read at drain time, so
            // there is nothing new to remember.
            return;
        }
        inner.bytes += size;
        if inner.bytes > self.memory_limit && !inner.exceeded {
            inner.exceeded = true;
            warn!(
                ns = %self.ns,
                bytes = inner.bytes,
                limit = self.memory_limit,
                "migration pending mods exceeded memory limit"
            );
        }
    }

    /// Whether the memory cap was blown; the donor must abort.
    pub fn exceeded_memory_limit(&self) -> bool {
        self.inner.lock().exceeded
    }

    pub fn pending_bytes(&self) -> u64 {
        self.inner.lock().bytes
    }

    pub fn is_drained(&self) -> bool {
        let inner = self.inner.lock();
        inner.reload.is_empty() && inner.deleted.is_empty()
    }

    /// Drain up to `batch_limit` bytes of pending mods into a transfer
    /// batch. Reload entries are resolved against the store now; an entry
    /// deleted since it was queued simply resolves to nothing (its delete
    /// is queued behind it).
    pub fn drain_batch(&self, store: &MemStore, batch_limit: u64) -> TransferModsBatch {
        let mut batch = TransferModsBatch::empty();
        let mut inner = self.inner.lock();

        while let Some(id) = inner.deleted.pop_front() {
            let size = id.approximate_size() as u64;
            batch.deleted.push(id.to_value());
            batch.size += size;
            inner.bytes = inner.bytes.saturating_sub(size);
            if batch.size >= batch_limit {
                return batch;
            }
        }

        while let Some(id) = inner.reload.pop_front() {
            inner.reload_members.remove(&id);
            let tracked = id.approximate_size() as u64;
            inner.bytes = inner.bytes.saturating_sub(tracked);
            if let Some(doc) = store.get(&self.ns, &id) {
                batch.size += doc.to_string().len() as u64;
                batch.reload.push(doc);
            }
            if batch.size >= batch_limit {
                break;
            }
        }
        batch
    }
}

impl WriteObserver for ModTracker {
    fn on_upsert(&self, ns: &Namespace, doc: &serde_json::Value) {
        if ns == &self.ns && self.in_range(doc) {
            if let Ok(id) = DocId::of(doc) {
                self.note(id, false);
            }
        }
    }

    fn on_delete(&self, ns: &Namespace, id: &DocId, doc: &serde_json::Value) {
        if ns == &self.ns && self.in_range(doc) {
            self.note(id.clone(), true);
        }
    }
}

/// Register a tracker on a store for the duration of a migration phase;
/// unregisters on drop so an aborted donor cannot leak its observer.
pub struct TrackerRegistration {
    store: Arc<MemStore>,
    id: crate::shard::store::ObserverId,
}

impl TrackerRegistration {
    pub fn new(store: Arc<MemStore>, tracker: Arc<ModTracker>) -> Self {
        let id = store.register_observer(tracker);
        Self { store, id }
    }
}

impl Drop for TrackerRegistration {
    fn drop(&mut self) {
        self.store.unregister_observer(self.id);
    }
}
