// # Range Store
//
// The storage seam a shard exposes to the sharding layer. The engine
// itself lives elsewhere; what migrations and the write path need from it
// is identity-addressed upserts and deletes, range scans in shard-key
// order, and a write-observer hook so an active migration can track
// changes to the moving range.
//
// `MemStore` is the in-process implementation backing tests and
// single-process clusters.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::chunk::{ChunkRange, ShardKeyPattern};
use crate::common::Namespace;
use crate::error::{Result, ShardError};

/// Identity of a document: the canonical JSON encoding of its `_id` field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocId(String);

impl DocId {
    /// Extract the identity from a document. Every stored document must
    /// carry `_id`.
    pub fn of(doc: &serde_json::Value) -> Result<Self> {
        let id = doc.get("_id").ok_or_else(|| {
            ShardError::InvalidInput("document has no _id field".to_string())
        })?;
        Ok(Self(id.to_string()))
    }

    /// Identity from a bare `_id` value, as carried in delete mods.
    pub fn from_value(id: &serde_json::Value) -> Self {
        Self(id.to_string())
    }

    /// The `_id` value this identity encodes.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.0).unwrap_or(serde_json::Value::Null)
    }

    /// Rough memory footprint for migration accounting.
    pub fn approximate_size(&self) -> usize {
        self.0.len() + 24
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attach a fresh `_id` when a document arrives without one.
pub fn ensure_doc_id(doc: &mut serde_json::Value) -> Result<DocId> {
    let obj = doc.as_object_mut().ok_or_else(|| {
        ShardError::InvalidInput("document must be an object".to_string())
    })?;
    if !obj.contains_key("_id") {
        obj.insert(
            "_id".to_string(),
            serde_json::Value::String(Uuid::new_v4().to_string()),
        );
    }
    DocId::of(doc)
}

/// Observer of the local write path. An active migration registers one to
/// keep its pending-mod lists current.
pub trait WriteObserver: Send + Sync {
    fn on_upsert(&self, ns: &Namespace, doc: &serde_json::Value);

    /// `doc` is the pre-image, so the observer can test range membership.
    fn on_delete(&self, ns: &Namespace, id: &DocId, doc: &serde_json::Value);
}

pub type ObserverId = u64;

/// In-memory identity-addressed document store with range scans.
pub struct MemStore {
    collections: RwLock<HashMap<Namespace, BTreeMap<DocId, serde_json::Value>>>,
    observers: RwLock<Vec<(ObserverId, Arc<dyn WriteObserver>)>>,
    next_observer: AtomicU64,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    pub fn register_observer(&self, observer: Arc<dyn WriteObserver>) -> ObserverId {
        let id = self.next_observer.fetch_add(1, Ordering::SeqCst);
        self.observers.write().push((id, observer));
        id
    }

    pub fn unregister_observer(&self, id: ObserverId) {
        self.observers.write().retain(|(oid, _)| *oid != id);
    }

    fn notify_upsert(&self, ns: &Namespace, doc: &serde_json::Value) {
        for (_, observer) in self.observers.read().iter() {
            observer.on_upsert(ns, doc);
        }
    }

    fn notify_delete(&self, ns: &Namespace, id: &DocId, doc: &serde_json::Value) {
        for (_, observer) in self.observers.read().iter() {
            observer.on_delete(ns, id, doc);
        }
    }

    /// Insert or replace by identity.
    pub fn upsert(&self, ns: &Namespace, doc: serde_json::Value) -> Result<DocId> {
        let id = DocId::of(&doc)?;
        self.collections
            .write()
            .entry(ns.clone())
            .or_default()
            .insert(id.clone(), doc.clone());
        self.notify_upsert(ns, &doc);
        Ok(id)
    }

    /// Delete by identity; returns the removed document.
    pub fn delete(&self, ns: &Namespace, id: &DocId) -> Option<serde_json::Value> {
        let removed = self
            .collections
            .write()
            .get_mut(ns)
            .and_then(|coll| coll.remove(id));
        if let Some(doc) = &removed {
            self.notify_delete(ns, id, doc);
        }
        removed
    }

    pub fn get(&self, ns: &Namespace, id: &DocId) -> Option<serde_json::Value> {
        self.collections
            .read()
            .get(ns)
            .and_then(|coll| coll.get(id).cloned())
    }

    pub fn count(&self, ns: &Namespace) -> usize {
        self.collections
            .read()
            .get(ns)
            .map(|coll| coll.len())
            .unwrap_or(0)
    }

    /// Every document in the collection, in identity order.
    pub fn scan(&self, ns: &Namespace) -> Vec<serde_json::Value> {
        self.collections
            .read()
            .get(ns)
            .map(|coll| coll.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Identities of the documents whose shard key falls inside `range`.
    /// The snapshot a migration clones from.
    pub fn ids_in_range(
        &self,
        ns: &Namespace,
        pattern: &ShardKeyPattern,
        range: &ChunkRange,
    ) -> Vec<DocId> {
        self.collections
            .read()
            .get(ns)
            .map(|coll| {
                coll.iter()
                    .filter(|(_, doc)| {
                        pattern
                            .extract(doc)
                            .map(|key| range.contains(&key))
                            .unwrap_or(false)
                    })
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Documents whose shard key falls inside `range`.
    pub fn scan_range(
        &self,
        ns: &Namespace,
        pattern: &ShardKeyPattern,
        range: &ChunkRange,
    ) -> Vec<serde_json::Value> {
        self.collections
            .read()
            .get(ns)
            .map(|coll| {
                coll.values()
                    .filter(|doc| {
                        pattern
                            .extract(doc)
                            .map(|key| range.contains(&key))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove every document in `range` without notifying observers: the
    /// post-migration sweep of a moved range and the recipient's residue
    /// cleanup are metadata operations, not client writes.
    pub fn purge_range(
        &self,
        ns: &Namespace,
        pattern: &ShardKeyPattern,
        range: &ChunkRange,
    ) -> usize {
        let ids = self.ids_in_range(ns, pattern, range);
        let mut collections = self.collections.write();
        let Some(coll) = collections.get_mut(ns) else {
            return 0;
        };
        let mut removed = 0;
        for id in ids {
            if coll.remove(&id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Durability barrier: block until the write set is acknowledged by a
    /// majority of replicas. The in-memory store has no replica set, so the
    /// barrier is immediate.
    pub fn flush_majority(&self, _majority: u32) -> Result<()> {
        Ok(())
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Key, KeyValue};
    use parking_lot::Mutex;
    use serde_json::json;

    fn ns() -> Namespace {
        Namespace::new("db", "c")
    }

    fn range(min: i64, max: i64) -> ChunkRange {
        ChunkRange::new(
            Key::single(KeyValue::Int(min)),
            Key::single(KeyValue::Int(max)),
        )
        .unwrap()
    }

    #[test]
    fn test_upsert_get_delete() {
        let store = MemStore::new();
        let doc = json!({"_id": "a", "x": 1});
        let id = store.upsert(&ns(), doc.clone()).unwrap();
        assert_eq!(store.get(&ns(), &id), Some(doc));
        assert_eq!(store.count(&ns()), 1);

        assert!(store.delete(&ns(), &id).is_some());
        assert_eq!(store.count(&ns()), 0);
        assert!(store.delete(&ns(), &id).is_none());
    }

    #[test]
    fn test_upsert_replaces_by_identity() {
        let store = MemStore::new();
        store.upsert(&ns(), json!({"_id": "a", "v": 1})).unwrap();
        store.upsert(&ns(), json!({"_id": "a", "v": 2})).unwrap();
        assert_eq!(store.count(&ns()), 1);
        let id = DocId::from_value(&json!("a"));
        assert_eq!(store.get(&ns(), &id).unwrap()["v"], 2);
    }

    #[test]
    fn test_range_scan_and_purge() {
        let store = MemStore::new();
        let pattern = ShardKeyPattern::ascending("x");
        for i in 0..10 {
            store
                .upsert(&ns(), json!({"_id": i, "x": i * 10}))
                .unwrap();
        }

        let in_range = store.scan_range(&ns(), &pattern, &range(20, 60));
        assert_eq!(in_range.len(), 4); // x = 20, 30, 40, 50

        let removed = store.purge_range(&ns(), &pattern, &range(20, 60));
        assert_eq!(removed, 4);
        assert_eq!(store.count(&ns()), 6);
    }

    struct Recorder {
        upserts: Mutex<Vec<DocId>>,
        deletes: Mutex<Vec<DocId>>,
    }

    impl WriteObserver for Recorder {
        fn on_upsert(&self, _ns: &Namespace, doc: &serde_json::Value) {
            self.upserts.lock().push(DocId::of(doc).unwrap());
        }

        fn on_delete(&self, _ns: &Namespace, id: &DocId, _doc: &serde_json::Value) {
            self.deletes.lock().push(id.clone());
        }
    }

    #[test]
    fn test_observers_see_writes_but_not_purges() {
        let store = MemStore::new();
        let pattern = ShardKeyPattern::ascending("x");
        let recorder = Arc::new(Recorder {
            upserts: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
        });
        let oid = store.register_observer(recorder.clone());

        let id = store.upsert(&ns(), json!({"_id": 1, "x": 5})).unwrap();
        store.delete(&ns(), &id);
        store.upsert(&ns(), json!({"_id": 2, "x": 6})).unwrap();
        store.purge_range(&ns(), &pattern, &range(0, 100));

        assert_eq!(recorder.upserts.lock().len(), 2);
        assert_eq!(recorder.deletes.lock().len(), 1);

        store.unregister_observer(oid);
        store.upsert(&ns(), json!({"_id": 3, "x": 7})).unwrap();
        assert_eq!(recorder.upserts.lock().len(), 2);
    }

    #[test]
    fn test_ensure_doc_id_generates_when_missing() {
        let mut doc = json!({"x": 1});
        let id = ensure_doc_id(&mut doc).unwrap();
        assert!(doc.get("_id").is_some());
        assert_eq!(DocId::of(&doc).unwrap(), id);

        let mut doc_with_id = json!({"_id": 7, "x": 1});
        let id = ensure_doc_id(&mut doc_with_id).unwrap();
        assert_eq!(id, DocId::from_value(&json!(7)));
    }
}
