// Post-commit sweep of a moved range. The donor no longer owns the range,
// so the documents are already invisible to correctly routed operations;
// deletion waits politely for open cursors and forces the stragglers once
// the wait budget runs out.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::chunk::{ChunkRange, ShardKeyPattern};
use crate::common::Namespace;
use crate::shard::cursors::CursorRegistry;
use crate::shard::store::MemStore;

pub async fn cleanup_moved_range(
    store: Arc<MemStore>,
    cursors: Arc<CursorRegistry>,
    ns: Namespace,
    pattern: ShardKeyPattern,
    range: ChunkRange,
    drain_timeout: Duration,
) -> usize {
    if !cursors.wait_until_clear(&ns, drain_timeout).await {
        cursors.invalidate(&ns);
    }
    let removed = store.purge_range(&ns, &pattern, &range);
    info!(ns = %ns, range = %range, removed, "deleted moved range from donor");
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Key, KeyValue};
    use serde_json::json;

    #[tokio::test]
    async fn test_cleanup_waits_for_cursors() {
        let ns = Namespace::new("db", "c");
        let store = Arc::new(MemStore::new());
        let cursors = CursorRegistry::new();
        let pattern = ShardKeyPattern::ascending("x");
        let range = ChunkRange::new(
            Key::single(KeyValue::Int(0)),
            Key::single(KeyValue::Int(100)),
        )
        .unwrap();

        store.upsert(&ns, json!({"_id": 1, "x": 50})).unwrap();
        let guard = cursors.open(ns.clone());

        let sweep = {
            let store = Arc::clone(&store);
            let cursors = Arc::clone(&cursors);
            let ns = ns.clone();
            let pattern = pattern.clone();
            let range = range.clone();
            tokio::spawn(async move {
                cleanup_moved_range(store, cursors, ns, pattern, range, Duration::from_secs(5))
                    .await
            })
        };

        tokio::task::yield_now().await;
        assert_eq!(store.count(&ns), 1);

        drop(guard);
        assert_eq!(sweep.await.unwrap(), 1);
        assert_eq!(store.count(&ns), 0);
    }

    #[tokio::test]
    async fn test_cleanup_forces_cursors_after_timeout() {
        let ns = Namespace::new("db", "c");
        let store = Arc::new(MemStore::new());
        let cursors = CursorRegistry::new();
        let pattern = ShardKeyPattern::ascending("x");
        let range = ChunkRange::new(
            Key::single(KeyValue::Int(0)),
            Key::single(KeyValue::Int(100)),
        )
        .unwrap();

        store.upsert(&ns, json!({"_id": 1, "x": 50})).unwrap();
        let _stuck = cursors.open(ns.clone());

        let removed = cleanup_moved_range(
            store.clone(),
            cursors.clone(),
            ns.clone(),
            pattern,
            range,
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(removed, 1);
        assert_eq!(cursors.open_count(&ns), 0);
    }
}
