// # Routing Cache
//
// The router's lazily refreshed view of chunk ownership. Each collection
// entry is absent, populated, marked stale, or mid-refresh with a
// completion notifier every concurrent caller waits on, so the catalog sees
// at most one refresh per collection no matter how many operations hit a
// stale entry at once.
//
// The entry-table mutex is held only to locate entries and notifiers; all
// refresh I/O happens outside it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::CatalogClient;
use crate::chunk::ChunkVersion;
use crate::common::{Namespace, Notification, MAX_INCONSISTENT_REFRESH_ATTEMPTS};
use crate::error::{Result, ShardError};
use crate::routing::info::{refresh_routing_info, CollectionRoutingInfo};

type RefreshOutcome = std::result::Result<(), ShardError>;

#[derive(Default)]
struct CollEntry {
    needs_refresh: bool,
    refresh_notification: Option<Arc<Notification<RefreshOutcome>>>,
    routing_info: Option<Arc<CollectionRoutingInfo>>,
}

pub struct RoutingCache {
    catalog: Arc<dyn CatalogClient>,
    entries: Mutex<HashMap<Namespace, CollEntry>>,
}

impl RoutingCache {
    pub fn new(catalog: Arc<dyn CatalogClient>) -> Self {
        Self {
            catalog,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The current snapshot for a collection, refreshing first when the
    /// entry is absent or marked stale. Concurrent callers share one
    /// refresh and block on its notifier.
    pub async fn get_routing_info(&self, ns: &Namespace) -> Result<Arc<CollectionRoutingInfo>> {
        loop {
            let (notification, this_caller_refreshes) = {
                let mut entries = self.entries.lock();
                let entry = entries.entry(ns.clone()).or_default();

                if let Some(info) = &entry.routing_info {
                    if !entry.needs_refresh {
                        return Ok(Arc::clone(info));
                    }
                }

                match &entry.refresh_notification {
                    Some(existing) => (Arc::clone(existing), false),
                    None => {
                        let fresh = Arc::new(Notification::new());
                        entry.refresh_notification = Some(Arc::clone(&fresh));
                        (fresh, true)
                    }
                }
            };

            if this_caller_refreshes {
                self.run_refresh(ns, &notification).await;
            }

            // Wait outside the mutex, then loop to pick up the new entry.
            notification.wait().await?;
        }
    }

    /// Mark stale, then fetch; used after the operation layer saw a stale
    /// reply and wants the authoritative view before retrying.
    pub async fn get_with_forced_refresh(
        &self,
        ns: &Namespace,
    ) -> Result<Arc<CollectionRoutingInfo>> {
        self.invalidate(ns);
        self.get_routing_info(ns).await
    }

    /// A shard rejected a request sent from `snapshot`. Mark the entry
    /// stale only when the cache still holds that same version; a newer
    /// cached snapshot means someone already refreshed past it.
    pub fn on_stale_config_error(&self, snapshot: &Arc<CollectionRoutingInfo>) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(snapshot.ns()) else {
            return;
        };
        if entry.needs_refresh {
            return;
        }
        let Some(current) = &entry.routing_info else {
            return;
        };
        if current.epoch() == snapshot.epoch() && current.version() == snapshot.version() {
            debug!(ns = %snapshot.ns(), version = %snapshot.version(), "marking routing entry stale");
            entry.needs_refresh = true;
        }
    }

    /// Force the next lookup to refresh.
    pub fn invalidate(&self, ns: &Namespace) {
        let mut entries = self.entries.lock();
        entries.entry(ns.clone()).or_default().needs_refresh = true;
    }

    /// Drop every cached collection of a database.
    pub fn purge_database(&self, db: &str) {
        let mut entries = self.entries.lock();
        entries.retain(|ns, _| ns.db() != db);
    }

    /// Cached version without triggering a refresh; absent entries report
    /// `UNSHARDED`.
    pub fn cached_version(&self, ns: &Namespace) -> ChunkVersion {
        self.entries
            .lock()
            .get(ns)
            .and_then(|e| e.routing_info.as_ref())
            .map(|info| info.version())
            .unwrap_or(ChunkVersion::UNSHARDED)
    }

    /// Run one refresh cycle and publish the outcome through `notification`.
    /// Inconsistent chunk metadata is retried with a full reload up to the
    /// attempt bound; every other failure publishes immediately.
    async fn run_refresh(&self, ns: &Namespace, notification: &Arc<Notification<RefreshOutcome>>) {
        let started = Instant::now();
        let mut basis = {
            let entries = self.entries.lock();
            entries.get(ns).and_then(|e| e.routing_info.clone())
        };

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let since = basis
                .as_ref()
                .map(|info| info.version())
                .unwrap_or(ChunkVersion::UNSHARDED);
            debug!(ns = %ns, since = %since, attempt, "refreshing chunks");

            let loaded = self.catalog.read_chunks_since(ns, &since).await;
            match loaded {
                Ok(update) => match refresh_routing_info(ns, basis.clone(), update) {
                    Ok(new_info) => {
                        info!(
                            ns = %ns,
                            version = %new_info.version(),
                            chunks = new_info.num_chunks(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "refresh found collection version"
                        );
                        break Ok(new_info);
                    }
                    Err(err @ ShardError::ConflictingOperationInProgress(_))
                        if attempt < MAX_INCONSISTENT_REFRESH_ATTEMPTS =>
                    {
                        // The metadata may be mid-change (drop/recreate in
                        // flight); reload from scratch and try again.
                        warn!(ns = %ns, attempt, error = %err, "inconsistent chunk metadata, retrying refresh");
                        basis = None;
                        continue;
                    }
                    Err(err) => break Err(err),
                },
                Err(ShardError::NamespaceNotFound(_)) => {
                    break Err(ShardError::CollectionNotSharded(ns.to_string()))
                }
                Err(err) => break Err(err),
            }
        };

        let mut entries = self.entries.lock();
        let entry = entries.entry(ns.clone()).or_default();
        entry.refresh_notification = None;
        match outcome {
            Ok(new_info) => {
                entry.routing_info = Some(new_info);
                entry.needs_refresh = false;
                notification.set(Ok(()));
            }
            Err(err) => {
                warn!(
                    ns = %ns,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %err,
                    "refresh failed"
                );
                if matches!(err, ShardError::CollectionNotSharded(_)) {
                    // The collection is gone; drop the entry so the next
                    // lookup starts clean.
                    entries.remove(ns);
                }
                // A failed refresh leaves needs_refresh set so the next
                // lookup kicks off another round.
                notification.set(Err(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{split_chunk, ConfigCatalog, ShardEntry};
    use crate::chunk::{ChunkRange, Key, KeyValue, ShardKeyPattern};
    use crate::common::ShardId;

    async fn setup() -> (Arc<ConfigCatalog>, RoutingCache, Namespace, ShardKeyPattern) {
        let catalog = Arc::new(ConfigCatalog::new());
        catalog.add_shard(ShardEntry::new("s1", "host1:27018")).unwrap();
        catalog.add_shard(ShardEntry::new("s2", "host2:27018")).unwrap();
        let ns = Namespace::new("db", "c");
        let pattern = ShardKeyPattern::ascending("x");
        catalog
            .shard_collection(ns.clone(), pattern.clone(), false, &ShardId::from("s1"))
            .unwrap();
        let cache = RoutingCache::new(catalog.clone() as Arc<dyn CatalogClient>);
        (catalog, cache, ns, pattern)
    }

    #[tokio::test]
    async fn test_lazy_population_and_caching() {
        let (_catalog, cache, ns, _) = setup().await;
        assert_eq!(cache.cached_version(&ns), ChunkVersion::UNSHARDED);

        let info = cache.get_routing_info(&ns).await.unwrap();
        assert_eq!(info.num_chunks(), 1);

        // A second lookup returns the identical snapshot.
        let again = cache.get_routing_info(&ns).await.unwrap();
        assert!(Arc::ptr_eq(&info, &again));
    }

    #[tokio::test]
    async fn test_stale_marking_refreshes_next_lookup() {
        let (catalog, cache, ns, pattern) = setup().await;
        let info = cache.get_routing_info(&ns).await.unwrap();

        // A split advances the catalog behind the cache's back.
        let full = ChunkRange::new(pattern.global_min(), pattern.global_max()).unwrap();
        split_chunk(
            catalog.as_ref(),
            &ns,
            &full,
            &[Key::single(KeyValue::Int(0))],
            &ShardId::from("s1"),
        )
        .await
        .unwrap();

        // Without a stale signal the cache keeps serving the old snapshot.
        let same = cache.get_routing_info(&ns).await.unwrap();
        assert!(Arc::ptr_eq(&info, &same));

        cache.on_stale_config_error(&info);
        let refreshed = cache.get_routing_info(&ns).await.unwrap();
        assert_eq!(refreshed.num_chunks(), 2);
        assert!(refreshed.version().packed() > info.version().packed());
    }

    #[tokio::test]
    async fn test_stale_marking_ignores_outdated_snapshot() {
        let (catalog, cache, ns, pattern) = setup().await;
        let old = cache.get_routing_info(&ns).await.unwrap();

        let full = ChunkRange::new(pattern.global_min(), pattern.global_max()).unwrap();
        split_chunk(
            catalog.as_ref(),
            &ns,
            &full,
            &[Key::single(KeyValue::Int(0))],
            &ShardId::from("s1"),
        )
        .await
        .unwrap();
        let fresh = cache.get_with_forced_refresh(&ns).await.unwrap();

        // A stale report against the superseded snapshot must not
        // invalidate the fresh one.
        cache.on_stale_config_error(&old);
        let still_fresh = cache.get_routing_info(&ns).await.unwrap();
        assert!(Arc::ptr_eq(&fresh, &still_fresh));
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_refresh(){
        let (_catalog, cache, ns, _) = setup().await;
        let cache = Arc::new(cache);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let ns = ns.clone();
            handles.push(tokio::spawn(async move {
                cache.get_routing_info(&ns).await.map(|info| info.version())
            }));
        }
        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap().unwrap());
        }
        assert!(versions.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_dropped_collection_reports_not_sharded() {
        let (catalog, cache, ns, _) = setup().await;
        cache.get_routing_info(&ns).await.unwrap();

        catalog.drop_collection(&ns).unwrap();
        cache.invalidate(&ns);
        let err = cache.get_routing_info(&ns).await.unwrap_err();
        assert!(matches!(err, ShardError::CollectionNotSharded(_)));
    }

    #[tokio::test]
    async fn test_purge_database() {
        let (_catalog, cache, ns, _) = setup().await;
        cache.get_routing_info(&ns).await.unwrap();
        assert!(cache.cached_version(&ns).is_set());

        cache.purge_database("other");
        assert!(cache.cached_version(&ns).is_set());

        cache.purge_database("db");
        assert_eq!(cache.cached_version(&ns), ChunkVersion::UNSHARDED);
    }
}
