// End-to-end routing behavior on an in-process cluster: a config catalog,
// two shard servers, and a router in one process.

use std::sync::Arc;

use serde_json::json;

use rusty_shard::catalog::{commit_chunk_migration, split_chunk, CatalogClient, ConfigCatalog, ShardEntry};
use rusty_shard::chunk::{ChunkRange, ChunkVersion, Key, KeyValue, ShardKeyPattern};
use rusty_shard::common::{Namespace, ShardId, ShardingConfig};
use rusty_shard::routing::{Router, RoutingCache};
use rusty_shard::shard::{ShardServer, ShardSet};
use rusty_shard::ShardError;

struct TestCluster {
    catalog: Arc<ConfigCatalog>,
    shards: Arc<ShardSet>,
    router: Router,
    ns: Namespace,
    pattern: ShardKeyPattern,
}

impl TestCluster {
    fn shard(&self, id: &str) -> Arc<ShardServer> {
        self.shards.get(&ShardId::from(id)).unwrap()
    }
}

fn key(i: i64) -> Key {
    Key::single(KeyValue::Int(i))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// db.c sharded on {x: 1} with two chunks:
/// [MinKey, 100) -> s1 and [100, MaxKey) -> s2.
async fn two_shard_cluster() -> TestCluster {
    init_tracing();
    let catalog = Arc::new(ConfigCatalog::new());
    catalog.add_shard(ShardEntry::new("s1", "s1.test:27018")).unwrap();
    catalog.add_shard(ShardEntry::new("s2", "s2.test:27018")).unwrap();

    let shards = ShardSet::new();
    for id in ["s1", "s2"] {
        let server = ShardServer::new(
            id,
            catalog.clone() as Arc<dyn CatalogClient>,
            ShardingConfig::default(),
        );
        server.set_link(shards.clone());
        shards.add(server);
    }

    let ns = Namespace::new("db", "c");
    let pattern = ShardKeyPattern::ascending("x");
    catalog
        .shard_collection(ns.clone(), pattern.clone(), false, &ShardId::from("s1"))
        .unwrap();

    // Split at 100, then hand the upper chunk to s2 (no documents yet, so a
    // metadata-only transfer works).
    let full = ChunkRange::new(pattern.global_min(), pattern.global_max()).unwrap();
    split_chunk(catalog.as_ref(), &ns, &full, &[key(100)], &ShardId::from("s1"))
        .await
        .unwrap();
    let all = catalog
        .read_chunks_since(&ns, &ChunkVersion::UNSHARDED)
        .await
        .unwrap();
    let lower = all.changed_chunks[0].clone();
    let upper = all.changed_chunks[1].clone();
    let v = catalog.collection_version(&ns);
    commit_chunk_migration(
        catalog.as_ref(),
        &ns,
        &upper,
        &ShardId::from("s2"),
        Some(&lower),
        v,
    )
    .await
    .unwrap();

    for id in ["s1", "s2"] {
        shards
            .get(&ShardId::from(id))
            .unwrap()
            .refresh_collection(&ns)
            .await
            .unwrap();
    }

    let cache = Arc::new(RoutingCache::new(catalog.clone() as Arc<dyn CatalogClient>));
    let router = Router::new(cache, shards.clone());
    TestCluster {
        catalog,
        shards,
        router,
        ns,
        pattern,
    }
}

#[tokio::test]
async fn test_point_insert_routes_to_owning_shard() {
    let cluster = two_shard_cluster().await;

    let reply = cluster
        .router
        .insert(&cluster.ns, json!({"x": 42, "payload": "a"}))
        .await
        .unwrap();
    assert_eq!(reply["n"], 1);

    assert_eq!(cluster.shard("s1").store().count(&cluster.ns), 1);
    assert_eq!(cluster.shard("s2").store().count(&cluster.ns), 0);

    // And the mirror image for a key in the upper chunk.
    cluster
        .router
        .insert(&cluster.ns, json!({"x": 150, "payload": "b"}))
        .await
        .unwrap();
    assert_eq!(cluster.shard("s2").store().count(&cluster.ns), 1);
}

#[tokio::test]
async fn test_stale_version_triggers_refresh_and_retry() {
    let cluster = two_shard_cluster().await;

    // Populate the router's cache.
    cluster
        .router
        .insert(&cluster.ns, json!({"x": 1}))
        .await
        .unwrap();
    let stale_version = cluster.router.cache().cached_version(&cluster.ns);

    // An admin splits [MinKey, 100) at 50 behind the router's back; the
    // shard that served the split knows its new version, the router's cache
    // does not.
    let lower = ChunkRange::new(cluster.pattern.global_min(), key(100)).unwrap();
    split_chunk(
        cluster.catalog.as_ref(),
        &cluster.ns,
        &lower,
        &[key(50)],
        &ShardId::from("s1"),
    )
    .await
    .unwrap();
    cluster.shard("s1").refresh_collection(&cluster.ns).await.unwrap();

    // The stale-stamped insert is rejected by s1, refreshed, and retried
    // within the budget.
    let reply = cluster
        .router
        .insert(&cluster.ns, json!({"x": 10}))
        .await
        .unwrap();
    assert_eq!(reply["n"], 1);

    let refreshed = cluster.router.cache().cached_version(&cluster.ns);
    assert!(refreshed.packed() > stale_version.packed());

    // The document landed exactly once, on s1.
    let docs = cluster
        .router
        .find(&cluster.ns, json!({"x": 10}))
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(cluster.shard("s1").store().count(&cluster.ns), 2);
}

#[tokio::test]
async fn test_epoch_change_forces_full_rebuild() {
    let cluster = two_shard_cluster().await;
    cluster
        .router
        .insert(&cluster.ns, json!({"x": 1}))
        .await
        .unwrap();
    let old_epoch = cluster
        .router
        .cache()
        .cached_version(&cluster.ns)
        .epoch();

    // Drop and recreate: a new incarnation on s2 with a fresh epoch.
    cluster.catalog.drop_collection(&cluster.ns).unwrap();
    let new_epoch = cluster
        .catalog
        .shard_collection(
            cluster.ns.clone(),
            cluster.pattern.clone(),
            false,
            &ShardId::from("s2"),
        )
        .unwrap();
    assert_ne!(new_epoch, old_epoch);
    for id in ["s1", "s2"] {
        cluster.shard(id).refresh_collection(&cluster.ns).await.unwrap();
    }

    // The next operation hits IncompatibleEpoch, the router discards the
    // entry and rebuilds from scratch, and the insert lands on the new
    // incarnation's owner.
    cluster
        .router
        .insert(&cluster.ns, json!({"x": 10, "generation": 2}))
        .await
        .unwrap();

    assert_eq!(cluster.router.cache().cached_version(&cluster.ns).epoch(), new_epoch);
    let docs = cluster
        .router
        .find(&cluster.ns, json!({"generation": 2}))
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["x"], 10);
}

#[tokio::test]
async fn test_range_query_merges_across_shards() {
    let cluster = two_shard_cluster().await;
    for x in [10, 90, 110, 190] {
        cluster
            .router
            .insert(&cluster.ns, json!({"x": x}))
            .await
            .unwrap();
    }

    let docs = cluster
        .router
        .find(&cluster.ns, json!({"x": {"$gte": 50, "$lt": 150}}))
        .await
        .unwrap();
    let mut xs: Vec<i64> = docs.iter().map(|d| d["x"].as_i64().unwrap()).collect();
    xs.sort_unstable();
    assert_eq!(xs, vec![90, 110]);
}

#[tokio::test]
async fn test_multi_update_fans_out_and_sums_counts() {
    let cluster = two_shard_cluster().await;
    for x in [10, 110, 210] {
        cluster
            .router
            .insert(&cluster.ns, json!({"x": x, "flag": "old"}))
            .await
            .unwrap();
    }

    let reply = cluster
        .router
        .update_many(
            &cluster.ns,
            json!({"flag": "old"}),
            json!({"$set": {"flag": "new"}}),
        )
        .await
        .unwrap();
    assert_eq!(reply["n"], 3);

    let docs = cluster
        .router
        .find(&cluster.ns, json!({"flag": "new"}))
        .await
        .unwrap();
    assert_eq!(docs.len(), 3);
}

#[tokio::test]
async fn test_shard_key_change_is_rejected() {
    let cluster = two_shard_cluster().await;
    cluster
        .router
        .insert(&cluster.ns, json!({"x": 7, "v": 1}))
        .await
        .unwrap();

    let err = cluster
        .router
        .update_one(&cluster.ns, json!({"x": 7}), json!({"$set": {"x": 8}}))
        .await
        .unwrap_err();
    assert!(matches!(err, ShardError::ShardKeyImmutable(_)));

    // The document is untouched.
    let docs = cluster
        .router
        .find(&cluster.ns, json!({"x": 7}))
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["v"], 1);
}

#[tokio::test]
async fn test_insert_without_shard_key_is_client_error() {
    let cluster = two_shard_cluster().await;
    let err = cluster
        .router
        .insert(&cluster.ns, json!({"payload": "a"}))
        .await
        .unwrap_err();
    assert!(matches!(err, ShardError::ShardKeyNotFound(_)));
}

#[tokio::test]
async fn test_unsharded_namespace_surfaces_as_not_sharded() {
    let cluster = two_shard_cluster().await;
    let missing = Namespace::new("db", "nope");
    let err = cluster
        .router
        .insert(&missing, json!({"x": 1}))
        .await
        .unwrap_err();
    assert!(matches!(err, ShardError::CollectionNotSharded(_)));
}

#[tokio::test]
async fn test_delete_many_across_shards() {
    let cluster = two_shard_cluster().await;
    for x in [10, 110] {
        cluster
            .router
            .insert(&cluster.ns, json!({"x": x, "tag": "gone"}))
            .await
            .unwrap();
    }
    cluster
        .router
        .insert(&cluster.ns, json!({"x": 20, "tag": "kept"}))
        .await
        .unwrap();

    let reply = cluster
        .router
        .delete_many(&cluster.ns, json!({"tag": "gone"}))
        .await
        .unwrap();
    assert_eq!(reply["n"], 2);
    assert_eq!(
        cluster.shard("s1").store().count(&cluster.ns)
            + cluster.shard("s2").store().count(&cluster.ns),
        1
    );
}
