// # Catalog Chunk Operations
//
// Split, merge, and migration commits expressed as atomic `apply_chunk_ops`
// batches. Every commit rides the same precondition: the catalog's current
// maximum version for the collection must equal the version the caller read
// before composing the batch, so racing commits cannot interleave.

use serde_json::json;
use tracing::info;

use crate::catalog::client::CatalogClient;
use crate::catalog::types::{ChunkOp, Precondition};
use crate::chunk::{Chunk, ChunkRange, ChunkVersion, Key};
use crate::common::{Namespace, ShardId};
use crate::error::{Result, ShardError};

/// Read the full current chunk list for a collection.
async fn current_chunks(
    catalog: &dyn CatalogClient,
    ns: &Namespace,
) -> Result<(ChunkVersion, Vec<Chunk>)> {
    // Reading from the unsharded floor always misses the epoch and returns
    // the complete list.
    let all = catalog.read_chunks_since(ns, &ChunkVersion::UNSHARDED).await?;
    let version = all
        .changed_chunks
        .iter()
        .max_by_key(|c| c.version.packed())
        .map(|c| c.version)
        .unwrap_or(ChunkVersion::zero(all.collection.epoch));
    Ok((version, all.changed_chunks))
}

/// Split one owned chunk at the given interior points. Each fragment gets
/// the next minor version; the owning shard keeps every fragment. Returns
/// the new collection version.
pub async fn split_chunk(
    catalog: &dyn CatalogClient,
    ns: &Namespace,
    range: &ChunkRange,
    split_points: &[Key],
    shard: &ShardId,
) -> Result<ChunkVersion> {
    if split_points.is_empty() {
        return Err(ShardError::InvalidInput(
            "split requires at least one split point".into(),
        ));
    }

    let (collection_version, chunks) = current_chunks(catalog, ns).await?;
    let existing = chunks
        .iter()
        .find(|c| &c.range == range)
        .ok_or_else(|| {
            ShardError::ChunkNotFound(format!(
                "no chunk with bounds {} exists for {}",
                range, ns
            ))
        })?;
    if &existing.shard != shard {
        return Err(ShardError::InvalidState(format!(
            "chunk {} is owned by {}, not {}",
            range, existing.shard, shard
        )));
    }

    // Split keys must be strictly increasing and strictly interior.
    let mut previous = range.min();
    for point in split_points {
        if point <= previous || point >= range.max() {
            return Err(ShardError::InvalidInput(format!(
                "split key {} is not strictly inside {}",
                point, range
            )));
        }
        previous = point;
    }

    let mut ops = Vec::with_capacity(split_points.len() + 1);
    let mut version = collection_version;
    let mut fragment_min = range.min().clone();
    let mut bounds: Vec<Key> = split_points.to_vec();
    bounds.push(range.max().clone());
    for fragment_max in bounds {
        version = version.increment_minor();
        ops.push(ChunkOp::Upsert(Chunk::new(
            ns.clone(),
            ChunkRange::new(fragment_min.clone(), fragment_max.clone())?,
            shard.clone(),
            version,
        )));
        fragment_min = fragment_max;
    }

    catalog
        .apply_chunk_ops(
            ops,
            Precondition {
                ns: ns.clone(),
                expected_version: collection_version,
            },
        )
        .await?;

    info!(ns = %ns, range = %range, fragments = split_points.len() + 1, "committed chunk split");
    catalog
        .log_change(
            if split_points.len() == 1 { "split" } else { "multi-split" },
            &ns.to_string(),
            json!({
                "min": format!("{}", range.min()),
                "max": format!("{}", range.max()),
                "number": split_points.len() + 1,
                "shard": shard.as_str(),
            }),
        )
        .await;
    Ok(version)
}

/// Merge a contiguous run of chunks, all owned by one shard, into a single
/// chunk spanning `[min, max)`. The merged chunk takes the next major
/// version so every router observes the boundary change. Returns the new
/// collection version.
pub async fn merge_chunks(
    catalog: &dyn CatalogClient,
    ns: &Namespace,
    min: &Key,
    max: &Key,
    shard: &ShardId,
) -> Result<ChunkVersion> {
    let (collection_version, chunks) = current_chunks(catalog, ns).await?;

    let mut run: Vec<&Chunk> = chunks
        .iter()
        .filter(|c| c.range.min() >= min && c.range.max() <= max)
        .collect();
    run.sort_by(|a, b| a.range.min().cmp(b.range.min()));

    if run.len() < 2 {
        return Err(ShardError::InvalidInput(format!(
            "merge of [{}, {}) covers {} chunk(s); at least two required",
            min,
            max,
            run.len()
        )));
    }
    if run.first().expect("len checked").range.min() != min
        || run.last().expect("len checked").range.max() != max
    {
        return Err(ShardError::InvalidInput(format!(
            "merge bounds [{}, {}) do not align with chunk boundaries",
            min, max
        )));
    }
    for pair in run.windows(2) {
        if !pair[0].range.abuts(&pair[1].range) {
            return Err(ShardError::InvalidInput(format!(
                "chunks {} and {} are not contiguous",
                pair[0].range, pair[1].range
            )));
        }
    }
    if let Some(foreign) = run.iter().find(|c| &c.shard != shard) {
        return Err(ShardError::InvalidState(format!(
            "chunk {} is owned by {}; merges cannot span shards",
            foreign.range, foreign.shard
        )));
    }

    let merged_version = collection_version.increment_major();
    let mut ops: Vec<ChunkOp> = run
        .iter()
        .take(run.len() - 1)
        .map(|c| ChunkOp::Delete {
            ns: ns.clone(),
            max: c.range.max().clone(),
        })
        .collect();
    ops.push(ChunkOp::Upsert(Chunk::new(
        ns.clone(),
        ChunkRange::new(min.clone(), max.clone())?,
        shard.clone(),
        merged_version,
    )));

    catalog
        .apply_chunk_ops(
            ops,
            Precondition {
                ns: ns.clone(),
                expected_version: collection_version,
            },
        )
        .await?;

    info!(ns = %ns, merged = run.len(), "committed chunk merge");
    catalog
        .log_change(
            "merge",
            &ns.to_string(),
            json!({
                "min": format!("{}", min),
                "max": format!("{}", max),
                "merged": run.len(),
                "shard": shard.as_str(),
            }),
        )
        .await;
    Ok(merged_version)
}

/// The ops batch a migration commit applies: the moved chunk passes to the
/// recipient at `(major+1, 0)`, and, when the donor keeps other chunks of
/// the collection, one of them (the control chunk) is bumped to
/// `(major+1, 1)` so routers still see the donor's advance. Returns the new
/// collection version on success.
pub async fn commit_chunk_migration(
    catalog: &dyn CatalogClient,
    ns: &Namespace,
    moved: &Chunk,
    recipient: &ShardId,
    control_chunk: Option<&Chunk>,
    expected_version: ChunkVersion,
) -> Result<ChunkVersion> {
    let moved_version = expected_version.increment_major();
    let mut ops = vec![ChunkOp::Upsert(Chunk::new(
        ns.clone(),
        moved.range.clone(),
        recipient.clone(),
        moved_version,
    ))];

    let mut new_version = moved_version;
    if let Some(control) = control_chunk {
        let control_version = moved_version.increment_minor();
        ops.push(ChunkOp::Upsert(Chunk::new(
            ns.clone(),
            control.range.clone(),
            control.shard.clone(),
            control_version,
        )));
        new_version = control_version;
    }

    catalog
        .apply_chunk_ops(
            ops,
            Precondition {
                ns: ns.clone(),
                expected_version,
            },
        )
        .await?;
    Ok(new_version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::config_catalog::ConfigCatalog;
    use crate::catalog::types::ShardEntry;
    use crate::chunk::{KeyValue, ShardKeyPattern};

    fn key(i: i64) -> Key {
        Key::single(KeyValue::Int(i))
    }

    async fn setup() -> (ConfigCatalog, Namespace, ShardKeyPattern) {
        let catalog = ConfigCatalog::new();
        catalog.add_shard(ShardEntry::new("s1", "host1:27018")).unwrap();
        catalog.add_shard(ShardEntry::new("s2", "host2:27018")).unwrap();
        let ns = Namespace::new("db", "c");
        let pattern = ShardKeyPattern::ascending("x");
        catalog
            .shard_collection(ns.clone(), pattern.clone(), false, &ShardId::from("s1"))
            .unwrap();
        (catalog, ns, pattern)
    }

    #[tokio::test]
    async fn test_split_bumps_minor_versions() {
        let (catalog, ns, pattern) = setup().await;
        let full = ChunkRange::new(pattern.global_min(), pattern.global_max()).unwrap();

        let new_version = split_chunk(
            &catalog,
            &ns,
            &full,
            &[key(0), key(100)],
            &ShardId::from("s1"),
        )
        .await
        .unwrap();

        assert_eq!(new_version.major(), 1);
        assert_eq!(new_version.minor(), 3);

        let all = catalog
            .read_chunks_since(&ns, &ChunkVersion::UNSHARDED)
            .await
            .unwrap();
        assert_eq!(all.changed_chunks.len(), 3);

        let log = catalog.changelog();
        assert_eq!(log.last().unwrap().what, "multi-split");
    }

    #[tokio::test]
    async fn test_split_rejects_exterior_points() {
        let (catalog, ns, pattern) = setup().await;
        let full = ChunkRange::new(pattern.global_min(), pattern.global_max()).unwrap();

        let err = split_chunk(
            &catalog,
            &ns,
            &full,
            &[Key::single(KeyValue::MinKey)],
            &ShardId::from("s1"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ShardError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_merge_restores_single_chunk() {
        let (catalog, ns, pattern) = setup().await;
        let full = ChunkRange::new(pattern.global_min(), pattern.global_max()).unwrap();
        split_chunk(&catalog, &ns, &full, &[key(0)], &ShardId::from("s1"))
            .await
            .unwrap();

        let merged_version = merge_chunks(
            &catalog,
            &ns,
            &pattern.global_min(),
            &pattern.global_max(),
            &ShardId::from("s1"),
        )
        .await
        .unwrap();

        assert_eq!(merged_version.major(), 2);
        assert_eq!(merged_version.minor(), 0);
        let all = catalog
            .read_chunks_since(&ns, &ChunkVersion::UNSHARDED)
            .await
            .unwrap();
        assert_eq!(all.changed_chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_merge_rejects_cross_shard_run() {
        let (catalog, ns, pattern) = setup().await;
        let full = ChunkRange::new(pattern.global_min(), pattern.global_max()).unwrap();
        split_chunk(&catalog, &ns, &full, &[key(0)], &ShardId::from("s1"))
            .await
            .unwrap();

        // Hand the upper chunk to s2; the run is no longer mergeable.
        let v = catalog.collection_version(&ns);
        let upper = Chunk::new(
            ns.clone(),
            ChunkRange::new(key(0), pattern.global_max()).unwrap(),
            ShardId::from("s1"),
            v,
        );
        commit_chunk_migration(&catalog, &ns, &upper, &ShardId::from("s2"), None, v)
            .await
            .unwrap();

        let err = merge_chunks(
            &catalog,
            &ns,
            &pattern.global_min(),
            &pattern.global_max(),
            &ShardId::from("s1"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ShardError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_migration_commit_precondition_race() {
        let (catalog, ns, pattern) = setup().await;
        let full = ChunkRange::new(pattern.global_min(), pattern.global_max()).unwrap();
        split_chunk(&catalog, &ns, &full, &[key(0)], &ShardId::from("s1"))
            .await
            .unwrap();

        let v = catalog.collection_version(&ns);
        let all = catalog
            .read_chunks_since(&ns, &ChunkVersion::UNSHARDED)
            .await
            .unwrap();
        let lower = all.changed_chunks[0].clone();
        let upper = all.changed_chunks[1].clone();

        // First commit wins.
        commit_chunk_migration(
            &catalog,
            &ns,
            &lower,
            &ShardId::from("s2"),
            Some(&upper),
            v,
        )
        .await
        .unwrap();

        // Second commit raced on the same observed version and loses.
        let err = commit_chunk_migration(
            &catalog,
            &ns,
            &upper,
            &ShardId::from("s2"),
            Some(&lower),
            v,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ShardError::PreconditionFailed(_)));
    }
}
