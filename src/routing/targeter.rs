// # Chunk Targeter
//
// Translates one logical operation into the set of (shard, version) pairs
// the router must contact, using a routing snapshot. Point operations pin a
// single chunk; predicate operations intersect the predicate's shard-key
// bounds with the chunk map, falling back to every shard owning a chunk
// when the predicate does not restrict the key.

use serde_json::Value;
use std::collections::BTreeSet;

use crate::chunk::{Key, KeyBounds, KeyDirection, KeyValue};
use crate::common::ShardId;
use crate::error::{Result, ShardError};
use crate::routing::info::CollectionRoutingInfo;
use crate::shard::query::UpdateSpec;
use crate::shard::ShardOp;

/// One target of an operation: the shard plus the version stamp its
/// sub-operation will carry (the shard's max version in this snapshot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardEndpoint {
    pub shard: ShardId,
    pub version: crate::chunk::ChunkVersion,
}

pub struct ChunkTargeter<'a> {
    info: &'a CollectionRoutingInfo,
}

impl<'a> ChunkTargeter<'a> {
    pub fn new(info: &'a CollectionRoutingInfo) -> Self {
        Self { info }
    }

    pub fn target(&self, op: &ShardOp) -> Result<Vec<ShardEndpoint>> {
        let shards = match op {
            ShardOp::Insert { doc } => {
                // Inserts must supply the full shard key.
                let key = self.info.pattern().extract(doc)?;
                let chunk = self.info.find_chunk(&key)?;
                BTreeSet::from([chunk.shard.clone()])
            }
            ShardOp::Query { filter } => self.shards_for_filter(filter),
            ShardOp::Update {
                filter,
                update,
                upsert,
                ..
            } => {
                self.reject_shard_key_mutation(filter, update, *upsert)?;
                if *upsert {
                    self.require_upsert_key(filter, update)?;
                }
                self.shards_for_filter(filter)
            }
            ShardOp::Delete { filter, .. } => self.shards_for_filter(filter),
        };

        Ok(shards
            .into_iter()
            .map(|shard| ShardEndpoint {
                version: self.info.shard_version(&shard),
                shard,
            })
            .collect())
    }

    /// Shards a filter may touch: a full-key equality pins one chunk; a
    /// recognizable range restricts the scan; anything else goes to every
    /// shard owning a chunk of the collection.
    fn shards_for_filter(&self, filter: &Value) -> BTreeSet<ShardId> {
        match self.bounds_for_filter(filter) {
            Some(bounds) => self.info.shards_for_query(&bounds),
            None => self.info.all_shards(),
        }
    }

    fn bounds_for_filter(&self, filter: &Value) -> Option<KeyBounds> {
        let pattern = self.info.pattern();
        if let Some(key) = pattern.extract_from_equality(filter) {
            return Some(KeyBounds::point(key));
        }
        // Range recognition handles the single-field ascending form; other
        // shapes fall back to broadcast, which is always safe.
        if pattern.num_fields() != 1 {
            return None;
        }
        let field = &pattern.fields()[0];
        if field.direction != KeyDirection::Ascending {
            return None;
        }
        let ops = filter.as_object()?.get(&field.path)?.as_object()?;
        if !ops.keys().all(|k| matches!(k.as_str(), "$gt" | "$gte" | "$lt" | "$lte")) {
            return None;
        }

        let lower = ops
            .get("$gte")
            .or_else(|| ops.get("$gt"))
            .map(|v| KeyValue::from_json(v).map(Key::single))
            .transpose()
            .ok()?
            .unwrap_or_else(|| pattern.global_min());
        let (upper, inclusive) = match (ops.get("$lt"), ops.get("$lte")) {
            (Some(v), _) => (Key::single(KeyValue::from_json(v).ok()?), false),
            (None, Some(v)) => (Key::single(KeyValue::from_json(v).ok()?), true),
            (None, None) => (pattern.global_max(), false),
        };
        if lower > upper {
            return None;
        }
        Some(KeyBounds {
            min: lower,
            max: upper,
            max_inclusive: inclusive,
        })
    }

    /// An update may not move a document to a different shard-key value.
    /// Upserts writing key fields the filter does not pin are admitted here
    /// and checked per-document at execution, where the pre-image is known.
    fn reject_shard_key_mutation(&self, filter: &Value, update: &Value, upsert: bool) -> Result<()> {
        let pattern = self.info.pattern();
        let spec = UpdateSpec::parse(update)?;
        let filter_key = pattern.extract_from_equality(filter);

        for field in pattern.fields() {
            let written = spec
                .written_fields()
                .into_iter()
                .find(|(path, _)| path == &field.path);
            let Some((_, new_value)) = written else {
                continue;
            };
            // Compare against the filter's pinned value when there is one;
            // writing the same value back is allowed.
            if let Some(filter_value) = filter
                .as_object()
                .and_then(|obj| obj.get(&field.path))
                .filter(|v| !v.is_object())
            {
                if filter_value != new_value {
                    return Err(ShardError::ShardKeyImmutable(format!(
                        "update changes shard key field '{}'",
                        field.path
                    )));
                }
            } else if filter_key.is_none() && !upsert {
                // No equality to compare against: a write to a key field
                // could rehome matched documents.
                return Err(ShardError::ShardKeyImmutable(format!(
                    "update writes shard key field '{}' without pinning it in the filter",
                    field.path
                )));
            }
        }
        Ok(())
    }

    /// Upserts must carry the full shard key in the filter or in the
    /// replacement document, or the new document could not be placed.
    fn require_upsert_key(&self, filter: &Value, update: &Value) -> Result<()> {
        let pattern = self.info.pattern();
        if pattern.extract_from_equality(filter).is_some() {
            return Ok(());
        }
        if let UpdateSpec::Replace(doc) = UpdateSpec::parse(update)? {
            if pattern.extract(&doc).is_ok() {
                return Ok(());
            }
        }
        Err(ShardError::ShardKeyNotFound(format!(
            "upsert must supply the full shard key {}",
            pattern
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CollectionAndChunks, CollectionEntry};
    use crate::chunk::{Chunk, ChunkRange, ChunkVersion, Epoch, ShardKeyPattern};
    use crate::common::Namespace;
    use crate::routing::info::refresh_routing_info;
    use serde_json::json;
    use std::sync::Arc;

    fn key(i: i64) -> Key {
        Key::single(KeyValue::Int(i))
    }

    /// Two chunks: [MinKey, 100) -> s1, [100, MaxKey) -> s2.
    fn snapshot() -> Arc<CollectionRoutingInfo> {
        let ns = Namespace::new("db", "c");
        let epoch = Epoch::new();
        let pattern = ShardKeyPattern::ascending("x");
        refresh_routing_info(
            &ns,
            None,
            CollectionAndChunks {
                collection: CollectionEntry {
                    ns: ns.clone(),
                    epoch,
                    key: pattern.clone(),
                    unique: false,
                    dropped: false,
                },
                changed_chunks: vec![
                    Chunk::new(
                        ns.clone(),
                        ChunkRange::new(pattern.global_min(), key(100)).unwrap(),
                        ShardId::from("s1"),
                        ChunkVersion::new(epoch, 1, 0),
                    ),
                    Chunk::new(
                        ns.clone(),
                        ChunkRange::new(key(100), pattern.global_max()).unwrap(),
                        ShardId::from("s2"),
                        ChunkVersion::new(epoch, 1, 1),
                    ),
                ],
            },
        )
        .unwrap()
    }

    #[test]
    fn test_insert_targets_owning_shard() {
        let info = snapshot();
        let targeter = ChunkTargeter::new(&info);

        let endpoints = targeter
            .target(&ShardOp::Insert {
                doc: json!({"x": 42, "payload": "a"}),
            })
            .unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].shard, ShardId::from("s1"));

        let endpoints = targeter
            .target(&ShardOp::Insert {
                doc: json!({"x": 100}),
            })
            .unwrap();
        assert_eq!(endpoints[0].shard, ShardId::from("s2"));
    }

    #[test]
    fn test_insert_without_key_fails() {
        let info = snapshot();
        let targeter = ChunkTargeter::new(&info);
        let err = targeter
            .target(&ShardOp::Insert {
                doc: json!({"payload": "a"}),
            })
            .unwrap_err();
        assert!(matches!(err, ShardError::ShardKeyNotFound(_)));
    }

    #[test]
    fn test_point_query_single_target() {
        let info = snapshot();
        let targeter = ChunkTargeter::new(&info);
        let endpoints = targeter
            .target(&ShardOp::Query {
                filter: json!({"x": 7}),
            })
            .unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].shard, ShardId::from("s1"));
    }

    #[test]
    fn test_range_query_targets_intersecting_shards() {
        let info = snapshot();
        let targeter = ChunkTargeter::new(&info);

        let endpoints = targeter
            .target(&ShardOp::Query {
                filter: json!({"x": {"$gte": 0, "$lt": 50}}),
            })
            .unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].shard, ShardId::from("s1"));

        let endpoints = targeter
            .target(&ShardOp::Query {
                filter: json!({"x": {"$gte": 50}}),
            })
            .unwrap();
        assert_eq!(endpoints.len(), 2);
    }

    #[test]
    fn test_unrestricted_query_broadcasts() {
        let info = snapshot();
        let targeter = ChunkTargeter::new(&info);
        let endpoints = targeter
            .target(&ShardOp::Query {
                filter: json!({"payload": "a"}),
            })
            .unwrap();
        assert_eq!(endpoints.len(), 2);
    }

    #[test]
    fn test_endpoint_carries_shard_version() {
        let info = snapshot();
        let targeter = ChunkTargeter::new(&info);
        let endpoints = targeter
            .target(&ShardOp::Query {
                filter: json!({"x": 500}),
            })
            .unwrap();
        assert_eq!(endpoints[0].version, info.shard_version(&ShardId::from("s2")));
    }

    #[test]
    fn test_update_shard_key_mutation_rejected() {
        let info = snapshot();
        let targeter = ChunkTargeter::new(&info);

        let err = targeter
            .target(&ShardOp::Update {
                filter: json!({"x": 7}),
                update: json!({"$set": {"x": 8}}),
                multi: false,
                upsert: false,
            })
            .unwrap_err();
        assert!(matches!(err, ShardError::ShardKeyImmutable(_)));

        // Writing the same value back is not a mutation.
        targeter
            .target(&ShardOp::Update {
                filter: json!({"x": 7}),
                update: json!({"$set": {"x": 7, "v": 2}}),
                multi: false,
                upsert: false,
            })
            .unwrap();
    }

    #[test]
    fn test_upsert_requires_full_key() {
        let info = snapshot();
        let targeter = ChunkTargeter::new(&info);

        let err = targeter
            .target(&ShardOp::Update {
                filter: json!({"payload": "a"}),
                update: json!({"$set": {"v": 1}}),
                multi: false,
                upsert: true,
            })
            .unwrap_err();
        assert!(matches!(err, ShardError::ShardKeyNotFound(_)));

        // Key in the filter: fine.
        targeter
            .target(&ShardOp::Update {
                filter: json!({"x": 7}),
                update: json!({"$set": {"v": 1}}),
                multi: false,
                upsert: true,
            })
            .unwrap();

        // Key in the replacement document: fine.
        targeter
            .target(&ShardOp::Update {
                filter: json!({"payload": "a"}),
                update: json!({"x": 9, "payload": "a"}),
                multi: false,
                upsert: true,
            })
            .unwrap();
    }

    #[test]
    fn test_multi_delete_fans_out_deduplicated() {
        let info = snapshot();
        let targeter = ChunkTargeter::new(&info);
        let endpoints = targeter
            .target(&ShardOp::Delete {
                filter: json!({"payload": "a"}),
                multi: true,
            })
            .unwrap();
        // Every shard exactly once.
        assert_eq!(endpoints.len(), 2);
        let shards: BTreeSet<_> = endpoints.iter().map(|e| e.shard.clone()).collect();
        assert_eq!(shards.len(), 2);
    }
}
