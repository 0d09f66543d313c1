// # Router
//
// The stateless front door: targets each client operation from the current
// routing snapshot, forwards the stamped sub-operations, merges replies,
// and recovers from stale-version rejections by refreshing the cache and
// retrying the whole operation within a fixed budget. A shard that reports
// an epoch flip forces a full invalidation instead of an incremental
// refresh.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::common::{Namespace, ShardId, MAX_STALE_CONFIG_RETRIES};
use crate::error::{Result, ShardError};
use crate::routing::cache::RoutingCache;
use crate::routing::targeter::ChunkTargeter;
use crate::shard::{ShardOp, VersionedRequest};

/// Transport from the router to a shard; the in-process cluster dispatches
/// directly, a networked deployment sends over a pooled connection.
#[async_trait]
pub trait ShardConnector: Send + Sync {
    async fn send(&self, shard: &ShardId, request: VersionedRequest) -> Result<Value>;
}

pub struct Router {
    cache: Arc<RoutingCache>,
    shards: Arc<dyn ShardConnector>,
}

impl Router {
    pub fn new(cache: Arc<RoutingCache>, shards: Arc<dyn ShardConnector>) -> Self {
        Self { cache, shards }
    }

    pub fn cache(&self) -> &Arc<RoutingCache> {
        &self.cache
    }

    /// Route one logical operation, retrying on stale-version feedback up
    /// to the retry budget. Client errors and permanent failures surface
    /// immediately.
    pub async fn execute(&self, ns: &Namespace, op: ShardOp) -> Result<Value> {
        let mut last_stale: Option<ShardError> = None;

        for attempt in 0..MAX_STALE_CONFIG_RETRIES {
            let info = self.cache.get_routing_info(ns).await?;
            let endpoints = ChunkTargeter::new(&info).target(&op)?;
            debug!(
                ns = %ns,
                attempt,
                targets = endpoints.len(),
                version = %info.version(),
                "routing operation"
            );

            let mut replies = Vec::with_capacity(endpoints.len());
            let mut stale = None;
            for endpoint in endpoints {
                let request = VersionedRequest {
                    ns: ns.clone(),
                    shard_version: endpoint.version,
                    op: op.clone(),
                };
                match self.shards.send(&endpoint.shard, request).await {
                    Ok(reply) => replies.push(reply),
                    Err(err) if err.is_epoch_mismatch() => {
                        warn!(ns = %ns, shard = %endpoint.shard, "shard reports epoch change, discarding cache entry");
                        self.cache.invalidate(ns);
                        stale = Some(err);
                        break;
                    }
                    Err(err) if err.is_stale_version() => {
                        debug!(ns = %ns, shard = %endpoint.shard, error = %err, "stale version, will refresh and retry");
                        self.cache.on_stale_config_error(&info);
                        stale = Some(err);
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }

            match stale {
                Some(err) => last_stale = Some(err),
                None => return Ok(merge_replies(&op, replies)),
            }
        }

        Err(last_stale.unwrap_or_else(|| {
            ShardError::Internal("stale-version retry budget exhausted".into())
        }))
    }

    // Convenience wrappers for the common operations.

    pub async fn insert(&self, ns: &Namespace, doc: Value) -> Result<Value> {
        self.execute(ns, ShardOp::Insert { doc }).await
    }

    pub async fn find(&self, ns: &Namespace, filter: Value) -> Result<Vec<Value>> {
        let reply = self.execute(ns, ShardOp::Query { filter }).await?;
        Ok(reply
            .get("docs")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default())
    }

    pub async fn update_one(&self, ns: &Namespace, filter: Value, update: Value) -> Result<Value> {
        self.execute(
            ns,
            ShardOp::Update {
                filter,
                update,
                multi: false,
                upsert: false,
            },
        )
        .await
    }

    pub async fn update_many(&self, ns: &Namespace, filter: Value, update: Value) -> Result<Value> {
        self.execute(
            ns,
            ShardOp::Update {
                filter,
                update,
                multi: true,
                upsert: false,
            },
        )
        .await
    }

    pub async fn delete_many(&self, ns: &Namespace, filter: Value) -> Result<Value> {
        self.execute(
            ns,
            ShardOp::Delete {
                filter,
                multi: true,
            },
        )
        .await
    }
}

/// Combine per-shard replies into one client reply: write counts add up,
/// query results concatenate.
fn merge_replies(op: &ShardOp, replies: Vec<Value>) -> Value {
    match op {
        ShardOp::Query { .. } => {
            let mut docs = Vec::new();
            for reply in &replies {
                if let Some(batch) = reply.get("docs").and_then(|d| d.as_array()) {
                    docs.extend(batch.iter().cloned());
                }
            }
            json!({ "docs": docs })
        }
        _ => {
            let n: u64 = replies
                .iter()
                .filter_map(|r| r.get("n").and_then(|n| n.as_u64()))
                .sum();
            let mut merged = json!({ "n": n });
            if replies
                .iter()
                .any(|r| r.get("upserted").and_then(|u| u.as_bool()).unwrap_or(false))
            {
                merged["upserted"] = json!(true);
            }
            merged
        }
    }
}
