// # Catalog Client
//
// The strongly-consistent surface every process uses to talk to the
// authoritative catalog. Chunk reads are served at majority-committed
// state; anything weaker risks routing on uncommitted config history.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::catalog::types::{
    ChunkOp, CollectionAndChunks, CollectionEntry, Precondition, ShardEntry,
};
use crate::chunk::ChunkVersion;
use crate::common::Namespace;
use crate::error::Result;

#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Collection metadata plus every chunk with version strictly greater
    /// than `since`. If the collection's epoch differs from `since`'s, the
    /// reply carries the full chunk list for the new epoch.
    async fn read_chunks_since(
        &self,
        ns: &Namespace,
        since: &ChunkVersion,
    ) -> Result<CollectionAndChunks>;

    /// Atomic multi-document chunk update with a precondition on the
    /// collection's current maximum version. `PreconditionFailed` means a
    /// concurrent commit got there first and nothing was applied.
    async fn apply_chunk_ops(&self, ops: Vec<ChunkOp>, precondition: Precondition) -> Result<()>;

    /// Append to the changelog. Failures are logged and swallowed; history
    /// never blocks the operational path.
    async fn log_change(&self, what: &str, ns: &str, details: serde_json::Value);

    /// Cluster-wide mutual exclusion on `resource`. The handle releases the
    /// lock best-effort when dropped; the TTL unblocks the cluster if the
    /// holder crashes first.
    async fn acquire_dist_lock(
        &self,
        resource: &str,
        who: &str,
        why: &str,
        ttl: Duration,
    ) -> Result<DistLock>;

    async fn get_collection(&self, ns: &Namespace) -> Result<CollectionEntry>;

    async fn get_shards(&self) -> Result<Vec<ShardEntry>>;

    async fn get_shard(&self, id: &crate::common::ShardId) -> Result<ShardEntry>;
}

/// Fire-and-forget changelog append from contexts that must not await the
/// write: spawns the append onto the runtime and drops the handle.
pub fn log_change_detached(
    catalog: Arc<dyn CatalogClient>,
    what: &str,
    ns: &str,
    details: serde_json::Value,
) {
    let what = what.to_string();
    let ns = ns.to_string();
    tokio::spawn(async move {
        catalog.log_change(&what, &ns, details).await;
    });
}

/// Synchronous release half of a distributed lock, so the RAII handle can
/// free the lock from `Drop`.
pub trait LockReleaser: Send + Sync {
    fn release(&self, resource: &str, ts: Uuid);
}

/// RAII handle for a held distributed lock. Dropping it releases the lock
/// best-effort on every exit path; if the process dies instead, the TTL
/// recorded in the catalog lets another holder steal it.
pub struct DistLock {
    resource: String,
    ts: Uuid,
    releaser: Option<Arc<dyn LockReleaser>>,
}

impl DistLock {
    pub fn new(resource: String, ts: Uuid, releaser: Arc<dyn LockReleaser>) -> Self {
        Self {
            resource,
            ts,
            releaser: Some(releaser),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn ts(&self) -> Uuid {
        self.ts
    }

    /// Release explicitly. Equivalent to dropping the handle, but lets the
    /// caller sequence the release before subsequent work.
    pub fn unlock(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(releaser) = self.releaser.take() {
            releaser.release(&self.resource, self.ts);
        }
    }
}

impl Drop for DistLock {
    fn drop(&mut self) {
        if self.releaser.is_some() {
            debug!(resource = %self.resource, "releasing distributed lock");
            self.release_inner();
        }
    }
}

impl fmt::Debug for DistLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistLock")
            .field("resource", &self.resource)
            .field("ts", &self.ts)
            .finish()
    }
}
