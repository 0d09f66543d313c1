// # Shard Server
//
// The shard-side entry point of the sharding layer. Every routed operation
// arrives with a version envelope and is validated against local sharding
// state before touching storage; migration commands are dispatched to the
// active donor or recipient for the namespace.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::catalog::CatalogClient;
use crate::chunk::{ChunkRange, ChunkVersion};
use crate::common::{Namespace, ShardId, ShardingConfig};
use crate::error::{Result, ShardError};
use crate::migration::{
    MigrationCommand, MigrationDonor, MigrationLink, MigrationRecipient, MigrationReply,
    MoveChunkRequest, MoveChunkResult,
};
use crate::shard::cursors::{CursorGuard, CursorRegistry};
use crate::shard::query::{matches_filter, UpdateSpec};
use crate::shard::state::{CollectionShardState, ShardingState};
use crate::shard::store::{ensure_doc_id, DocId, MemStore};

/// A client operation as forwarded by a router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShardOp {
    Insert {
        doc: Value,
    },
    Update {
        filter: Value,
        update: Value,
        multi: bool,
        upsert: bool,
    },
    Delete {
        filter: Value,
        multi: bool,
    },
    Query {
        filter: Value,
    },
}

/// The version envelope every forwarded operation carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedRequest {
    pub ns: Namespace,
    pub shard_version: ChunkVersion,
    pub op: ShardOp,
}

pub struct ShardServer {
    id: ShardId,
    config: ShardingConfig,
    catalog: Arc<dyn CatalogClient>,
    store: Arc<MemStore>,
    state: Arc<ShardingState>,
    cursors: Arc<CursorRegistry>,
    link: RwLock<Option<Arc<dyn MigrationLink>>>,
    active_donor: Mutex<Option<Arc<MigrationDonor>>>,
    active_recipient: Mutex<Option<Arc<MigrationRecipient>>>,
    config_server: String,
}

impl ShardServer {
    pub fn new(
        id: impl Into<ShardId>,
        catalog: Arc<dyn CatalogClient>,
        config: ShardingConfig,
    ) -> Arc<Self> {
        let id = id.into();
        Arc::new(Self {
            state: Arc::new(ShardingState::new(id.clone())),
            id,
            config,
            catalog,
            store: Arc::new(MemStore::new()),
            cursors: CursorRegistry::new(),
            link: RwLock::new(None),
            active_donor: Mutex::new(None),
            active_recipient: Mutex::new(None),
            config_server: "config:27019".to_string(),
        })
    }

    pub fn id(&self) -> &ShardId {
        &self.id
    }

    pub fn store(&self) -> &Arc<MemStore> {
        &self.store
    }

    pub fn sharding_state(&self) -> &Arc<ShardingState> {
        &self.state
    }

    /// Wire the shard into a cluster: the link it uses to reach migration
    /// peers.
    pub fn set_link(&self, link: Arc<dyn MigrationLink>) {
        *self.link.write() = Some(link);
    }

    fn link(&self) -> Result<Arc<dyn MigrationLink>> {
        self.link
            .read()
            .clone()
            .ok_or_else(|| ShardError::InvalidState("shard has no cluster link".into()))
    }

    /// Register an open cursor on a collection; migrations wait for these
    /// before sweeping a moved range.
    pub fn open_cursor(&self, ns: Namespace) -> CursorGuard {
        self.cursors.open(ns)
    }

    /// Pull this shard's view of a collection from the catalog: epoch, key
    /// pattern, owned ranges, and the max version across owned chunks.
    pub async fn refresh_collection(&self, ns: &Namespace) -> Result<()> {
        let full = self
            .catalog
            .read_chunks_since(ns, &ChunkVersion::UNSHARDED)
            .await?;
        let owned: Vec<ChunkRange> = full
            .changed_chunks
            .iter()
            .filter(|c| c.shard == self.id)
            .map(|c| c.range.clone())
            .collect();
        let version = full
            .changed_chunks
            .iter()
            .filter(|c| c.shard == self.id)
            .max_by_key(|c| c.version.packed())
            .map(|c| c.version)
            .unwrap_or_else(|| ChunkVersion::zero(full.collection.epoch));
        self.state.install(
            ns.clone(),
            CollectionShardState {
                epoch: full.collection.epoch,
                pattern: full.collection.key,
                version,
                owned,
            },
        );
        Ok(())
    }

    /// Validate the request's version stamp, refreshing local state from
    /// the catalog when the request proves the shard itself is behind.
    async fn check_version(&self, ns: &Namespace, received: &ChunkVersion) -> Result<()> {
        match self.state.check_version(ns, received) {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(shard = %self.id, ns = %ns, "request is newer than local state, refreshing");
                self.refresh_collection(ns).await?;
                // One refresh settles it: local state now reflects the
                // catalog, the final authority.
                match self.state.check_version(ns, received) {
                    Ok(_) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Execute a routed operation after version validation.
    pub async fn execute(&self, req: VersionedRequest) -> Result<Value> {
        self.check_version(&req.ns, &req.shard_version).await?;
        match req.op {
            ShardOp::Insert { doc } => self.execute_insert(&req.ns, doc).await,
            ShardOp::Update {
                filter,
                update,
                multi,
                upsert,
            } => self.execute_update(&req.ns, filter, update, multi, upsert).await,
            ShardOp::Delete { filter, multi } => {
                self.execute_delete(&req.ns, filter, multi).await
            }
            ShardOp::Query { filter } => self.execute_query(&req.ns, filter),
        }
    }

    fn collection_state(&self, ns: &Namespace) -> Result<CollectionShardState> {
        self.state
            .get(ns)
            .ok_or_else(|| ShardError::CollectionNotSharded(ns.to_string()))
    }

    /// Reject writes for keys this shard does not own. The reply carries
    /// the local version so the router refreshes and retargets.
    fn require_ownership(&self, ns: &Namespace, key: &crate::chunk::Key) -> Result<()> {
        if self.state.owns_key(ns, key) {
            return Ok(());
        }
        warn!(shard = %self.id, ns = %ns, key = %key, "write targeted at unowned range");
        Err(ShardError::StaleShardVersion {
            received: self.state.version_of(ns),
            wanted: self.state.version_of(ns),
        })
    }

    async fn execute_insert(&self, ns: &Namespace, mut doc: Value) -> Result<Value> {
        let collection = self.collection_state(ns)?;
        ensure_doc_id(&mut doc)?;
        let key = collection.pattern.extract(&doc)?;

        // Writes to a range mid-commit block until the donor's critical
        // section lifts; the permit pins the write open until it is applied.
        let cs = self.state.critical_section(ns);
        let _permit = cs.write_permit(&key).await;
        self.require_ownership(ns, &key)?;
        self.store.upsert(ns, doc)?;
        Ok(json!({ "n": 1 }))
    }

    async fn execute_update(
        &self,
        ns: &Namespace,
        filter: Value,
        update: Value,
        multi: bool,
        upsert: bool,
    ) -> Result<Value> {
        let collection = self.collection_state(ns)?;
        let spec = UpdateSpec::parse(&update)?;

        let matched: Vec<Value> = self
            .store
            .scan(ns)
            .into_iter()
            .filter(|doc| matches_filter(doc, &filter))
            .collect();

        if matched.is_empty() {
            if !upsert {
                return Ok(json!({ "n": 0 }));
            }
            // Seed the new document from the filter's equality fields, then
            // apply the update on top.
            let seed = filter
                .as_object()
                .map(|obj| {
                    let fields: serde_json::Map<String, Value> = obj
                        .iter()
                        .filter(|(k, v)| !k.starts_with('$') && !v.is_object())
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    Value::Object(fields)
                })
                .unwrap_or_else(|| json!({}));
            let mut doc = spec.apply(&seed);
            ensure_doc_id(&mut doc)?;
            let key = collection.pattern.extract(&doc)?;
            let cs = self.state.critical_section(ns);
            let _permit = cs.write_permit(&key).await;
            self.require_ownership(ns, &key)?;
            self.store.upsert(ns, doc)?;
            return Ok(json!({ "n": 1, "upserted": true }));
        }

        let mut updated = 0u64;
        for doc in matched {
            let old_key = collection.pattern.extract(&doc)?;
            let new_doc = spec.apply(&doc);
            let new_key = collection.pattern.extract(&new_doc)?;
            if new_key != old_key {
                return Err(ShardError::ShardKeyImmutable(format!(
                    "update would move document {} across chunks",
                    DocId::of(&doc)?
                )));
            }
            let cs = self.state.critical_section(ns);
            let _permit = cs.write_permit(&old_key).await;
            self.require_ownership(ns, &old_key)?;
            self.store.upsert(ns, new_doc)?;
            updated += 1;
            if !multi {
                break;
            }
        }
        Ok(json!({ "n": updated }))
    }

    async fn execute_delete(&self, ns: &Namespace, filter: Value, multi: bool) -> Result<Value> {
        let collection = self.collection_state(ns)?;
        let matched: Vec<Value> = self
            .store
            .scan(ns)
            .into_iter()
            .filter(|doc| matches_filter(doc, &filter))
            .collect();

        let mut deleted = 0u64;
        for doc in matched {
            let key = collection.pattern.extract(&doc)?;
            let cs = self.state.critical_section(ns);
            let _permit = cs.write_permit(&key).await;
            self.require_ownership(ns, &key)?;
            self.store.delete(ns, &DocId::of(&doc)?);
            deleted += 1;
            if !multi {
                break;
            }
        }
        Ok(json!({ "n": deleted }))
    }

    /// Reads filter out orphans: only documents whose key falls in an owned
    /// range are visible, so documents left behind by a migration never
    /// surface.
    fn execute_query(&self, ns: &Namespace, filter: Value) -> Result<Value> {
        let collection = self.collection_state(ns)?;
        let _cursor = self.cursors.open(ns.clone());
        let docs: Vec<Value> = self
            .store
            .scan(ns)
            .into_iter()
            .filter(|doc| matches_filter(doc, &filter))
            .filter(|doc| {
                collection
                    .pattern
                    .extract(doc)
                    .map(|key| self.state.owns_key(ns, &key))
                    .unwrap_or(false)
            })
            .collect();
        Ok(json!({ "docs": docs }))
    }

    // ------------------------------------------------------------------
    // Migration
    // ------------------------------------------------------------------

    /// Donate a chunk to another shard. One active migration per shard; the
    /// collection-level exclusion is the catalog's distributed lock.
    pub async fn move_chunk(&self, req: MoveChunkRequest) -> Result<MoveChunkResult> {
        let link = self.link()?;
        let donor = {
            let mut active = self.active_donor.lock();
            if let Some(existing) = active.as_ref() {
                if !existing.state().is_terminal() {
                    return Err(ShardError::ConflictingOperationInProgress(format!(
                        "shard {} is already donating a chunk of {}",
                        self.id,
                        existing.ns()
                    )));
                }
            }
            let donor = Arc::new(MigrationDonor::new(
                self.id.clone(),
                self.config.clone(),
                Arc::clone(&self.catalog),
                Arc::clone(&self.store),
                Arc::clone(&self.state),
                Arc::clone(&self.cursors),
                self.config_server.clone(),
                req,
            ));
            *active = Some(Arc::clone(&donor));
            donor
        };
        donor.run(link).await
    }

    /// Dispatch a migration command from a peer shard.
    pub async fn handle_migration_command(&self, command: MigrationCommand) -> Result<MigrationReply> {
        match command {
            MigrationCommand::RecvChunkStart(start) => {
                let link = self.link()?;
                {
                    let active = self.active_recipient.lock();
                    if let Some(existing) = active.as_ref() {
                        if !existing.state().is_terminal() {
                            return Err(ShardError::ConflictingOperationInProgress(format!(
                                "shard {} is already receiving a chunk",
                                self.id
                            )));
                        }
                    }
                }
                // Make sure the local view of the collection exists before
                // the overlap pre-check.
                if self.state.get(&start.ns).is_none() {
                    if let Err(err) = self.refresh_collection(&start.ns).await {
                        warn!(ns = %start.ns, error = %err, "could not refresh before clone");
                    }
                }
                let recipient = MigrationRecipient::start(
                    start,
                    self.config.clone(),
                    Arc::clone(&self.store),
                    Arc::clone(&self.state),
                    link,
                )?;
                *self.active_recipient.lock() = Some(recipient);
                Ok(MigrationReply::Started)
            }
            MigrationCommand::RecvChunkStatus { session } => {
                let recipient = self.recipient_for(session)?;
                Ok(MigrationReply::Status(recipient.status()))
            }
            MigrationCommand::RecvChunkCommit { session } => {
                let recipient = self.recipient_for(session)?;
                recipient.commit().await?;
                Ok(MigrationReply::CommitOk)
            }
            MigrationCommand::RecvChunkAbort { session } => {
                if let Ok(recipient) = self.recipient_for(session) {
                    recipient.abort();
                }
                Ok(MigrationReply::Aborted)
            }
            MigrationCommand::MigrateClone { session } => {
                let donor = self.donor_for(session)?;
                Ok(MigrationReply::Clone(donor.next_clone_batch()))
            }
            MigrationCommand::TransferMods { session } => {
                let donor = self.donor_for(session)?;
                Ok(MigrationReply::Mods(donor.next_mods_batch()))
            }
        }
    }

    fn donor_for(&self, session: uuid::Uuid) -> Result<Arc<MigrationDonor>> {
        self.active_donor
            .lock()
            .as_ref()
            .filter(|d| d.session() == session)
            .cloned()
            .ok_or_else(|| {
                ShardError::InvalidState(format!(
                    "no active donor for migration session {session}"
                ))
            })
    }

    fn recipient_for(&self, session: uuid::Uuid) -> Result<Arc<MigrationRecipient>> {
        self.active_recipient
            .lock()
            .as_ref()
            .filter(|r| r.session() == session)
            .cloned()
            .ok_or_else(|| {
                ShardError::InvalidState(format!(
                    "no active recipient for migration session {session}"
                ))
            })
    }
}

/// In-process cluster wiring: shard id -> server, usable as the migration
/// link between peers and as the router's connector.
#[derive(Default)]
pub struct ShardSet {
    shards: RwLock<std::collections::HashMap<ShardId, Arc<ShardServer>>>,
}

impl ShardSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, server: Arc<ShardServer>) {
        self.shards.write().insert(server.id().clone(), server);
    }

    pub fn get(&self, id: &ShardId) -> Result<Arc<ShardServer>> {
        self.shards
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ShardError::ShardNotFound(id.to_string()))
    }
}

#[async_trait::async_trait]
impl MigrationLink for ShardSet {
    async fn call(&self, target: &ShardId, command: MigrationCommand) -> Result<MigrationReply> {
        self.get(target)?.handle_migration_command(command).await
    }
}

#[async_trait::async_trait]
impl crate::routing::router::ShardConnector for ShardSet {
    async fn send(&self, shard: &ShardId, request: VersionedRequest) -> Result<Value> {
        self.get(shard)?.execute(request).await
    }
}
