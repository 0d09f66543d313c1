// # Migration Donor
//
// Source side of a chunk migration, expressed as an explicit state machine
// with one transition function. The move is gated by the collection's
// distributed lock; every exit path releases the lock, clears the critical
// section, and detaches the write-path tracker.
//
// The only ambiguous failure is losing the acknowledgement of the catalog
// commit. The donor never blindly re-applies: it polls the catalog and
// decides the outcome from whether the new version became visible.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{commit_chunk_migration, CatalogClient};
use crate::chunk::{Chunk, ChunkRange, ChunkVersion, ShardKeyPattern};
use crate::common::{Namespace, ShardId, ShardingConfig, MIGRATION_CLONE_BATCH_DOCS,
    MIGRATION_XFER_BATCH_BYTES};
use crate::error::{Result, ShardError};
use crate::migration::cleanup::cleanup_moved_range;
use crate::migration::commands::{
    CloneBatch, MigrationCommand, MigrationLink, MigrationReply, RecipientState, RecvChunkStart,
    TransferModsBatch,
};
use crate::migration::tracker::{ModTracker, TrackerRegistration};
use crate::shard::cursors::CursorRegistry;
use crate::shard::state::{CollectionShardState, CriticalSection, ShardingState};
use crate::shard::store::{DocId, MemStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DonorState {
    Idle,
    Preparing,
    Cloning,
    Catchup,
    Steady,
    CommitStart,
    Done,
    Aborted,
    Failed,
}

impl DonorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DonorState::Done | DonorState::Aborted | DonorState::Failed
        )
    }

    fn may_become(&self, next: DonorState) -> bool {
        use DonorState::*;
        match (self, next) {
            (Idle, Preparing)
            | (Preparing, Cloning)
            | (Cloning, Catchup)
            | (Cloning, Steady)
            | (Catchup, Steady)
            | (Steady, CommitStart)
            | (CommitStart, Done) => true,
            // Abort and failure are reachable from anywhere before Done.
            (from, Aborted) | (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for DonorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone)]
pub struct MoveChunkRequest {
    pub ns: Namespace,
    pub range: ChunkRange,
    pub to: ShardId,
}

#[derive(Debug, Clone)]
pub struct MoveChunkResult {
    pub new_version: ChunkVersion,
    pub docs_cloned: u64,
    pub step_times: Vec<(&'static str, Duration)>,
}

/// Per-step elapsed tracking attached to the changelog detail document.
struct StepTimer {
    last: Instant,
    steps: Vec<(&'static str, Duration)>,
}

impl StepTimer {
    fn new() -> Self {
        Self {
            last: Instant::now(),
            steps: Vec::new(),
        }
    }

    fn note(&mut self, step: &'static str) {
        let now = Instant::now();
        self.steps.push((step, now - self.last));
        self.last = now;
    }

    fn to_json(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        for (i, (step, elapsed)) in self.steps.iter().enumerate() {
            out.insert(
                format!("step {} ({})", i + 1, step),
                json!(elapsed.as_millis() as u64),
            );
        }
        serde_json::Value::Object(out)
    }
}

/// Everything `Preparing` learns that later phases need.
struct PrepareContext {
    pattern: ShardKeyPattern,
    collection_version: ChunkVersion,
    moved: Chunk,
    control: Option<Chunk>,
}

pub struct MigrationDonor {
    shard_id: ShardId,
    config: ShardingConfig,
    catalog: Arc<dyn CatalogClient>,
    store: Arc<MemStore>,
    sharding_state: Arc<ShardingState>,
    cursors: Arc<CursorRegistry>,
    config_server: String,

    req: MoveChunkRequest,
    session: Uuid,
    state: Mutex<DonorState>,
    tracker: Mutex<Option<Arc<ModTracker>>>,
    clone_ids: Mutex<VecDeque<DocId>>,
    /// The pre-migration collection state, reinstalled verbatim on abort.
    prior: Mutex<Option<CollectionShardState>>,
    recipient_started: AtomicBool,
    relinquished: AtomicBool,
}

impl MigrationDonor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard_id: ShardId,
        config: ShardingConfig,
        catalog: Arc<dyn CatalogClient>,
        store: Arc<MemStore>,
        sharding_state: Arc<ShardingState>,
        cursors: Arc<CursorRegistry>,
        config_server: String,
        req: MoveChunkRequest,
    ) -> Self {
        Self {
            shard_id,
            config,
            catalog,
            store,
            sharding_state,
            cursors,
            config_server,
            req,
            session: Uuid::new_v4(),
            state: Mutex::new(DonorState::Idle),
            tracker: Mutex::new(None),
            clone_ids: Mutex::new(VecDeque::new()),
            prior: Mutex::new(None),
            recipient_started: AtomicBool::new(false),
            relinquished: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn state(&self) -> DonorState {
        *self.state.lock()
    }

    pub fn ns(&self) -> &Namespace {
        &self.req.ns
    }

    /// Whether writes to `range` are currently blocked by this migration.
    pub fn in_critical_section(&self) -> bool {
        self.critical_section().is_active()
    }

    fn critical_section(&self) -> Arc<CriticalSection> {
        self.sharding_state.critical_section(&self.req.ns)
    }

    fn transition(&self, next: DonorState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.may_become(next) {
            return Err(ShardError::InvalidState(format!(
                "illegal migration transition {} -> {}",
                *state, next
            )));
        }
        debug!(ns = %self.req.ns, session = %self.session, from = %*state, to = %next, "donor state");
        *state = next;
        Ok(())
    }

    /// Advance to `next` only when the edge is legal, ignoring repeats; used
    /// while mirroring the recipient's progress.
    fn transition_if_possible(&self, next: DonorState) {
        let mut state = self.state.lock();
        if state.may_become(next) {
            debug!(ns = %self.req.ns, session = %self.session, from = %*state, to = %next, "donor state");
            *state = next;
        }
    }

    // ------------------------------------------------------------------
    // Serving the recipient's pulls
    // ------------------------------------------------------------------

    /// `_migrateClone`: the next batch of snapshot documents. Contents are
    /// read at serve time; a document deleted since the snapshot is simply
    /// skipped (its deletion travels in the mod stream).
    pub fn next_clone_batch(&self) -> CloneBatch {
        let mut ids = self.clone_ids.lock();
        let mut docs = Vec::new();
        while docs.len() < MIGRATION_CLONE_BATCH_DOCS {
            let Some(id) = ids.pop_front() else {
                break;
            };
            if let Some(doc) = self.store.get(&self.req.ns, &id) {
                docs.push(doc);
            }
        }
        CloneBatch { docs }
    }

    /// `_transferMods`: drain pending deltas, deletes first, documents
    /// looked up at reply time so the latest write wins.
    pub fn next_mods_batch(&self) -> TransferModsBatch {
        match self.tracker.lock().as_ref() {
            Some(tracker) => tracker.drain_batch(&self.store, MIGRATION_XFER_BATCH_BYTES),
            None => TransferModsBatch::empty(),
        }
    }

    // ------------------------------------------------------------------
    // Driving the migration
    // ------------------------------------------------------------------

    pub async fn run(&self, link: Arc<dyn MigrationLink>) -> Result<MoveChunkResult> {
        let mut timer = StepTimer::new();

        self.transition(DonorState::Preparing)?;
        let _lock = match self
            .catalog
            .acquire_dist_lock(
                &self.req.ns.to_string(),
                &format!("{}:{}", self.shard_id, self.session),
                "migrating chunk",
                self.config.dist_lock_ttl,
            )
            .await
        {
            Ok(lock) => lock,
            Err(err) => {
                // Nothing started yet, but the donor must still land in a
                // terminal state so the shard can attempt another move.
                self.clean_up_after_failure(&link, &err).await;
                return Err(err);
            }
        };

        match self.drive(&link, &mut timer).await {
            Ok(result) => {
                info!(
                    ns = %self.req.ns,
                    range = %self.req.range,
                    to = %self.req.to,
                    version = %result.new_version,
                    "chunk migration committed"
                );
                Ok(result)
            }
            Err(err) => {
                self.clean_up_after_failure(&link, &err).await;
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        link: &Arc<dyn MigrationLink>,
        timer: &mut StepTimer,
    ) -> Result<MoveChunkResult> {
        let ctx = self.prepare().await?;
        timer.note("prepare");

        // Cloning: register the tracker before capturing the snapshot so no
        // write can slip between the two.
        self.transition(DonorState::Cloning)?;
        let tracker = Arc::new(ModTracker::new(
            self.req.ns.clone(),
            ctx.pattern.clone(),
            self.req.range.clone(),
            self.config.migration_memory_limit_bytes,
        ));
        let _registration = TrackerRegistration::new(self.store.clone(), tracker.clone());
        *self.tracker.lock() = Some(Arc::clone(&tracker));

        let snapshot = self
            .store
            .ids_in_range(&self.req.ns, &ctx.pattern, &self.req.range);
        let docs_cloned = snapshot.len() as u64;
        *self.clone_ids.lock() = snapshot.into();

        let start = RecvChunkStart {
            ns: self.req.ns.clone(),
            from: self.shard_id.clone(),
            to: self.req.to.clone(),
            range: self.req.range.clone(),
            epoch: ctx.collection_version.epoch(),
            collection_version: ctx.collection_version,
            session: self.session,
            config_server: self.config_server.clone(),
        };
        match link
            .call(&self.req.to, MigrationCommand::RecvChunkStart(start))
            .await?
        {
            MigrationReply::Started => {}
            other => {
                return Err(ShardError::Internal(format!(
                    "unexpected reply to _recvChunkStart: {other:?}"
                )))
            }
        }
        self.recipient_started.store(true, Ordering::SeqCst);
        timer.note("start recipient");

        // Wait for the recipient to clone and catch up.
        self.await_recipient_steady(link, &tracker).await?;
        timer.note("catchup");

        // Steady: stop the world for the moving range, surrender it
        // locally, and ask the recipient to finish.
        self.transition(DonorState::Steady)?;
        let critical = self.critical_section();
        critical.enter(self.req.range.clone()).await;
        let guard = CriticalSectionGuard {
            cs: Arc::clone(&critical),
        };

        let donor_version = match &ctx.control {
            Some(_) => ctx.collection_version.increment_major().increment_minor(),
            None => ChunkVersion::zero(ctx.collection_version.epoch()),
        };
        self.sharding_state
            .relinquish_range(&self.req.ns, &self.req.range, donor_version);
        self.relinquished.store(true, Ordering::SeqCst);
        timer.note("enter critical section");

        self.transition(DonorState::CommitStart)?;
        match link
            .call(
                &self.req.to,
                MigrationCommand::RecvChunkCommit {
                    session: self.session,
                },
            )
            .await
        {
            Ok(MigrationReply::CommitOk) => {}
            Ok(other) => {
                return Err(ShardError::Internal(format!(
                    "unexpected reply to _recvChunkCommit: {other:?}"
                )))
            }
            Err(err) => {
                return Err(ShardError::MigrationAborted(format!(
                    "recipient failed to commit: {err}"
                )))
            }
        }
        timer.note("recipient commit");

        let new_version = match commit_chunk_migration(
            self.catalog.as_ref(),
            &self.req.ns,
            &ctx.moved,
            &self.req.to,
            ctx.control.as_ref(),
            ctx.collection_version,
        )
        .await
        {
            Ok(version) => version,
            Err(err) if err.is_retryable_read() => {
                // The apply may or may not have landed; never retry it
                // blindly. Poll until the catalog shows the outcome.
                warn!(
                    ns = %self.req.ns,
                    error = %err,
                    "catalog commit acknowledgement lost, polling for outcome"
                );
                self.resolve_commit_outcome(&ctx).await?
            }
            Err(err) => return Err(err),
        };
        timer.note("catalog commit");

        // Done: reopen writes, then hand the moved range to the deleter.
        drop(guard);
        self.transition(DonorState::Done)?;
        *self.tracker.lock() = None;

        self.catalog
            .log_change(
                "moveChunk.commit",
                &self.req.ns.to_string(),
                json!({
                    "min": format!("{}", self.req.range.min()),
                    "max": format!("{}", self.req.range.max()),
                    "from": self.shard_id.as_str(),
                    "to": self.req.to.as_str(),
                    "cloned": docs_cloned,
                    "steps": timer.to_json(),
                }),
            )
            .await;

        let store = Arc::clone(&self.store);
        let cursors = Arc::clone(&self.cursors);
        let ns = self.req.ns.clone();
        let pattern = ctx.pattern.clone();
        let range = self.req.range.clone();
        let drain_timeout = self.config.cursor_drain_timeout;
        tokio::spawn(async move {
            cleanup_moved_range(store, cursors, ns, pattern, range, drain_timeout).await;
        });

        Ok(MoveChunkResult {
            new_version,
            docs_cloned,
            step_times: timer.steps.clone(),
        })
    }

    /// Validate the move against the catalog and snapshot what later phases
    /// need: the chunk exactly as the catalog knows it, the collection
    /// version the commit precondition will assert, and a control chunk
    /// when this shard keeps other chunks of the collection.
    async fn prepare(&self) -> Result<PrepareContext> {
        if self.req.to == self.shard_id {
            return Err(ShardError::InvalidInput(
                "cannot migrate a chunk to its current owner".into(),
            ));
        }
        let recipient = self.catalog.get_shard(&self.req.to).await?;
        if recipient.draining {
            return Err(ShardError::InvalidState(format!(
                "shard {} is draining and cannot receive chunks",
                recipient.id
            )));
        }

        let full = self
            .catalog
            .read_chunks_since(&self.req.ns, &ChunkVersion::UNSHARDED)
            .await?;
        let moved = full
            .changed_chunks
            .iter()
            .find(|c| c.range == self.req.range)
            .cloned()
            .ok_or_else(|| {
                ShardError::ChunkNotFound(format!(
                    "move bounds {} do not match any chunk of {}",
                    self.req.range, self.req.ns
                ))
            })?;
        if moved.shard != self.shard_id {
            return Err(ShardError::InvalidState(format!(
                "chunk {} belongs to {}, not to {}",
                moved.range, moved.shard, self.shard_id
            )));
        }

        let collection_version = full
            .changed_chunks
            .iter()
            .max_by_key(|c| c.version.packed())
            .map(|c| c.version)
            .expect("collection has at least the moved chunk");
        let control = full
            .changed_chunks
            .iter()
            .filter(|c| c.shard == self.shard_id && c.range != self.req.range)
            .max_by_key(|c| c.version.packed())
            .cloned();

        // Refresh the local view so the version checks and ownership tests
        // reflect what was just read. The advertised version is the max
        // across this shard's own chunks, not the collection max.
        let owned: Vec<ChunkRange> = full
            .changed_chunks
            .iter()
            .filter(|c| c.shard == self.shard_id)
            .map(|c| c.range.clone())
            .collect();
        let own_version = full
            .changed_chunks
            .iter()
            .filter(|c| c.shard == self.shard_id)
            .max_by_key(|c| c.version.packed())
            .map(|c| c.version)
            .expect("the moved chunk is owned by this shard");
        let prior_state = CollectionShardState {
            epoch: full.collection.epoch,
            pattern: full.collection.key.clone(),
            version: own_version,
            owned,
        };
        self.sharding_state
            .install(self.req.ns.clone(), prior_state.clone());
        *self.prior.lock() = Some(prior_state.clone());

        self.catalog
            .log_change(
                "moveChunk.start",
                &self.req.ns.to_string(),
                json!({
                    "min": format!("{}", self.req.range.min()),
                    "max": format!("{}", self.req.range.max()),
                    "from": self.shard_id.as_str(),
                    "to": self.req.to.as_str(),
                }),
            )
            .await;

        Ok(PrepareContext {
            pattern: full.collection.key,
            collection_version,
            moved,
            control,
        })
    }

    /// Poll recipient status until it reports steady, mirroring its
    /// progress in our own state. Aborts on recipient failure, on the
    /// pending-mod memory cap, and on the catch-up timeout.
    async fn await_recipient_steady(
        &self,
        link: &Arc<dyn MigrationLink>,
        tracker: &Arc<ModTracker>,
    ) -> Result<()> {
        let deadline = Instant::now() + self.config.migration_catchup_timeout;
        loop {
            if tracker.exceeded_memory_limit() {
                return Err(ShardError::ExceededMemoryLimit(format!(
                    "pending migration mods exceed {} bytes",
                    self.config.migration_memory_limit_bytes
                )));
            }

            let reply = link
                .call(
                    &self.req.to,
                    MigrationCommand::RecvChunkStatus {
                        session: self.session,
                    },
                )
                .await?;
            let status = match reply {
                MigrationReply::Status(status) => status,
                other => {
                    return Err(ShardError::Internal(format!(
                        "unexpected reply to _recvChunkStatus: {other:?}"
                    )))
                }
            };
            if status.session != self.session {
                return Err(ShardError::InvalidState(
                    "recipient is running a different migration".into(),
                ));
            }

            match status.state {
                RecipientState::Ready | RecipientState::Clone => {}
                RecipientState::Catchup => {
                    self.transition_if_possible(DonorState::Catchup);
                }
                RecipientState::Steady => {
                    self.transition_if_possible(DonorState::Catchup);
                    return Ok(());
                }
                RecipientState::Fail | RecipientState::Abort => {
                    return Err(ShardError::MigrationAborted(
                        status
                            .error
                            .unwrap_or_else(|| "recipient aborted".to_string()),
                    ));
                }
                RecipientState::CommitStart | RecipientState::Done => {
                    return Err(ShardError::InvalidState(format!(
                        "recipient reached {:?} before commit was requested",
                        status.state
                    )));
                }
            }

            if Instant::now() > deadline {
                return Err(ShardError::Timeout(
                    "recipient did not reach steady state in time".into(),
                ));
            }
            sleep(self.config.migration_status_poll_interval).await;
        }
    }

    /// Decide a commit whose acknowledgement was lost. The new version is
    /// visible iff the apply landed; an unchanged catalog means it did not.
    async fn resolve_commit_outcome(&self, ctx: &PrepareContext) -> Result<ChunkVersion> {
        for attempt in 0..self.config.commit_poll_attempts {
            sleep(self.config.commit_poll_interval).await;
            match self
                .catalog
                .read_chunks_since(&self.req.ns, &ctx.collection_version)
                .await
            {
                Ok(delta) => {
                    if let Some(chunk) = delta
                        .changed_chunks
                        .iter()
                        .find(|c| c.range == self.req.range)
                    {
                        if chunk.shard == self.req.to {
                            info!(
                                ns = %self.req.ns,
                                version = %chunk.version,
                                "lost commit acknowledgement resolved: applied"
                            );
                            let new_version = delta
                                .changed_chunks
                                .iter()
                                .max_by_key(|c| c.version.packed())
                                .map(|c| c.version)
                                .unwrap_or(chunk.version);
                            return Ok(new_version);
                        }
                    }
                    if delta.changed_chunks.is_empty() {
                        // Nothing newer than our precondition version: the
                        // apply never happened.
                        return Err(ShardError::PreconditionFailed(
                            "catalog commit was not applied".into(),
                        ));
                    }
                    // The collection advanced without our chunk moving: a
                    // concurrent commit won the precondition race.
                    return Err(ShardError::PreconditionFailed(
                        "another metadata change committed first".into(),
                    ));
                }
                Err(err) => {
                    warn!(
                        ns = %self.req.ns,
                        attempt,
                        error = %err,
                        "commit outcome poll failed"
                    );
                }
            }
        }
        // The commit may have landed; claiming the range back could accept
        // writes the cluster no longer routes here. Leave local state
        // relinquished and let a catalog refresh settle ownership.
        self.relinquished.store(false, Ordering::SeqCst);
        Err(ShardError::InvalidState(
            "migration commit outcome unknown after polling; manual intervention required".into(),
        ))
    }

    /// Failure path common to every phase: put local state back if we had
    /// surrendered the range, tell the recipient to abort, record the
    /// outcome.
    async fn clean_up_after_failure(&self, link: &Arc<dyn MigrationLink>, err: &ShardError) {
        warn!(
            ns = %self.req.ns,
            range = %self.req.range,
            error = %err,
            "migration failed; rolling back donor state"
        );

        if self.relinquished.swap(false, Ordering::SeqCst) {
            // Metadata never moved, so the pre-migration state is still the
            // truth.
            if let Some(prior) = self.prior.lock().clone() {
                self.sharding_state.install(self.req.ns.clone(), prior);
            }
        }
        *self.tracker.lock() = None;

        if self.recipient_started.load(Ordering::SeqCst) {
            let abort = link
                .call(
                    &self.req.to,
                    MigrationCommand::RecvChunkAbort {
                        session: self.session,
                    },
                )
                .await;
            if let Err(abort_err) = abort {
                warn!(
                    to = %self.req.to,
                    error = %abort_err,
                    "failed to deliver abort to recipient"
                );
            }
        }

        let terminal = match err {
            ShardError::ExceededMemoryLimit(_)
            | ShardError::PreconditionFailed(_)
            | ShardError::MigrationAborted(_)
            | ShardError::LockBusy(_) => DonorState::Aborted,
            _ => DonorState::Failed,
        };
        let _ = self.transition(terminal);

        self.catalog
            .log_change(
                "moveChunk.abort",
                &self.req.ns.to_string(),
                json!({
                    "min": format!("{}", self.req.range.min()),
                    "max": format!("{}", self.req.range.max()),
                    "from": self.shard_id.as_str(),
                    "to": self.req.to.as_str(),
                    "error": err.to_string(),
                }),
            )
            .await;
    }

}

/// Clears the critical section on every exit path out of the commit
/// sequence.
struct CriticalSectionGuard {
    cs: Arc<CriticalSection>,
}

impl Drop for CriticalSectionGuard {
    fn drop(&mut self) {
        if self.cs.is_active() {
            self.cs.leave();
        }
    }
}
