// # Migration Recipient
//
// Destination side of a chunk migration. Pulls the initial clone from the
// donor, applies catch-up deltas until the backlog is drained, then holds
// steady until the donor's commit arrives. The success reply to
// `_recvChunkCommit` is withheld until the final deltas are applied and
// durable on a majority of replicas, which is what makes post-reply failure
// impossible by construction.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::{Notification, ShardingConfig, MIGRATION_XFER_BATCH_BYTES};
use crate::error::{Result, ShardError};
use crate::migration::commands::{
    MigrationCommand, MigrationLink, MigrationReply, RecipientState, RecvChunkStart,
    RecvChunkStatusReply, TransferModsBatch,
};
use crate::shard::state::ShardingState;
use crate::shard::store::{DocId, MemStore};

pub struct MigrationRecipient {
    req: RecvChunkStart,
    config: ShardingConfig,
    store: Arc<MemStore>,
    state: Mutex<RecipientState>,
    error: Mutex<Option<String>>,
    cloned_docs: AtomicU64,
    cloned_bytes: AtomicU64,
    commit_requested: Notification<()>,
    abort_requested: AtomicBool,
    /// Set once the run task reaches a terminal state; the payload is the
    /// failure message when it did not reach `Done`.
    finished: Notification<std::result::Result<(), String>>,
}

impl MigrationRecipient {
    /// Validate the incoming range, clean residue from any previously
    /// aborted migration, and start the pull task.
    pub fn start(
        req: RecvChunkStart,
        config: ShardingConfig,
        store: Arc<MemStore>,
        sharding_state: Arc<ShardingState>,
        link: Arc<dyn MigrationLink>,
    ) -> Result<Arc<Self>> {
        // The incoming range must not overlap anything this shard already
        // owns; receiving an owned range would manufacture duplicates.
        if let Some(collection) = sharding_state.get(&req.ns) {
            if let Some(owned) = collection
                .owned
                .iter()
                .find(|owned| owned.overlaps(&req.range))
            {
                return Err(ShardError::RangeOverlap(format!(
                    "incoming range {} overlaps owned chunk {}",
                    req.range, owned
                )));
            }
            if collection.epoch != req.epoch {
                return Err(ShardError::IncompatibleEpoch(format!(
                    "migration epoch {} does not match collection epoch {}",
                    req.epoch, collection.epoch
                )));
            }
        }

        // Defensive cleanup: a previous aborted migration may have left
        // partial clones behind.
        let pattern = sharding_state
            .get(&req.ns)
            .map(|c| c.pattern)
            .unwrap_or_else(|| crate::chunk::ShardKeyPattern::ascending("_id"));
        let residue = store.purge_range(&req.ns, &pattern, &req.range);
        if residue > 0 {
            warn!(
                ns = %req.ns,
                range = %req.range,
                residue,
                "purged residual documents before clone"
            );
        }

        let recipient = Arc::new(Self {
            req,
            config,
            store,
            state: Mutex::new(RecipientState::Ready),
            error: Mutex::new(None),
            cloned_docs: AtomicU64::new(0),
            cloned_bytes: AtomicU64::new(0),
            commit_requested: Notification::new(),
            abort_requested: AtomicBool::new(false),
            finished: Notification::new(),
        });

        let task = Arc::clone(&recipient);
        tokio::spawn(async move {
            task.run(link, pattern).await;
        });
        Ok(recipient)
    }

    pub fn session(&self) -> Uuid {
        self.req.session
    }

    pub fn state(&self) -> RecipientState {
        *self.state.lock()
    }

    pub fn status(&self) -> RecvChunkStatusReply {
        RecvChunkStatusReply {
            session: self.req.session,
            state: self.state(),
            cloned_docs: self.cloned_docs.load(Ordering::Relaxed),
            cloned_bytes: self.cloned_bytes.load(Ordering::Relaxed),
            error: self.error.lock().clone(),
        }
    }

    /// `_recvChunkCommit`: ask the recipient to finish and block until it
    /// reports durability or failure.
    pub async fn commit(&self) -> Result<()> {
        self.commit_requested.set(());
        match self.finished.wait().await {
            Ok(()) => Ok(()),
            Err(msg) => Err(ShardError::MigrationAborted(msg)),
        }
    }

    /// `_recvChunkAbort`: terminate early and clean up cloned documents.
    pub fn abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
    }

    fn set_state(&self, state: RecipientState) {
        debug!(ns = %self.req.ns, session = %self.req.session, ?state, "recipient state");
        *self.state.lock() = state;
    }

    fn aborted(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    async fn run(&self, link: Arc<dyn MigrationLink>, pattern: crate::chunk::ShardKeyPattern) {
        match self.run_inner(&link).await {
            Ok(()) => {
                info!(
                    ns = %self.req.ns,
                    range = %self.req.range,
                    docs = self.cloned_docs.load(Ordering::Relaxed),
                    "migration recipient done"
                );
                self.set_state(RecipientState::Done);
                self.finished.set(Ok(()));
            }
            Err(err) => {
                let aborted = self.aborted();
                let message = err.to_string();
                warn!(ns = %self.req.ns, error = %message, aborted, "migration recipient failed");
                // Roll back whatever was cloned; ownership never moved.
                self.store.purge_range(&self.req.ns, &pattern, &self.req.range);
                *self.error.lock() = Some(message.clone());
                self.set_state(if aborted {
                    RecipientState::Abort
                } else {
                    RecipientState::Fail
                });
                self.finished.set(Err(message));
            }
        }
    }

    async fn run_inner(&self, link: &Arc<dyn MigrationLink>) -> Result<()> {
        let from = &self.req.from;
        let session = self.req.session;

        self.set_state(RecipientState::Clone);
        loop {
            if self.aborted() {
                return Err(ShardError::MigrationAborted("abort requested".into()));
            }
            let reply = link
                .call(from, MigrationCommand::MigrateClone { session })
                .await?;
            let batch = match reply {
                MigrationReply::Clone(batch) => batch,
                other => {
                    return Err(ShardError::Internal(format!(
                        "unexpected reply to _migrateClone: {other:?}"
                    )))
                }
            };
            if batch.is_empty() {
                break;
            }
            for doc in batch.docs {
                self.cloned_bytes
                    .fetch_add(doc.to_string().len() as u64, Ordering::Relaxed);
                self.store.upsert(&self.req.ns, doc)?;
                self.cloned_docs.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.set_state(RecipientState::Catchup);
        loop {
            if self.aborted() {
                return Err(ShardError::MigrationAborted("abort requested".into()));
            }
            let batch = self.pull_mods(link).await?;
            if batch.size == 0 {
                break;
            }
            self.apply_mods(batch)?;
        }

        self.set_state(RecipientState::Steady);
        let commit_wait = self.commit_requested.wait();
        tokio::pin!(commit_wait);
        loop {
            if self.aborted() {
                return Err(ShardError::MigrationAborted("abort requested".into()));
            }
            tokio::select! {
                _ = &mut commit_wait => break,
                _ = sleep(self.config.migration_status_poll_interval) => {
                    let batch = self.pull_mods(link).await?;
                    self.apply_mods(batch)?;
                }
            }
        }

        self.set_state(RecipientState::CommitStart);
        loop {
            let batch = self.pull_mods(link).await?;
            if batch.size == 0 {
                break;
            }
            self.apply_mods(batch)?;
        }

        // Majority durability before acknowledging; the donor treats our
        // success reply as the point of no return.
        self.store.flush_majority(self.config.majority_count())?;
        Ok(())
    }

    async fn pull_mods(&self, link: &Arc<dyn MigrationLink>) -> Result<TransferModsBatch> {
        let reply = link
            .call(
                &self.req.from,
                MigrationCommand::TransferMods {
                    session: self.req.session,
                },
            )
            .await?;
        match reply {
            MigrationReply::Mods(batch) => Ok(batch),
            other => Err(ShardError::Internal(format!(
                "unexpected reply to _transferMods: {other:?}"
            ))),
        }
    }

    /// Deletes then reloads, both by identity; replaying a batch is a
    /// no-op-equivalent, which is what lets the donor retransmit freely.
    fn apply_mods(&self, batch: TransferModsBatch) -> Result<()> {
        if batch.size > MIGRATION_XFER_BATCH_BYTES {
            warn!(
                ns = %self.req.ns,
                size = batch.size,
                "oversized transfer-mods batch"
            );
        }
        for id in &batch.deleted {
            self.store.delete(&self.req.ns, &DocId::from_value(id));
        }
        for doc in batch.reload {
            self.store.upsert(&self.req.ns, doc)?;
        }
        Ok(())
    }
}
