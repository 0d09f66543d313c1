// # Migration Commands
//
// The donor/recipient RPC vocabulary, serde documents over whatever framed
// channel connects two shards. The donor drives `_recvChunk*` against the
// recipient; the recipient pulls `_migrateClone` and `_transferMods` from
// the donor. The transfer stream is idempotent on the recipient (upsert and
// delete by identity), so either side may retransmit freely.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunk::{ChunkRange, ChunkVersion, Epoch};
use crate::common::{Namespace, ShardId};
use crate::error::Result;

/// `_recvChunkStart`: begin the recipient state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecvChunkStart {
    pub ns: Namespace,
    pub from: ShardId,
    pub to: ShardId,
    pub range: ChunkRange,
    pub epoch: Epoch,
    pub collection_version: ChunkVersion,
    /// Correlates every later command with this migration attempt.
    pub session: Uuid,
    pub config_server: String,
}

/// Recipient phases, reported by `_recvChunkStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientState {
    Ready,
    Clone,
    Catchup,
    Steady,
    CommitStart,
    Done,
    Fail,
    Abort,
}

impl RecipientState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecipientState::Done | RecipientState::Fail | RecipientState::Abort
        )
    }
}

/// Reply to `_recvChunkStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecvChunkStatusReply {
    pub session: Uuid,
    pub state: RecipientState,
    pub cloned_docs: u64,
    pub cloned_bytes: u64,
    /// Why the recipient failed, when `state` is `Fail`.
    pub error: Option<String>,
}

/// One pull of initial documents; an empty batch ends the clone phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneBatch {
    pub docs: Vec<serde_json::Value>,
}

impl CloneBatch {
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// One pull of deltas: identities deleted from the range and the current
/// contents of documents written in it. `size` is the serialized payload
/// footprint; zero means the donor has nothing pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferModsBatch {
    pub deleted: Vec<serde_json::Value>,
    pub reload: Vec<serde_json::Value>,
    pub size: u64,
}

impl TransferModsBatch {
    pub fn empty() -> Self {
        Self {
            deleted: Vec::new(),
            reload: Vec::new(),
            size: 0,
        }
    }
}

/// Commands exchanged between the two sides of a migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MigrationCommand {
    /// Donor -> recipient.
    RecvChunkStart(RecvChunkStart),
    RecvChunkStatus { session: Uuid },
    RecvChunkCommit { session: Uuid },
    RecvChunkAbort { session: Uuid },

    /// Recipient -> donor.
    MigrateClone { session: Uuid },
    TransferMods { session: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MigrationReply {
    Started,
    Status(RecvChunkStatusReply),
    CommitOk,
    Aborted,
    Clone(CloneBatch),
    Mods(TransferModsBatch),
}

/// Transport between shards participating in a migration. In-process
/// clusters dispatch directly; a networked deployment sends the serialized
/// command over a pooled connection.
#[async_trait]
pub trait MigrationLink: Send + Sync {
    async fn call(&self, target: &ShardId, command: MigrationCommand) -> Result<MigrationReply>;
}
