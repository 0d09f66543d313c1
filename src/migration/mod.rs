// # Chunk Migration
//
// The multi-phase handoff of one chunk between a donor shard, a recipient
// shard, and the catalog. The donor drives; the recipient pulls; the
// catalog commit is the single atomic point where ownership changes.

pub mod cleanup;
pub mod commands;
pub mod donor;
pub mod recipient;
pub mod tracker;

pub use commands::{
    CloneBatch, MigrationCommand, MigrationLink, MigrationReply, RecipientState, RecvChunkStart,
    RecvChunkStatusReply, TransferModsBatch,
};
pub use donor::{DonorState, MigrationDonor, MoveChunkRequest, MoveChunkResult};
pub use recipient::MigrationRecipient;
pub use tracker::{ModTracker, TrackerRegistration};
