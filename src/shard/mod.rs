// # Shard Side
//
// Everything a shard contributes to the sharding layer: the per-collection
// version and ownership table requests are validated against, the storage
// seam migrations drive, open-cursor accounting, and the server facade that
// dispatches routed operations and migration commands.

pub mod cursors;
pub mod query;
pub mod server;
pub mod state;
pub mod store;

pub use cursors::{CursorGuard, CursorRegistry};
pub use server::{ShardOp, ShardServer, ShardSet, VersionedRequest};
pub use state::{CollectionShardState, CriticalSection, ShardingState};
pub use store::{DocId, MemStore, WriteObserver};
