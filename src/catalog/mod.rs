// # Catalog
//
// The authoritative metadata service and its client surface: catalog
// document types, the strongly-consistent `CatalogClient` trait, the
// in-process catalog implementation, chunk commit operations, the
// distributed lock handle, and the shard registry.

pub mod client;
pub mod config_catalog;
pub mod ops;
pub mod registry;
pub mod types;

pub use client::{log_change_detached, CatalogClient, DistLock, LockReleaser};
pub use config_catalog::ConfigCatalog;
pub use ops::{commit_chunk_migration, merge_chunks, split_chunk};
pub use registry::ShardRegistry;
pub use types::{
    ChangelogEntry, ChunkOp, CollectionAndChunks, CollectionEntry, LockEntry, Precondition,
    RemoveShardResult, ShardEntry, ShardState,
};
