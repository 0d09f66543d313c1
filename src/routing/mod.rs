// # Routing
//
// The router-side half of the sharding layer: immutable routing snapshots,
// the lazily refreshed per-collection cache, the operation targeter, and
// the retry loop that turns stale-version feedback into cache refreshes.

pub mod cache;
pub mod info;
pub mod router;
pub mod targeter;

pub use cache::RoutingCache;
pub use info::{refresh_routing_info, CollectionRoutingInfo};
pub use router::{Router, ShardConnector};
pub use targeter::{ChunkTargeter, ShardEndpoint};
