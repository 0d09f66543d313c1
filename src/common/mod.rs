// # Common Types
//
// Shared identifiers, configuration, and limits used across the sharding
// layer. These are the vocabulary types every other module speaks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Result, ShardError};

pub mod notify;
pub use notify::Notification;

// ============================================================================
// Operational Limits
// ============================================================================

/// How many times the router retries an operation that was rejected with a
/// stale version before surfacing the error.
pub const MAX_STALE_CONFIG_RETRIES: usize = 10;

/// How many times a routing refresh is retried when the chunk metadata read
/// from the catalog is internally inconsistent.
pub const MAX_INCONSISTENT_REFRESH_ATTEMPTS: usize = 3;

/// Hard cap on the memory held by a migration's pending-mod lists. A donor
/// that cannot keep up with the write rate aborts instead of growing without
/// bound.
pub const MIGRATION_PENDING_MODS_MAX_BYTES: u64 = 500 * 1024 * 1024;

/// Nominal time-to-live for a distributed lock: short enough to unblock the
/// cluster after a crash, long enough to cover the longest legitimate
/// migration.
pub const DIST_LOCK_DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

/// Soft cap on documents returned in one migration clone batch.
pub const MIGRATION_CLONE_BATCH_DOCS: usize = 128;

/// Soft cap on the serialized size of one transfer-mods reply.
pub const MIGRATION_XFER_BATCH_BYTES: u64 = 16 * 1024 * 1024;

// ============================================================================
// Identifiers
// ============================================================================

/// Short stable string identifying a shard. Immutable for the life of the
/// shard.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        ShardId(s.to_string())
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        ShardId(s)
    }
}

/// Fully qualified collection name, `db.collection`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parse a `db.collection` string. The collection part may itself contain
    /// dots; the database part may not.
    pub fn parse(ns: &str) -> Result<Self> {
        match ns.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self {
                db: db.to_string(),
                coll: coll.to_string(),
            }),
            _ => Err(ShardError::InvalidInput(format!(
                "invalid namespace '{}', expected db.collection",
                ns
            ))),
        }
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn coll(&self) -> &str {
        &self.coll
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl TryFrom<String> for Namespace {
    type Error = ShardError;

    fn try_from(s: String) -> Result<Self> {
        Namespace::parse(&s)
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> String {
        ns.to_string()
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for the sharding layer. Serde-friendly so deployments can load
/// it from their config file; defaults match the nominal production values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingConfig {
    /// Soft cap on pooled connections per target host.
    pub max_connections_per_host: usize,

    /// Idle time after which a pooled connection is probed before reuse.
    pub connection_idle_probe_after: Duration,

    /// Memory cap for a migration's pending-mod lists.
    pub migration_memory_limit_bytes: u64,

    /// How long the donor waits for the recipient to reach a steady state
    /// before giving up on the migration.
    pub migration_catchup_timeout: Duration,

    /// Interval between donor polls of the recipient state.
    pub migration_status_poll_interval: Duration,

    /// Attempts to determine the commit outcome when the catalog apply ack
    /// is lost. The apply is never blindly retried.
    pub commit_poll_attempts: u32,

    /// Interval between commit-outcome polls.
    pub commit_poll_interval: Duration,

    /// How long the donor waits for open cursors on a moved range before
    /// forcibly invalidating them and deleting the range.
    pub cursor_drain_timeout: Duration,

    /// Time-to-live requested for the migration's distributed lock.
    pub dist_lock_ttl: Duration,

    /// Replica count per shard, used to compute the majority write target
    /// the recipient must reach before acknowledging a commit.
    pub replicas_per_shard: u32,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: 100,
            connection_idle_probe_after: Duration::from_secs(300),
            migration_memory_limit_bytes: MIGRATION_PENDING_MODS_MAX_BYTES,
            migration_catchup_timeout: Duration::from_secs(600),
            migration_status_poll_interval: Duration::from_millis(50),
            commit_poll_attempts: 8,
            commit_poll_interval: Duration::from_millis(500),
            cursor_drain_timeout: Duration::from_secs(3600),
            dist_lock_ttl: DIST_LOCK_DEFAULT_TTL,
            replicas_per_shard: 3,
        }
    }
}

impl ShardingConfig {
    /// Majority count for a shard's replica set: `floor(replicas/2) + 1`.
    pub fn majority_count(&self) -> u32 {
        self.replicas_per_shard / 2 + 1
    }
}
