use crate::chunk::ChunkVersion;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShardError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stale shard version: received {received}, shard has {wanted}")]
    StaleShardVersion {
        received: ChunkVersion,
        wanted: ChunkVersion,
    },

    #[error("incompatible epoch: {0}")]
    IncompatibleEpoch(String),

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("collection not sharded: {0}")]
    CollectionNotSharded(String),

    #[error("shard key not found: {0}")]
    ShardKeyNotFound(String),

    #[error("shard key is immutable: {0}")]
    ShardKeyImmutable(String),

    #[error("lock busy: {0}")]
    LockBusy(String),

    #[error("conflicting operation in progress: {0}")]
    ConflictingOperationInProgress(String),

    #[error("exceeded memory limit: {0}")]
    ExceededMemoryLimit(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("shard not found: {0}")]
    ShardNotFound(String),

    #[error("chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("range overlap: {0}")]
    RangeOverlap(String),

    #[error("pool closed")]
    PoolClosed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("migration aborted: {0}")]
    MigrationAborted(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ShardError {
    /// Whether the router can recover by refreshing its routing cache and
    /// retrying the operation.
    pub fn is_stale_version(&self) -> bool {
        matches!(
            self,
            ShardError::StaleShardVersion { .. } | ShardError::IncompatibleEpoch(_)
        )
    }

    /// Whether the epoch changed out from under the caller, requiring a full
    /// cache rebuild rather than an incremental refresh.
    pub fn is_epoch_mismatch(&self) -> bool {
        matches!(self, ShardError::IncompatibleEpoch(_))
    }

    /// Whether the connection layer may transparently retry (idempotent reads
    /// only; writes surface the error).
    pub fn is_retryable_read(&self) -> bool {
        matches!(self, ShardError::Network(_) | ShardError::Timeout(_))
    }
}

impl Clone for ShardError {
    fn clone(&self) -> Self {
        match self {
            ShardError::Io(e) => ShardError::Internal(format!("IO error: {}", e)),
            ShardError::StaleShardVersion { received, wanted } => ShardError::StaleShardVersion {
                received: *received,
                wanted: *wanted,
            },
            ShardError::IncompatibleEpoch(s) => ShardError::IncompatibleEpoch(s.clone()),
            ShardError::NamespaceNotFound(s) => ShardError::NamespaceNotFound(s.clone()),
            ShardError::CollectionNotSharded(s) => ShardError::CollectionNotSharded(s.clone()),
            ShardError::ShardKeyNotFound(s) => ShardError::ShardKeyNotFound(s.clone()),
            ShardError::ShardKeyImmutable(s) => ShardError::ShardKeyImmutable(s.clone()),
            ShardError::LockBusy(s) => ShardError::LockBusy(s.clone()),
            ShardError::ConflictingOperationInProgress(s) => {
                ShardError::ConflictingOperationInProgress(s.clone())
            }
            ShardError::ExceededMemoryLimit(s) => ShardError::ExceededMemoryLimit(s.clone()),
            ShardError::Network(s) => ShardError::Network(s.clone()),
            ShardError::PreconditionFailed(s) => ShardError::PreconditionFailed(s.clone()),
            ShardError::ShardNotFound(s) => ShardError::ShardNotFound(s.clone()),
            ShardError::ChunkNotFound(s) => ShardError::ChunkNotFound(s.clone()),
            ShardError::RangeOverlap(s) => ShardError::RangeOverlap(s.clone()),
            ShardError::PoolClosed => ShardError::PoolClosed,
            ShardError::Serialization(e) => ShardError::Internal(format!("serialization error: {}", e)),
            ShardError::Timeout(s) => ShardError::Timeout(s.clone()),
            ShardError::Unavailable(s) => ShardError::Unavailable(s.clone()),
            ShardError::InvalidInput(s) => ShardError::InvalidInput(s.clone()),
            ShardError::InvalidState(s) => ShardError::InvalidState(s.clone()),
            ShardError::MigrationAborted(s) => ShardError::MigrationAborted(s.clone()),
            ShardError::Internal(s) => ShardError::Internal(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ShardError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkVersion, Epoch};

    #[test]
    fn test_stale_version_classification() {
        let epoch = Epoch::new();
        let err = ShardError::StaleShardVersion {
            received: ChunkVersion::new(epoch, 1, 0),
            wanted: ChunkVersion::new(epoch, 2, 0),
        };
        assert!(err.is_stale_version());
        assert!(!err.is_epoch_mismatch());

        let err = ShardError::IncompatibleEpoch("collection recreated".into());
        assert!(err.is_stale_version());
        assert!(err.is_epoch_mismatch());
    }

    #[test]
    fn test_retryable_reads() {
        assert!(ShardError::Network("connection reset".into()).is_retryable_read());
        assert!(!ShardError::PreconditionFailed("version moved".into()).is_retryable_read());
    }
}
