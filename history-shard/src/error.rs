use shard_store::{ShardId, StoreError};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardError {
    /// The shard is owned by another process, or this context has been
    /// invalidated or stopped. Never retry against the same context.
    #[error("Shard `{shard_id}` ownership lost")]
    OwnershipLost { shard_id: ShardId },
    #[error("Not found: {0}")]
    NotFound(String),
    /// The outcome is unknown or the backend is unavailable. Safe to retry.
    #[error("Transient: {0}")]
    Transient(String),
    #[error("Invalid: {0}")]
    InvalidArgument(String),
    /// A conditional execution write was rejected by the store.
    #[error("Condition failed: {0}")]
    ConditionFailed(String),
}

impl ShardError {
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShardError::Transient(_))
    }

    #[inline]
    pub fn is_ownership_lost(&self) -> bool {
        matches!(self, ShardError::OwnershipLost { .. })
    }
}

impl From<StoreError> for ShardError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::ShardOwnershipLost { shard_id, .. } => {
                ShardError::OwnershipLost { shard_id }
            }
            StoreError::NotFound(msg) => ShardError::NotFound(msg),
            StoreError::AlreadyExists(msg)
            | StoreError::ConditionFailed(msg) => {
                ShardError::ConditionFailed(msg)
            }
            StoreError::InvalidKey(msg) => ShardError::InvalidArgument(msg),
            err @ (StoreError::Serialization(_)
            | StoreError::Deserialization(_)) => {
                ShardError::InvalidArgument(err.to_string())
            }
            err @ (StoreError::Timeout(_)
            | StoreError::Connection(_)
            | StoreError::Backend(_)) => ShardError::Transient(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_shard_taxonomy() {
        let lost: ShardError = StoreError::ShardOwnershipLost {
            shard_id: 7,
            request_range_id: 4,
            current_range_id: 5,
        }
        .into();
        assert_eq!(lost, ShardError::OwnershipLost { shard_id: 7 });
        assert!(lost.is_ownership_lost());

        let timeout: ShardError = StoreError::Timeout("slow".into()).into();
        assert!(timeout.is_retryable());

        let exists: ShardError = StoreError::AlreadyExists("wf".into()).into();
        assert!(matches!(exists, ShardError::ConditionFailed(_)));
        assert!(!exists.is_retryable());
    }
}
