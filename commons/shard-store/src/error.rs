use crate::types::ShardId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Item already exists: {0}")]
    AlreadyExists(String),

    #[error(
        "Shard ownership lost: shard {shard_id}, range {request_range_id} \
         superseded by {current_range_id}"
    )]
    ShardOwnershipLost {
        shard_id: ShardId,
        request_range_id: i64,
        current_range_id: i64,
    },

    #[error("Condition failed: {0}")]
    ConditionFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::error::EncodeError),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] bincode::error::DecodeError),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// The write may or may not have been applied.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Connection(_))
    }

    pub fn backend<T: ToString>(msg: T) -> Self {
        Self::Backend(msg.to_string())
    }
}
