//! Checkpoint store abstraction.

use ao_core::PipelineCheckpoint;
use async_trait::async_trait;

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persists pipeline progress for one session.
///
/// Implementations assume a single writer per session.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint. Absent or malformed data yields `None`.
    async fn load(&self) -> Option<PipelineCheckpoint>;

    /// Overwrite the checkpoint.
    async fn save(&self, checkpoint: &PipelineCheckpoint) -> Result<()>;

    /// Remove the checkpoint. Removing an absent checkpoint is a no-op.
    async fn clear(&self) -> Result<()>;
}
