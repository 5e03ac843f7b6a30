//! Checkpoint persistence
//!
//! Histograms are saved periodically and on shutdown so recommendations
//! survive restarts. Stores are keyed by (target, container, resource).

mod file;
mod memory;

pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;

use crate::error::StoreResult;
use crate::histogram::HistogramCheckpoint;
use crate::models::CheckpointKey;
use async_trait::async_trait;

/// Persistence boundary for histogram checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load a checkpoint, `None` when nothing was saved under `key`
    async fn load(&self, key: &CheckpointKey) -> StoreResult<Option<HistogramCheckpoint>>;

    async fn save(&self, key: &CheckpointKey, checkpoint: &HistogramCheckpoint) -> StoreResult<()>;

    /// Remove a checkpoint; deleting a missing key succeeds
    async fn delete(&self, key: &CheckpointKey) -> StoreResult<()>;

    async fn list_keys(&self) -> StoreResult<Vec<CheckpointKey>>;
}
