//! In-process checkpoint store

use super::CheckpointStore;
use crate::error::StoreResult;
use crate::histogram::HistogramCheckpoint;
use crate::models::CheckpointKey;
use async_trait::async_trait;
use dashmap::DashMap;

/// Checkpoint store backed by a concurrent map; contents die with the process
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: DashMap<CheckpointKey, HistogramCheckpoint>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, key: &CheckpointKey) -> StoreResult<Option<HistogramCheckpoint>> {
        Ok(self.checkpoints.get(key).map(|entry| entry.clone()))
    }

    async fn save(&self, key: &CheckpointKey, checkpoint: &HistogramCheckpoint) -> StoreResult<()> {
        self.checkpoints.insert(key.clone(), checkpoint.clone());
        Ok(())
    }

    async fn delete(&self, key: &CheckpointKey) -> StoreResult<()> {
        self.checkpoints.remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> StoreResult<Vec<CheckpointKey>> {
        let mut keys: Vec<CheckpointKey> =
            self.checkpoints.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }
}
