//! File-backed checkpoint store
//!
//! One JSON document per key in a flat directory. Key components are
//! percent-encoded before being joined with `_`, so distinct keys never share
//! a file. Writes go to a uniquely named temporary file that is synced and
//! renamed over the final path, so a crash never leaves a half-written
//! checkpoint behind.

use super::CheckpointStore;
use crate::error::StoreResult;
use crate::histogram::HistogramCheckpoint;
use crate::models::CheckpointKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// On-disk record; the key is stored alongside so listing needs no filename parsing
#[derive(Serialize, Deserialize)]
struct CheckpointRecord {
    key: CheckpointKey,
    checkpoint: HistogramCheckpoint,
}

/// Checkpoint store writing one file per key under a directory
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &CheckpointKey) -> PathBuf {
        let name = format!(
            "{}_{}_{}_{}",
            encode_component(&key.target.namespace),
            encode_component(&key.target.name),
            encode_component(&key.container),
            key.resource
        );
        self.dir.join(format!("{}.{}", name, EXTENSION))
    }

    /// Temporary path unique to one write, so concurrent saves never share it
    fn temp_path_for(path: &Path) -> PathBuf {
        let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        path.with_extension(format!("{}.{}.{}", std::process::id(), seq, TEMP_EXTENSION))
    }

    async fn read_record(path: &Path) -> StoreResult<CheckpointRecord> {
        let data = fs::read(path).await?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, key: &CheckpointKey) -> StoreResult<Option<HistogramCheckpoint>> {
        match Self::read_record(&self.path_for(key)).await {
            Ok(record) if record.key == *key => Ok(Some(record.checkpoint)),
            Ok(record) => {
                warn!(key = %key, stored = %record.key, "Checkpoint file holds another key");
                Ok(None)
            }
            Err(crate::error::StoreError::Io(e)) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn save(&self, key: &CheckpointKey, checkpoint: &HistogramCheckpoint) -> StoreResult<()> {
        fs::create_dir_all(&self.dir).await?;

        let record = CheckpointRecord {
            key: key.clone(),
            checkpoint: checkpoint.clone(),
        };
        let json = serde_json::to_vec(&record)?;

        let path = self.path_for(key);
        let temp_path = Self::temp_path_for(&path);
        if let Err(e) = write_synced(&temp_path, &json).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        fs::rename(&temp_path, &path).await?;
        debug!(key = %key, path = %path.display(), "Saved checkpoint");
        Ok(())
    }

    async fn delete(&self, key: &CheckpointKey) -> StoreResult<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self) -> StoreResult<Vec<CheckpointKey>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(record) => keys.push(record.key),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint file");
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

/// Percent-encode every byte outside `[A-Za-z0-9.-]`, including `_` and `%`
fn encode_component(component: &str) -> String {
    let mut encoded = String::with_capacity(component.len());
    for byte in component.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'.' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}
