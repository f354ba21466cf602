//! Durable `CheckpointStore` for the CLI binary: one JSON file per
//! workflow under `<state_dir>/checkpoints/`, appended to on every save.
//! `flowcore_types::InMemoryCheckpointStore` only survives one process
//! lifetime, which would make `resume` useless across separate `flowcore-
//! engine run`/`resume` invocations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flowcore_types::{Checkpoint, CheckpointStore};
use tokio::fs;
use tokio::sync::Mutex;

pub struct FileCheckpointStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileCheckpointStore {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    fn path_for(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{workflow_id}.json"))
    }

    async fn read_all(path: &Path) -> anyhow::Result<Vec<Checkpoint>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&raw).unwrap_or_default())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&checkpoint.workflow_id);
        let mut all = Self::read_all(&path).await?;
        all.push(checkpoint);
        let raw = serde_json::to_string_pretty(&all)?;
        fs::write(&path, raw).await?;
        Ok(())
    }

    async fn latest(&self, workflow_id: &str) -> anyhow::Result<Option<Checkpoint>> {
        let path = self.path_for(workflow_id);
        Ok(Self::read_all(&path).await?.into_iter().last())
    }

    async fn list(&self, workflow_id: &str) -> anyhow::Result<Vec<Checkpoint>> {
        Self::read_all(&self.path_for(workflow_id)).await
    }
}
