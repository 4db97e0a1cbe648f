//! State file for engine records
//!
//! Persists a [`StoreSnapshot`] to `<state_dir>/state.json` so a later
//! `report` or `sweep` can pick up where a run left off.

use crate::error::{CoreError, Result};
use crate::store::{MemoryStore, StoreSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

const STATE_VERSION: u32 = 1;
const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.backup";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    /// State file version
    pub version: u32,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    pub store: StoreSnapshot,
}

impl StateDocument {
    pub fn new(store: StoreSnapshot) -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            store,
        }
    }
}

pub struct StateFile {
    dir: PathBuf,
}

impl StateFile {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.dir.join(STATE_BACKUP)
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).await?;
            tracing::debug!("Created state directory: {}", self.dir.display());
        }
        Ok(())
    }

    /// Load the saved document, or an empty one when no file exists
    pub async fn load(&self) -> Result<StateDocument> {
        let path = self.path();
        if !path.exists() {
            tracing::debug!("State file not found, returning empty state");
            return Ok(StateDocument::new(StoreSnapshot::default()));
        }

        let content = fs::read_to_string(&path).await?;
        let document: StateDocument = serde_json::from_str(&content)?;

        if document.version > STATE_VERSION {
            return Err(CoreError::StateError(format!(
                "State file version {} is newer than supported version {}",
                document.version, STATE_VERSION
            )));
        }

        tracing::debug!(
            resources = document.store.resources.len(),
            tasks = document.store.tasks.len(),
            steps = document.store.steps.len(),
            "Loaded state"
        );
        Ok(document)
    }

    pub async fn load_store(&self) -> Result<MemoryStore> {
        Ok(MemoryStore::from_snapshot(self.load().await?.store))
    }

    /// Write the store, keeping the previous file as `.backup`
    pub async fn save(&self, store: &MemoryStore) -> Result<()> {
        self.ensure_dir().await?;

        let path = self.path();
        let backup = self.backup_path();

        if path.exists() {
            if backup.exists() {
                fs::remove_file(&backup).await?;
            }
            fs::rename(&path, &backup).await?;
            tracing::debug!("Created state backup");
        }

        let document = StateDocument::new(store.snapshot());
        let content = serde_json::to_string_pretty(&document)?;
        fs::write(&path, content).await?;

        tracing::debug!(
            resources = document.store.resources.len(),
            "Saved state to {}",
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceRecord;
    use crate::repository::ResourceRepository;
    use tempfile::tempdir;
    use vpcflow_cloud::{ResourceKind, Scope};

    #[tokio::test]
    async fn test_state_save_load() {
        let temp_dir = tempdir().unwrap();
        let state = StateFile::new(temp_dir.path().join("state"));

        let store = MemoryStore::new();
        store
            .insert_resource(
                ResourceRecord::builder(
                    ResourceKind::Network,
                    Scope::new("acct", "us-south"),
                    "vpc-a",
                )
                .build(),
            )
            .unwrap();
        state.save(&store).await.unwrap();

        let loaded = state.load_store().await.unwrap();
        let found = loaded
            .find_by(ResourceKind::Network, &Scope::new("acct", "us-south"), "vpc-a")
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_second_save_keeps_backup() {
        let temp_dir = tempdir().unwrap();
        let state = StateFile::new(temp_dir.path());
        let store = MemoryStore::new();

        state.save(&store).await.unwrap();
        assert!(!temp_dir.path().join(STATE_BACKUP).exists());
        state.save(&store).await.unwrap();
        assert!(temp_dir.path().join(STATE_BACKUP).exists());
    }

    #[tokio::test]
    async fn test_empty_state() {
        let temp_dir = tempdir().unwrap();
        let state = StateFile::new(temp_dir.path());

        let document = state.load().await.unwrap();
        assert!(document.store.resources.is_empty());
        assert!(!state.exists());
    }

    #[tokio::test]
    async fn test_newer_version_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let state = StateFile::new(temp_dir.path());

        let mut document = StateDocument::new(StoreSnapshot::default());
        document.version = STATE_VERSION + 1;
        std::fs::write(state.path(), serde_json::to_string(&document).unwrap()).unwrap();

        let err = state.load().await.unwrap_err();
        assert!(matches!(err, CoreError::StateError(_)));
    }
}
