//! JSON file storage implementation.
//!
//! Checkpoints live at `<workspace>/.ao/pipeline-<session>.json`. Writes go to
//! a sibling `.tmp` file that is renamed over the target, so readers never see
//! a half-written checkpoint. Unreadable files are reported as absent.

use std::path::{Path, PathBuf};

use ao_core::PipelineCheckpoint;
use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use super::{CheckpointStore, Result};

/// Directory under the workspace that holds pipeline state.
pub const STATE_DIR: &str = ".ao";

/// File-based checkpoint store for one session.
#[derive(Debug, Clone)]
pub struct JsonCheckpointStore {
    path: PathBuf,
}

impl JsonCheckpointStore {
    /// Store checkpoints at an explicit path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store checkpoints for `session_id` under `workspace`.
    pub fn for_session(workspace: impl AsRef<Path>, session_id: &str) -> Self {
        Self::new(checkpoint_path(workspace, session_id))
    }

    /// Where the checkpoint is written.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Checkpoint location for a session.
pub fn checkpoint_path(workspace: impl AsRef<Path>, session_id: &str) -> PathBuf {
    workspace
        .as_ref()
        .join(STATE_DIR)
        .join(format!("pipeline-{}.json", session_id))
}

#[async_trait::async_trait]
impl CheckpointStore for JsonCheckpointStore {
    async fn load(&self) -> Option<PipelineCheckpoint> {
        read_json_lenient(&self.path).await
    }

    async fn save(&self, checkpoint: &PipelineCheckpoint) -> Result<()> {
        write_json_atomic(&self.path, checkpoint).await?;
        debug!(
            "Saved checkpoint for {} at layer {}",
            checkpoint.session_id, checkpoint.current_layer
        );
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        remove_if_exists(&self.path).await
    }
}

/// Read a JSON file, treating a missing or malformed file as absent.
pub async fn read_json_lenient<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Ignoring unreadable {}: {}", path.display(), e);
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring malformed {}: {}", path.display(), e);
            None
        }
    }
}

/// Write pretty JSON to `path`, creating parent directories and replacing
/// the previous content in one rename.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let json = serde_json::to_string_pretty(value)?;
    let tmp = tmp_path(path);
    fs::write(&tmp, json.as_bytes()).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Remove a file; a missing file is not an error.
pub async fn remove_if_exists(path: &Path) -> Result<()> {
    fs::remove_file(path).await.or_else(|e| {
        if e.kind() == std::io::ErrorKind::NotFound { Ok(()) } else { Err(e) }
    })?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ao_core::{AgentType, GuardPhase, SubtaskCheckpointResult, TddGuardResult};
    use std::collections::BTreeMap;

    fn sample_checkpoint(layer: usize) -> PipelineCheckpoint {
        let mut results = BTreeMap::new();
        results.insert(
            "subtask-0".to_string(),
            SubtaskCheckpointResult::running(AgentType::Tester),
        );
        PipelineCheckpoint::at_layer(
            "session-a",
            "hash",
            layer,
            results,
            vec![TddGuardResult::pass(GuardPhase::Red)],
        )
    }

    #[test]
    fn test_checkpoint_path_layout() {
        let path = checkpoint_path("/work", "abc");
        assert_eq!(path, PathBuf::from("/work/.ao/pipeline-abc.json"));
    }

    #[tokio::test]
    async fn test_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::for_session(dir.path(), "session-a");

        assert!(store.load().await.is_none());

        store.save(&sample_checkpoint(1)).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.current_layer, 1);
        assert_eq!(loaded.completed_layers, vec![0]);
        assert_eq!(loaded.tdd_results.len(), 1);

        store.clear().await.unwrap();
        assert!(store.load().await.is_none());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::for_session(dir.path(), "session-a");

        store.save(&sample_checkpoint(0)).await.unwrap();
        store.save(&sample_checkpoint(2)).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.current_layer, 2);
        assert!(!tmp_path(store.path()).exists());
    }

    #[tokio::test]
    async fn test_malformed_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::for_session(dir.path(), "session-a");

        fs::create_dir_all(store.path().parent().unwrap()).await.unwrap();
        fs::write(store.path(), b"{ not json").await.unwrap();
        assert!(store.load().await.is_none());

        fs::write(store.path(), br#"{"sessionId": 3}"#).await.unwrap();
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn test_clear_missing_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::for_session(dir.path(), "never-written");
        store.clear().await.unwrap();
    }
}
