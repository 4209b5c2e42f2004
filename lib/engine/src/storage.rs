//! Pluggable persistence for run journals.
//!
//! A backend stores whole journals keyed by `(workflow_id, run_id)` and
//! never interprets snapshot contents beyond serialization. Concurrent
//! writers to the same run must be serialized by the backend — the
//! filesystem variant relies on atomic rename, the SQL variant (see
//! [`crate::sqlite`]) on a row-level upsert.

use crate::error::StorageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// The persisted form of a run: the journal plus its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRun {
    /// The workflow the run belongs to.
    pub workflow_id: String,
    /// The run's id.
    pub run_id: String,
    /// The journal snapshots, oldest first.
    pub steps: Vec<Value>,
}

/// A persistence backend for run journals.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Replaces the run's journal atomically.
    async fn save_state(
        &self,
        workflow_id: &str,
        run_id: &str,
        steps: &[Value],
    ) -> Result<(), StorageError>;

    /// Loads the run's journal, or `None` if the run does not exist.
    async fn load_state(
        &self,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<Option<StoredRun>, StorageError>;

    /// Lists run ids for a workflow, newest first.
    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<String>, StorageError>;

    /// Lists all workflow ids with persisted runs.
    async fn list_workflows(&self) -> Result<Vec<String>, StorageError>;
}

fn io_error(context: &Path, error: &std::io::Error) -> StorageError {
    StorageError::Io { message: format!("{}: {error}", context.display()) }
}

/// Filesystem-backed storage: one `state.json` per run under
/// `<base>/<workflow_id>/<run_id>/`, written via temp file + atomic rename.
#[derive(Debug, Clone)]
pub struct FileSystemStorage {
    base_dir: PathBuf,
}

impl FileSystemStorage {
    /// Creates a backend rooted at `base_dir`. The directory is created on
    /// first save.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn run_dir(&self, workflow_id: &str, run_id: &str) -> PathBuf {
        self.base_dir.join(workflow_id).join(run_id)
    }

    fn state_path(&self, workflow_id: &str, run_id: &str) -> PathBuf {
        self.run_dir(workflow_id, run_id).join("state.json")
    }

    async fn list_dirs(path: &Path) -> Result<Vec<String>, StorageError> {
        let mut entries = match tokio::fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(path, &e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(path, &e))? {
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| io_error(path, &e))?
                .is_dir();
            if is_dir {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn save_state(
        &self,
        workflow_id: &str,
        run_id: &str,
        steps: &[Value],
    ) -> Result<(), StorageError> {
        let run_dir = self.run_dir(workflow_id, run_id);
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|e| io_error(&run_dir, &e))?;

        let payload = StoredRun {
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            steps: steps.to_vec(),
        };
        let encoded = serde_json::to_vec(&payload)
            .map_err(|e| StorageError::Serialization { message: e.to_string() })?;

        let state_path = self.state_path(workflow_id, run_id);
        let temp_path = run_dir.join("state.json.tmp");
        tokio::fs::write(&temp_path, encoded)
            .await
            .map_err(|e| io_error(&temp_path, &e))?;
        tokio::fs::rename(&temp_path, &state_path)
            .await
            .map_err(|e| io_error(&state_path, &e))
    }

    async fn load_state(
        &self,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<Option<StoredRun>, StorageError> {
        let state_path = self.state_path(workflow_id, run_id);
        let bytes = match tokio::fs::read(&state_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&state_path, &e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Serialization { message: e.to_string() })
    }

    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<String>, StorageError> {
        let workflow_dir = self.base_dir.join(workflow_id);
        let mut runs = Self::list_dirs(&workflow_dir).await?;
        runs.sort_by(|a, b| b.cmp(a));
        Ok(runs)
    }

    async fn list_workflows(&self) -> Result<Vec<String>, StorageError> {
        let mut workflows = Self::list_dirs(&self.base_dir).await?;
        workflows.sort();
        Ok(workflows)
    }
}

/// In-memory storage, for tests and hosts that manage durability themselves.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    runs: Mutex<HashMap<(String, String), Vec<Value>>>,
}

impl MemoryStorage {
    /// Creates an empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Vec<Value>>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn save_state(
        &self,
        workflow_id: &str,
        run_id: &str,
        steps: &[Value],
    ) -> Result<(), StorageError> {
        self.lock()
            .insert((workflow_id.to_string(), run_id.to_string()), steps.to_vec());
        Ok(())
    }

    async fn load_state(
        &self,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<Option<StoredRun>, StorageError> {
        Ok(self
            .lock()
            .get(&(workflow_id.to_string(), run_id.to_string()))
            .map(|steps| StoredRun {
                workflow_id: workflow_id.to_string(),
                run_id: run_id.to_string(),
                steps: steps.clone(),
            }))
    }

    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<String>, StorageError> {
        let mut runs: Vec<String> = self
            .lock()
            .keys()
            .filter(|(wf, _)| wf == workflow_id)
            .map(|(_, run)| run.clone())
            .collect();
        runs.sort_by(|a, b| b.cmp(a));
        Ok(runs)
    }

    async fn list_workflows(&self) -> Result<Vec<String>, StorageError> {
        let mut workflows: Vec<String> =
            self.lock().keys().map(|(wf, _)| wf.clone()).collect();
        workflows.sort();
        workflows.dedup();
        Ok(workflows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_steps() -> Vec<Value> {
        vec![json!({"shared": {}, "next_node_id": "a"}), json!({"shared": {"a": true}})]
    }

    #[tokio::test]
    async fn filesystem_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::new(dir.path());

        storage.save_state("wf", "run_1", &sample_steps()).await.unwrap();
        let stored = storage.load_state("wf", "run_1").await.unwrap().unwrap();
        assert_eq!(stored.workflow_id, "wf");
        assert_eq!(stored.run_id, "run_1");
        assert_eq!(stored.steps, sample_steps());
    }

    #[tokio::test]
    async fn filesystem_save_replaces_existing_journal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::new(dir.path());

        storage.save_state("wf", "run_1", &sample_steps()).await.unwrap();
        let truncated = vec![sample_steps()[0].clone()];
        storage.save_state("wf", "run_1", &truncated).await.unwrap();

        let stored = storage.load_state("wf", "run_1").await.unwrap().unwrap();
        assert_eq!(stored.steps, truncated);
        // No leftover temp file.
        let run_dir = dir.path().join("wf").join("run_1");
        assert!(!run_dir.join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn filesystem_missing_run_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::new(dir.path());
        assert!(storage.load_state("wf", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn filesystem_lists_runs_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::new(dir.path());

        storage.save_state("wf", "20250101_000000_aa", &sample_steps()).await.unwrap();
        storage.save_state("wf", "20250301_000000_bb", &sample_steps()).await.unwrap();
        storage.save_state("wf", "20250201_000000_cc", &sample_steps()).await.unwrap();

        let runs = storage.list_runs("wf").await.unwrap();
        assert_eq!(
            runs,
            vec![
                "20250301_000000_bb".to_string(),
                "20250201_000000_cc".to_string(),
                "20250101_000000_aa".to_string(),
            ]
        );
        assert!(storage.list_runs("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn filesystem_lists_workflows() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::new(dir.path());
        assert!(storage.list_workflows().await.unwrap().is_empty());

        storage.save_state("beta", "r1", &sample_steps()).await.unwrap();
        storage.save_state("alpha", "r2", &sample_steps()).await.unwrap();
        assert_eq!(
            storage.list_workflows().await.unwrap(),
            vec!["alpha".to_string(), "beta".to_string()]
        );
    }

    #[tokio::test]
    async fn memory_roundtrip_and_listing() {
        let storage = MemoryStorage::new();
        storage.save_state("wf", "run_2", &sample_steps()).await.unwrap();
        storage.save_state("wf", "run_1", &sample_steps()).await.unwrap();

        let stored = storage.load_state("wf", "run_1").await.unwrap().unwrap();
        assert_eq!(stored.steps.len(), 2);
        assert!(storage.load_state("wf", "run_9").await.unwrap().is_none());

        assert_eq!(
            storage.list_runs("wf").await.unwrap(),
            vec!["run_2".to_string(), "run_1".to_string()]
        );
        assert_eq!(storage.list_workflows().await.unwrap(), vec!["wf".to_string()]);
    }
}
