//! Single-file embedded SQL storage backend.
//!
//! Journals live in one `workflow_states` table keyed by
//! `(workflow_id, run_id)`, with the serialized journal as a JSON column and
//! an `updated_at` timestamp. Saves are transactional upserts, which also
//! serializes concurrent writers to the same run.

use crate::error::StorageError;
use crate::storage::{StorageBackend, StoredRun};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database { message: e.to_string() }
    }
}

/// SQLite-backed storage over a single database file.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Opens (creating if missing) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be initialized.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::init(&pool).await?;
        Ok(Self { pool })
    }

    /// Opens an in-memory database, for tests and ephemeral hosts.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        // One connection, or each pool checkout would see its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::init(&pool).await?;
        Ok(Self { pool })
    }

    async fn init(pool: &SqlitePool) -> Result<(), StorageError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS workflow_states (
                workflow_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                state_json TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (workflow_id, run_id)
            )
            ",
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SqliteStorage {
    async fn save_state(
        &self,
        workflow_id: &str,
        run_id: &str,
        steps: &[Value],
    ) -> Result<(), StorageError> {
        let payload = StoredRun {
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            steps: steps.to_vec(),
        };
        let encoded = serde_json::to_string(&payload)
            .map_err(|e| StorageError::Serialization { message: e.to_string() })?;

        sqlx::query(
            r"
            INSERT INTO workflow_states (workflow_id, run_id, state_json, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (workflow_id, run_id)
            DO UPDATE SET state_json = excluded.state_json, updated_at = excluded.updated_at
            ",
        )
        .bind(workflow_id)
        .bind(run_id)
        .bind(encoded)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_state(
        &self,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<Option<StoredRun>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT state_json FROM workflow_states WHERE workflow_id = ?1 AND run_id = ?2",
        )
        .bind(workflow_id)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((encoded,)) => serde_json::from_str(&encoded)
                .map(Some)
                .map_err(|e| StorageError::Serialization { message: e.to_string() }),
            None => Ok(None),
        }
    }

    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT run_id FROM workflow_states WHERE workflow_id = ?1 ORDER BY run_id DESC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(run_id,)| run_id).collect())
    }

    async fn list_workflows(&self) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT workflow_id FROM workflow_states ORDER BY workflow_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(workflow_id,)| workflow_id).collect())
    }
}
