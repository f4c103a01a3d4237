//! SQLite checkpoint store.
//!
//! One serialized pipeline-state record per correlation id, written
//! after every stage so any stage can be re-attempted from the previous
//! checkpoint. WAL mode for concurrent runner tasks; a schema-version
//! table guards future migrations.

use anyhow::{Context, Result};
use chrono::Local;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::pipeline::state::PipelineState;

/// Result of a checkpoint lookup.
#[derive(Debug)]
pub enum CheckpointLoad {
    /// No record for this correlation id.
    Missing,
    /// A record exists but no longer parses (missing required fields
    /// after a schema change). Callers start fresh.
    Rejected { reason: String },
    Loaded(Box<PipelineState>),
}

pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

impl CheckpointStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open checkpoint db {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// In-memory store for tests and offline runs.
    pub fn new_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("checkpoint connection poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                correlation_id TEXT PRIMARY KEY,
                stage TEXT NOT NULL,
                phase TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_checkpoints_updated
            ON checkpoints(updated_at DESC);

            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);
            "#,
        )?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.conn.lock().expect("checkpoint connection poisoned");
        let version =
            conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
        Ok(version)
    }

    /// Upsert the state record for its correlation id.
    pub fn save(&self, state: &PipelineState) -> Result<()> {
        let serialized = serde_json::to_string(state).context("failed to serialize state")?;
        let conn = self.conn.lock().expect("checkpoint connection poisoned");
        conn.execute(
            r#"
            INSERT INTO checkpoints (correlation_id, stage, phase, state, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(correlation_id) DO UPDATE SET
                stage = excluded.stage,
                phase = excluded.phase,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
            params![
                state.correlation_id,
                state.stage.as_str(),
                state.phase.as_str(),
                serialized,
                Local::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load(&self, correlation_id: &str) -> Result<CheckpointLoad> {
        let conn = self.conn.lock().expect("checkpoint connection poisoned");
        let raw: Option<String> = conn
            .query_row(
                "SELECT state FROM checkpoints WHERE correlation_id = ?1",
                params![correlation_id],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            None => Ok(CheckpointLoad::Missing),
            Some(serialized) => match serde_json::from_str::<PipelineState>(&serialized) {
                Ok(state) => Ok(CheckpointLoad::Loaded(Box::new(state))),
                Err(e) => Ok(CheckpointLoad::Rejected {
                    reason: e.to_string(),
                }),
            },
        }
    }

    pub fn delete(&self, correlation_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("checkpoint connection poisoned");
        conn.execute(
            "DELETE FROM checkpoints WHERE correlation_id = ?1",
            params![correlation_id],
        )?;
        Ok(())
    }

    /// Correlation ids with a stored checkpoint, most recent first.
    pub fn list_ids(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("checkpoint connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT correlation_id FROM checkpoints ORDER BY updated_at DESC LIMIT ?1",
        )?;
        let ids = stmt
            .query_map(params![limit], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}
