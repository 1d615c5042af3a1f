//! Durable skill storage using rusqlite (cross-platform)
//!
//! One row per skill: metadata columns, the source code and timestamps.
//! Uses rusqlite with bundled SQLite for Windows/macOS/Linux support.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{Result, SkillError};
use crate::registry::{InputSpec, SkillMetadata, SkillRuntime};

/// Current schema version - increment when making breaking changes
const SCHEMA_VERSION: i32 = 1;

/// A persisted skill row
#[derive(Debug, Clone)]
pub struct StoredSkill {
    pub metadata: SkillMetadata,
    pub code: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Key/value persistence of `name -> (metadata, code)`
#[derive(Clone)]
pub struct SkillStore {
    conn: Arc<Mutex<Connection>>,
}

impl SkillStore {
    /// Open (or create) the skill database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SkillError::Storage(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened skill store");
        Self::with_connection(conn)
    }

    /// Volatile store, used by tests and ephemeral runs
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SkillError::Storage("skill store lock poisoned".to_string()))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )?;

        if current_version < 1 {
            Self::migrate_v1(&conn)?;
        }
        debug_assert!(current_version <= SCHEMA_VERSION);

        Ok(())
    }

    /// Migration v1: skills table
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Running skill store migration v1");

        conn.execute(
            "CREATE TABLE IF NOT EXISTS skills (
                name TEXT PRIMARY KEY,
                description TEXT NOT NULL DEFAULT '',
                version TEXT NOT NULL,
                inputs TEXT NOT NULL,
                runtime TEXT NOT NULL,
                code TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        conn.execute("INSERT INTO _migrations (version) VALUES (1)", [])?;
        Ok(())
    }

    /// Insert or replace a skill, keeping its original `created_at`
    pub fn save(&self, metadata: &SkillMetadata, code: &str) -> Result<()> {
        let inputs = serde_json::to_string(&metadata.inputs)
            .map_err(|e| SkillError::Storage(e.to_string()))?;
        let runtime = serde_json::to_string(&metadata.runtime)
            .map_err(|e| SkillError::Storage(e.to_string()))?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO skills (name, description, version, inputs, runtime, code, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
             ON CONFLICT(name) DO UPDATE SET
                description = excluded.description,
                version = excluded.version,
                inputs = excluded.inputs,
                runtime = excluded.runtime,
                code = excluded.code,
                updated_at = datetime('now')",
            params![
                metadata.name,
                metadata.description,
                metadata.version,
                inputs,
                runtime,
                code
            ],
        )?;
        Ok(())
    }

    /// Delete a skill row; returns whether a row existed
    pub fn delete(&self, name: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM skills WHERE name = ?1", params![name])?;
        Ok(rows > 0)
    }

    pub fn get(&self, name: &str) -> Result<Option<StoredSkill>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT name, description, version, inputs, runtime, code, created_at, updated_at
                 FROM skills WHERE name = ?1",
                params![name],
                Self::read_row,
            )
            .optional()?;
        row.map(Self::decode).transpose()
    }

    /// Every persisted skill. Rows whose metadata no longer decodes are
    /// returned as errors so the caller can skip them individually.
    pub fn load_all(&self) -> Result<Vec<Result<StoredSkill>>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT name, description, version, inputs, runtime, code, created_at, updated_at
             FROM skills ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], Self::read_row)?
            .map(|row| row.map_err(SkillError::from).and_then(Self::decode))
            .collect();
        Ok(rows)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM skills", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
        Ok(RawRow {
            name: row.get(0)?,
            description: row.get(1)?,
            version: row.get(2)?,
            inputs: row.get(3)?,
            runtime: row.get(4)?,
            code: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn decode(raw: RawRow) -> Result<StoredSkill> {
        let inputs: InputSpec = serde_json::from_str(&raw.inputs).map_err(|e| {
            SkillError::Storage(format!("skill '{}' has corrupt inputs: {}", raw.name, e))
        })?;
        let runtime: SkillRuntime = serde_json::from_str(&raw.runtime).map_err(|e| {
            SkillError::Storage(format!("skill '{}' has corrupt runtime: {}", raw.name, e))
        })?;
        Ok(StoredSkill {
            metadata: SkillMetadata {
                name: raw.name,
                description: raw.description,
                version: raw.version,
                inputs,
                runtime,
            },
            code: raw.code,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        })
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.lock()?.execute(sql, [])?;
        Ok(())
    }
}

struct RawRow {
    name: String,
    description: String,
    version: String,
    inputs: String,
    runtime: String,
    code: String,
    created_at: String,
    updated_at: String,
}
