// 📍 Checkpoint Store - last processed revision
// Read once at run start, written once after a fully successful run

use crate::db::{open_database, setup_database};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::warn;

pub const KEY_LAST_REVISION: &str = "last_revision";
pub const KEY_LAST_RUN: &str = "last_run";
/// Older state blobs stored the revision under this key
pub const KEY_LEGACY_REVISION: &str = "last_commit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub last_revision: Option<String>,
    pub last_run: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(revision: impl Into<String>, at: DateTime<Utc>) -> Self {
        Checkpoint {
            last_revision: Some(revision.into()),
            last_run: Some(at),
        }
    }

    pub fn to_state(&self) -> Map<String, Value> {
        let mut state = Map::new();
        if let Some(revision) = &self.last_revision {
            state.insert(KEY_LAST_REVISION.to_string(), Value::String(revision.clone()));
        }
        if let Some(at) = &self.last_run {
            state.insert(KEY_LAST_RUN.to_string(), Value::String(at.to_rfc3339()));
        }
        state
    }

    pub fn from_state(state: &Map<String, Value>) -> Self {
        let last_revision = state
            .get(KEY_LAST_REVISION)
            .or_else(|| state.get(KEY_LEGACY_REVISION))
            .and_then(Value::as_str)
            .filter(|rev| !rev.trim().is_empty())
            .map(str::to_string);

        let last_run = match state.get(KEY_LAST_RUN).and_then(Value::as_str) {
            Some(raw) => match DateTime::parse_from_rfc3339(raw) {
                Ok(at) => Some(at.with_timezone(&Utc)),
                Err(e) => {
                    warn!("Ignoring unparseable last_run '{}': {}", raw, e);
                    None
                }
            },
            None => None,
        };

        Checkpoint {
            last_revision,
            last_run,
        }
    }
}

// ============================================================================
// STATE STORAGE
// ============================================================================

/// Opaque key/value state blob kept on behalf of the connector
pub trait StateStorage {
    fn get(&self) -> Result<Option<Map<String, Value>>>;

    fn set(&mut self, state: Map<String, Value>) -> Result<()>;
}

/// In-process state, for tests and dry runs
#[derive(Debug, Default, Clone)]
pub struct MemoryStateStorage {
    state: Option<Map<String, Value>>,
}

impl MemoryStateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: Map<String, Value>) -> Self {
        MemoryStateStorage { state: Some(state) }
    }

    pub fn snapshot(&self) -> Option<Map<String, Value>> {
        self.state.clone()
    }
}

impl StateStorage for MemoryStateStorage {
    fn get(&self) -> Result<Option<Map<String, Value>>> {
        Ok(self.state.clone())
    }

    fn set(&mut self, state: Map<String, Value>) -> Result<()> {
        self.state = Some(state);
        Ok(())
    }
}

/// State row in `connector_state`, keyed by connector name
pub struct SqliteStateStorage {
    conn: Connection,
    connector: String,
}

impl SqliteStateStorage {
    pub fn new(conn: Connection, connector: &str) -> Result<Self> {
        setup_database(&conn)?;
        Ok(SqliteStateStorage {
            conn,
            connector: connector.to_string(),
        })
    }

    pub fn open(path: &Path, connector: &str) -> Result<Self> {
        Ok(SqliteStateStorage {
            conn: open_database(path)?,
            connector: connector.to_string(),
        })
    }
}

impl StateStorage for SqliteStateStorage {
    fn get(&self) -> Result<Option<Map<String, Value>>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM connector_state WHERE connector = ?1",
                [&self.connector],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(json) => {
                let state = serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt state for connector {}", self.connector))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    fn set(&mut self, state: Map<String, Value>) -> Result<()> {
        let json = serde_json::to_string(&state)?;
        self.conn.execute(
            "INSERT INTO connector_state (connector, state, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(connector) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
            params![self.connector, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

// ============================================================================
// CHECKPOINT STORE
// ============================================================================

pub struct CheckpointStore<T: StateStorage> {
    storage: T,
}

impl<T: StateStorage> CheckpointStore<T> {
    pub fn new(storage: T) -> Self {
        CheckpointStore { storage }
    }

    /// None on first-ever run (or when no revision was ever recorded)
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        let state = self.storage.get().context("Failed to read connector state")?;
        Ok(state
            .map(|s| Checkpoint::from_state(&s))
            .filter(|cp| cp.last_revision.is_some()))
    }

    /// Merges into the existing blob so unrelated keys survive
    pub fn save(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let mut state = self.storage.get()?.unwrap_or_default();
        state.remove(KEY_LEGACY_REVISION);
        state.extend(checkpoint.to_state());
        self.storage
            .set(state)
            .context("Failed to write connector state")
    }

    pub fn storage(&self) -> &T {
        &self.storage
    }
}
