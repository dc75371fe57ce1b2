// 🗄️ Persistence - SQLite + WAL
// Connector state, work tracking, spooled bundles and the audit trail share one database file

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One entry in the sync journal
///
/// `subject` names what the entry is about: a work id for run lifecycle
/// entries, a bundle content digest for spool entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub event_id: String,
    pub recorded_at: DateTime<Utc>,
    pub kind: String,
    pub subject: String,
    /// Run the entry belongs to, when one was active
    pub work_id: Option<String>,
    pub detail: serde_json::Value,
}

impl SyncEvent {
    pub fn new(kind: &str, subject: &str, work_id: Option<&str>, detail: serde_json::Value) -> Self {
        SyncEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            recorded_at: Utc::now(),
            kind: kind.to_string(),
            subject: subject.to_string(),
            work_id: work_id.map(str::to_string),
            detail,
        }
    }
}

/// Open (or create) the database file and make sure the schema exists
pub fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }
    }

    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database: {}", path.display()))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Connector State (one JSON blob per connector)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS connector_state (
            connector TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Works (one row per run, tracked by the sink)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS works (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            work_id TEXT UNIQUE NOT NULL,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            message TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Bundles (accepted chunks, deduplicated by content digest)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS bundles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_digest TEXT UNIQUE NOT NULL,
            bundle_id TEXT NOT NULL,
            work_id TEXT,
            object_count INTEGER NOT NULL,
            payload TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Sync journal (append-only)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sync_events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            recorded_at TEXT NOT NULL,
            kind TEXT NOT NULL,
            subject TEXT NOT NULL,
            work_id TEXT,
            detail TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bundles_work ON bundles(work_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_works_status ON works(status)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sync_events_subject ON sync_events(subject)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sync_events_work ON sync_events(work_id)",
        [],
    )?;

    Ok(())
}

/// Append an entry to the sync journal
pub fn record_event(conn: &Connection, event: &SyncEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_events (event_id, recorded_at, kind, subject, work_id, detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.event_id,
            event.recorded_at.to_rfc3339(),
            event.kind,
            event.subject,
            event.work_id,
            event.detail.to_string(),
        ],
    )
    .with_context(|| format!("Failed to journal {} for {}", event.kind, event.subject))?;
    Ok(())
}

/// Journal entries about `subject`, oldest first
pub fn events_for_subject(conn: &Connection, subject: &str) -> Result<Vec<SyncEvent>> {
    query_events(conn, "subject = ?1", subject)
}

/// Journal entries recorded while `work_id` was running, oldest first
pub fn events_for_work(conn: &Connection, work_id: &str) -> Result<Vec<SyncEvent>> {
    query_events(conn, "work_id = ?1", work_id)
}

fn query_events(conn: &Connection, filter: &str, value: &str) -> Result<Vec<SyncEvent>> {
    let sql = format!(
        "SELECT event_id, recorded_at, kind, subject, work_id, detail
         FROM sync_events WHERE {} ORDER BY seq",
        filter
    );
    let mut stmt = conn.prepare(&sql)?;

    let rows = stmt
        .query_map(params![value], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(event_id, recorded_at, kind, subject, work_id, detail)| -> Result<SyncEvent> {
            Ok(SyncEvent {
                recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
                    .with_context(|| format!("Bad timestamp on journal entry {}", event_id))?
                    .with_timezone(&Utc),
                detail: serde_json::from_str(&detail)
                    .with_context(|| format!("Bad detail on journal entry {}", event_id))?,
                event_id,
                kind,
                subject,
                work_id,
            })
        })
        .collect()
}
