// 📮 Sink - downstream knowledge store boundary
// Accepts bundles and tracks one unit of work per run

use crate::db::{open_database, record_event, setup_database, SyncEvent};
use crate::dispatch::Bundle;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info, warn};

// ============================================================================
// WORK TRACKING
// ============================================================================

/// Handle for the unit of work a run reports against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkHandle {
    pub id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
}

impl WorkHandle {
    pub fn new(name: &str) -> Self {
        WorkHandle {
            id: format!("work_{}", uuid::Uuid::new_v4()),
            name: name.to_string(),
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkStatus {
    Running,
    Completed,
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Running => "running",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(WorkStatus::Running),
            "completed" => Some(WorkStatus::Completed),
            "failed" => Some(WorkStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRecord {
    pub work_id: String,
    pub name: String,
    pub status: WorkStatus,
    pub message: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

// ============================================================================
// SINK TRAIT
// ============================================================================

/// Knowledge-store client as seen by the runner
///
/// `send_bundle` returning `Ok` means "accepted for delivery"; ingestion on the
/// far side may still be in progress.
pub trait Sink {
    fn begin_work(&mut self, name: &str) -> Result<WorkHandle>;

    fn send_bundle(&mut self, bundle: &Bundle) -> Result<()>;

    fn complete_work(&mut self, work: &WorkHandle, message: &str) -> Result<()>;

    fn fail_work(&mut self, work: &WorkHandle, message: &str) -> Result<()>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn begin_work(&mut self, name: &str) -> Result<WorkHandle> {
        (**self).begin_work(name)
    }

    fn send_bundle(&mut self, bundle: &Bundle) -> Result<()> {
        (**self).send_bundle(bundle)
    }

    fn complete_work(&mut self, work: &WorkHandle, message: &str) -> Result<()> {
        (**self).complete_work(work, message)
    }

    fn fail_work(&mut self, work: &WorkHandle, message: &str) -> Result<()> {
        (**self).fail_work(work, message)
    }
}

// ============================================================================
// SPOOL SINK (SQLite)
// ============================================================================

/// Stores accepted bundles and work records in SQLite for a downstream importer
///
/// Bundles are keyed by a digest of their objects, so re-sending an identical
/// chunk is accepted without storing it twice.
pub struct SpoolSink {
    conn: Connection,
    current_work: Option<String>,
}

impl SpoolSink {
    pub fn new(conn: Connection) -> Result<Self> {
        setup_database(&conn)?;
        Ok(SpoolSink {
            conn,
            current_work: None,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_database(path)?;
        Ok(SpoolSink {
            conn,
            current_work: None,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// SHA-256 over the ordered object ids
    ///
    /// Ids are content-derived while timestamps change per run, so a chunk
    /// re-delivered by a later run maps to the same digest.
    pub fn content_digest(bundle: &Bundle) -> String {
        let mut hasher = Sha256::new();
        for object in &bundle.objects {
            hasher.update(object.id().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn get_work(&self, work_id: &str) -> Result<Option<WorkRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT work_id, name, status, message, started_at, finished_at
                 FROM works WHERE work_id = ?1",
                [work_id],
                |row| {
                    let status: String = row.get(2)?;
                    Ok(WorkRecord {
                        work_id: row.get(0)?,
                        name: row.get(1)?,
                        status: WorkStatus::parse(&status).unwrap_or(WorkStatus::Running),
                        message: row.get(3)?,
                        started_at: row.get(4)?,
                        finished_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn bundle_count(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM bundles", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn spooled_object_count(&self) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(object_count), 0) FROM bundles",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn finish_work(&mut self, work: &WorkHandle, status: WorkStatus, message: &str) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE works SET status = ?1, message = ?2, finished_at = ?3 WHERE work_id = ?4",
            params![status.as_str(), message, Utc::now().to_rfc3339(), work.id],
        )?;
        if updated == 0 {
            anyhow::bail!("unknown work: {}", work.id);
        }

        let event = SyncEvent::new(
            &format!("work_{}", status.as_str()),
            &work.id,
            Some(&work.id),
            serde_json::json!({ "message": message }),
        );
        record_event(&self.conn, &event)?;

        if self.current_work.as_deref() == Some(work.id.as_str()) {
            self.current_work = None;
        }
        Ok(())
    }
}

impl Sink for SpoolSink {
    fn begin_work(&mut self, name: &str) -> Result<WorkHandle> {
        let work = WorkHandle::new(name);
        self.conn
            .execute(
                "INSERT INTO works (work_id, name, status, started_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    work.id,
                    work.name,
                    WorkStatus::Running.as_str(),
                    work.started_at.to_rfc3339()
                ],
            )
            .context("Failed to record work")?;
        self.current_work = Some(work.id.clone());
        debug!(work_id = %work.id, "Work started: {}", name);
        Ok(work)
    }

    fn send_bundle(&mut self, bundle: &Bundle) -> Result<()> {
        let digest = Self::content_digest(bundle);
        let payload = bundle.to_json()?;

        let result = self.conn.execute(
            "INSERT INTO bundles (content_digest, bundle_id, work_id, object_count, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                digest,
                bundle.id,
                self.current_work,
                bundle.len() as i64,
                payload
            ],
        );

        let event_type = match result {
            Ok(_) => "bundle_accepted",
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                info!(digest = %digest, "Identical bundle already spooled; accepting as duplicate");
                "bundle_duplicate"
            }
            Err(e) => return Err(e).context("Failed to spool bundle"),
        };

        let event = SyncEvent::new(
            event_type,
            &digest,
            self.current_work.as_deref(),
            serde_json::json!({ "bundle_id": bundle.id, "objects": bundle.len() }),
        );
        // The bundle is already spooled; a journal miss must not fail the send
        if let Err(e) = record_event(&self.conn, &event) {
            warn!(digest = %digest, "{:#}", e);
        }

        Ok(())
    }

    fn complete_work(&mut self, work: &WorkHandle, message: &str) -> Result<()> {
        self.finish_work(work, WorkStatus::Completed, message)
    }

    fn fail_work(&mut self, work: &WorkHandle, message: &str) -> Result<()> {
        self.finish_work(work, WorkStatus::Failed, message)
    }
}
