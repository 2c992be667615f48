//! Per-key status ledger for resumable runs.
//!
//! Records the outcome of every key a run touches. A later run skips keys
//! already recorded as done for the same source fingerprint.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use ferrysync_engine::{TransferAction, TransferReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Complete,
    Skipped,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Complete => "complete",
            SyncStatus::Skipped => "skipped",
            SyncStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "complete" => Some(SyncStatus::Complete),
            "skipped" => Some(SyncStatus::Skipped),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerRow {
    pub key: String,
    pub status: SyncStatus,
    pub source_fingerprint: Option<String>,
    pub decision: Option<String>,
    pub bytes: u64,
    pub error: Option<String>,
    pub updated_at: String,
}

pub struct StatusLedger {
    conn: Mutex<Connection>,
}

// ── SQLite State ──────────────────────────────────────────────────────────────

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS sync_status (
            key                 TEXT PRIMARY KEY,
            status              TEXT NOT NULL,
            source_fingerprint  TEXT,
            decision            TEXT,
            bytes               INTEGER NOT NULL DEFAULT 0,
            error               TEXT,
            updated_at          TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sync_status ON sync_status (status);
    ",
    )
    .context("Failed to create sync_status table")?;
    Ok(())
}

impl StatusLedger {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open ledger {}", path.display()))?;
        init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory ledger")?;
        init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True if `key` already reached the target with this source content.
    pub fn is_current(&self, key: &str, source_fingerprint: &str) -> anyhow::Result<bool> {
        let found: Option<i64> = self
            .lock()
            .query_row(
                "SELECT 1 FROM sync_status
                 WHERE key = ?1 AND source_fingerprint = ?2 AND status IN ('complete', 'skipped')",
                params![key, source_fingerprint],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query sync_status")?;
        Ok(found.is_some())
    }

    pub fn record_success(&self, report: &TransferReport) -> anyhow::Result<()> {
        let status = match report.action {
            TransferAction::Unchanged | TransferAction::Vanished => SyncStatus::Skipped,
            _ => SyncStatus::Complete,
        };
        self.upsert(
            &report.key,
            status,
            report.source_fingerprint.as_deref(),
            Some(report.action.as_str()),
            report.bytes,
            None,
        )
    }

    pub fn record_failure(&self, key: &str, error: &str) -> anyhow::Result<()> {
        self.upsert(key, SyncStatus::Failed, None, None, 0, Some(error))
    }

    fn upsert(
        &self,
        key: &str,
        status: SyncStatus,
        source_fingerprint: Option<&str>,
        decision: Option<&str>,
        bytes: u64,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO sync_status
                 (key, status, source_fingerprint, decision, bytes, error, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    key,
                    status.as_str(),
                    source_fingerprint,
                    decision,
                    bytes as i64,
                    error,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to record sync status")?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> anyhow::Result<Option<LedgerRow>> {
        self.lock()
            .query_row(
                "SELECT key, status, source_fingerprint, decision, bytes, error, updated_at
                 FROM sync_status WHERE key = ?1",
                params![key],
                |row| {
                    let status: String = row.get(1)?;
                    Ok(LedgerRow {
                        key: row.get(0)?,
                        status: SyncStatus::parse(&status).unwrap_or(SyncStatus::Failed),
                        source_fingerprint: row.get(2)?,
                        decision: row.get(3)?,
                        bytes: row.get::<_, i64>(4)? as u64,
                        error: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to query sync_status")
    }

    /// Number of keys recorded with `status`.
    pub fn count(&self, status: SyncStatus) -> anyhow::Result<u64> {
        let n: i64 = self
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM sync_status WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count sync_status")?;
        Ok(n as u64)
    }
}
