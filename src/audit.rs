//! Append-only audit store for deletion records.
//!
//! Backed by a single SQLite file (via `rusqlite`, bundled) opened with
//! synchronous writes so every `append` is durable before it returns.
//! Records are never rewritten.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::AppError;

/// The mode a deletion (or dry-run record) was produced under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Age,
    DiskUsage,
    Stack,
    DryRun,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Age => "AGE",
            Mode::DiskUsage => "DISK_USAGE",
            Mode::Stack => "STACK",
            Mode::DryRun => "DRY_RUN",
        }
    }

    /// Encoding used by the `storagesage_cleanup_last_mode` gauge.
    pub fn gauge_value(self) -> u8 {
        match self {
            Mode::Age => 0,
            Mode::DiskUsage => 1,
            Mode::Stack => 2,
            Mode::DryRun => 3,
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "AGE" => Some(Mode::Age),
            "DISK_USAGE" => Some(Mode::DiskUsage),
            "STACK" => Some(Mode::Stack),
            "DRY_RUN" => Some(Mode::DryRun),
            _ => None,
        }
    }
}

/// A durable audit row. Immutable after insert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletionRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub path: String,
    pub size: u64,
    pub mode: Mode,
    pub reason: String,
    pub age_days: u64,
}

/// Totals returned by `Stats`.
#[derive(Debug, Clone, Serialize)]
pub struct AuditStats {
    pub count: u64,
    pub bytes_freed: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Append-only, single-writer, multi-reader store of `DeletionRecord`s.
pub struct AuditStore {
    conn: Connection,
}

impl AuditStore {
    /// Open (creating if absent) the audit store at `path`. If the file
    /// exists but fails an integrity check, returns `AppError::AuditIo`
    /// unless `reinitialize` is set, in which case the file is recreated
    /// from scratch.
    pub fn open(path: &Path, reinitialize: bool) -> Result<Self, AppError> {
        if reinitialize && path.exists() {
            std::fs::remove_file(path)
                .map_err(|e| AppError::AuditIo(format!("reinitializing {}: {e}", path.display())))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::AuditIo(format!("opening {}: {e}", path.display())))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| AppError::AuditIo(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|e| AppError::AuditIo(e.to_string()))?;

        if !reinitialize {
            let check: String = conn
                .query_row("PRAGMA integrity_check", [], |row| row.get(0))
                .map_err(|e| {
                    AppError::AuditIo(format!("corruption check failed on {}: {e}", path.display()))
                })?;
            if check != "ok" {
                return Err(AppError::AuditIo(format!(
                    "audit store {} is corrupt: {check}",
                    path.display()
                )));
            }
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS deletions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                path TEXT NOT NULL,
                size INTEGER NOT NULL,
                mode TEXT NOT NULL,
                reason TEXT NOT NULL,
                age_days INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_deletions_ts ON deletions(ts);
            CREATE INDEX IF NOT EXISTS idx_deletions_path ON deletions(path);",
        )
        .map_err(|e| AppError::AuditIo(format!("creating schema: {e}")))?;

        Ok(AuditStore { conn })
    }

    /// Insert a deletion record. Durable before this returns (WAL +
    /// synchronous=FULL commit).
    pub fn append(
        &self,
        ts: DateTime<Utc>,
        path: &str,
        size: u64,
        mode: Mode,
        reason: &str,
        age_days: u64,
    ) -> Result<i64, AppError> {
        self.conn
            .execute(
                "INSERT INTO deletions (ts, path, size, mode, reason, age_days)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    ts.to_rfc3339(),
                    path,
                    size as i64,
                    mode.as_str(),
                    reason,
                    age_days as i64
                ],
            )
            .map_err(|e| AppError::AuditIo(format!("append: {e}")))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Return the most recent `n` records, newest first.
    pub fn recent(&self, n: u64) -> Result<Vec<DeletionRecord>, AppError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, ts, path, size, mode, reason, age_days
                 FROM deletions ORDER BY id DESC LIMIT ?1",
            )
            .map_err(|e| AppError::AuditIo(e.to_string()))?;

        let rows = stmt
            .query_map(params![n as i64], |row| {
                let ts_text: String = row.get(1)?;
                let mode_text: String = row.get(4)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    ts_text,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    mode_text,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })
            .map_err(|e| AppError::AuditIo(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            let (id, ts_text, path, size, mode_text, reason, age_days) =
                row.map_err(|e| AppError::AuditIo(e.to_string()))?;
            let ts = DateTime::parse_from_rfc3339(&ts_text)
                .map_err(|e| AppError::AuditIo(format!("corrupt ts: {e}")))?
                .with_timezone(&Utc);
            let mode = Mode::from_str(&mode_text)
                .ok_or_else(|| AppError::AuditIo(format!("corrupt mode: {mode_text}")))?;
            out.push(DeletionRecord {
                id,
                ts,
                path,
                size: size as u64,
                mode,
                reason,
                age_days: age_days as u64,
            });
        }
        Ok(out)
    }

    /// Aggregate statistics over the whole store.
    pub fn stats(&self) -> Result<AuditStats, AppError> {
        let (count, bytes_freed, oldest, newest): (i64, Option<i64>, Option<String>, Option<String>) = self
            .conn
            .query_row(
                "SELECT COUNT(*), SUM(size), MIN(ts), MAX(ts) FROM deletions",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .map_err(|e| AppError::AuditIo(e.to_string()))?;

        let parse = |s: Option<String>| -> Result<Option<DateTime<Utc>>, AppError> {
            s.map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| AppError::AuditIo(format!("corrupt ts: {e}")))
            })
            .transpose()
        };

        Ok(AuditStats {
            count: count.max(0) as u64,
            bytes_freed: bytes_freed.unwrap_or(0).max(0) as u64,
            oldest: parse(oldest)?,
            newest: parse(newest)?,
        })
    }

    /// Whether a row with this exact path and timestamp already exists.
    /// Not part of the public audit contract; used only by tests to check
    /// for accidental double-writes.
    #[cfg(test)]
    fn find(&self, path: &str) -> Result<Option<DeletionRecord>, AppError> {
        self.conn
            .query_row(
                "SELECT id, ts, path, size, mode, reason, age_days FROM deletions WHERE path = ?1",
                params![path],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| AppError::AuditIo(e.to_string()))
            .map(|opt| {
                opt.map(|(id, ts_text, path, size, mode_text, reason, age_days)| DeletionRecord {
                    id,
                    ts: DateTime::parse_from_rfc3339(&ts_text).unwrap().with_timezone(&Utc),
                    path,
                    size: size as u64,
                    mode: Mode::from_str(&mode_text).unwrap(),
                    reason,
                    age_days: age_days as u64,
                })
            })
    }

    /// Flush and release resources. Idempotent: dropping an already-closed
    /// store is a no-op.
    pub fn close(self) {
        let _ = self.conn.pragma_update(None, "wal_checkpoint", "TRUNCATE");
    }
}

impl Drop for AuditStore {
    /// Checkpoint the WAL so committed records are flushed to the main
    /// database file even when the store is dropped implicitly (e.g. via
    /// the `Arc<Mutex<_>>` held by `AppState` on daemon shutdown) rather
    /// than through an explicit `close()` call.
    fn drop(&mut self) {
        let _ = self.conn.pragma_update(None, "wal_checkpoint", "TRUNCATE");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_recent_round_trip() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("audit.db");
        let store = AuditStore::open(&db_path, false).unwrap();

        let ts = Utc::now();
        store.append(ts, "/data/a.log", 1024, Mode::Age, "age-threshold", 10).unwrap();
        store.append(ts, "/data/b.log", 2048, Mode::Stack, "stack-emergency", 4).unwrap();

        let recent = store.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        // reverse chronological = most recently inserted (highest id) first
        assert_eq!(recent[0].path, "/data/b.log");
        assert_eq!(recent[0].mode, Mode::Stack);
        assert_eq!(recent[1].path, "/data/a.log");
        assert_eq!(recent[1].size, 1024);
    }

    #[test]
    fn stats_aggregate_correctly() {
        let dir = tempdir().unwrap();
        let store = AuditStore::open(&dir.path().join("audit.db"), false).unwrap();
        let ts = Utc::now();
        store.append(ts, "/a", 100, Mode::Age, "r", 1).unwrap();
        store.append(ts, "/b", 200, Mode::DryRun, "r", 1).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.bytes_freed, 300);
        assert!(stats.oldest.is_some());
        assert!(stats.newest.is_some());
    }

    #[test]
    fn reopen_preserves_records() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("audit.db");
        {
            let store = AuditStore::open(&db_path, false).unwrap();
            store.append(Utc::now(), "/x", 1, Mode::Age, "r", 1).unwrap();
            store.close();
        }
        let store = AuditStore::open(&db_path, false).unwrap();
        assert_eq!(store.stats().unwrap().count, 1);
        assert!(store.find("/x").unwrap().is_some());
    }
}
