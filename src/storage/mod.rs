//! Embedded SQLite store shared by the tracker, queue and job scheduler
//!
//! A single [`Database`] handle owns the connection and is passed to each
//! component as `Arc<Database>`. The file is opened in WAL mode so readers
//! never block the writer. Claim operations run inside
//! [`Database::with_transaction`], which takes the write lock up front
//! (`BEGIN IMMEDIATE`) so select-then-update is atomic even when several
//! handles share one file.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};

use crate::error::{Error, Result};

/// Current schema version, stored in `PRAGMA user_version`
pub const SCHEMA_VERSION: i32 = 1;

/// Default time a writer waits for a competing lock before failing
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

// ============================================================================
// Database Handle
// ============================================================================

/// Shared SQLite handle
///
/// Uses `Mutex` to ensure thread-safety for the SQLite connection.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the database file at `path`
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;

        // Enable WAL mode for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        db.migrate()?;

        tracing::info!(path = %path.display(), "SQLite store initialized");
        Ok(db)
    }

    /// Create in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        db.migrate()?;
        Ok(db)
    }

    /// Path of the backing file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::LockPoisoned("database connection"))
    }

    /// Run `f` against the connection (autocommit)
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside an IMMEDIATE transaction, committing on `Ok`
    ///
    /// Any error rolls the transaction back, leaving every row untouched.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Close the connection, surfacing any error from the final flush
    pub fn close(self) -> Result<()> {
        let conn = self
            .conn
            .into_inner()
            .map_err(|_| Error::LockPoisoned("database connection"))?;
        conn.close().map_err(|(_, e)| Error::Database(e))?;
        if let Some(path) = &self.path {
            tracing::debug!(path = %path.display(), "SQLite store closed");
        }
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version >= SCHEMA_VERSION {
            return Ok(());
        }

        conn.execute_batch(SCHEMA)?;
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
        tracing::debug!(from = version, to = SCHEMA_VERSION, "Schema migrated");
        Ok(())
    }
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS url_records (
        url TEXT PRIMARY KEY,
        content_hash TEXT NOT NULL,
        content_length INTEGER NOT NULL DEFAULT 0,
        first_seen_at TEXT NOT NULL,
        last_seen_at TEXT NOT NULL,
        scrape_count INTEGER NOT NULL DEFAULT 1,
        site TEXT NOT NULL,
        extraction_method TEXT,
        status TEXT NOT NULL DEFAULT 'success',
        quality_score INTEGER,
        tags TEXT,
        etag TEXT,
        last_modified TEXT,
        http_status INTEGER,
        failure_count INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_url_records_site ON url_records(site);
    CREATE INDEX IF NOT EXISTS idx_url_records_last_seen ON url_records(last_seen_at);
    CREATE INDEX IF NOT EXISTS idx_url_records_hash ON url_records(content_hash);
    CREATE INDEX IF NOT EXISTS idx_url_records_status ON url_records(status);
    CREATE INDEX IF NOT EXISTS idx_url_records_scrape_count ON url_records(scrape_count);

    CREATE TABLE IF NOT EXISTS queue_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        url TEXT NOT NULL UNIQUE,
        source TEXT NOT NULL,
        category TEXT NOT NULL DEFAULT 'general',
        base_priority INTEGER NOT NULL DEFAULT 5,
        priority_score REAL NOT NULL DEFAULT 0.0,
        discovered_at TEXT NOT NULL,
        scheduled_at TEXT,
        status TEXT NOT NULL DEFAULT 'queued',
        quality_estimate REAL NOT NULL DEFAULT 0.5,
        metadata TEXT NOT NULL DEFAULT '{}',
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_retry_at TEXT,
        failure_reason TEXT,
        scored_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_queue_status ON queue_entries(status);
    CREATE INDEX IF NOT EXISTS idx_queue_priority
        ON queue_entries(priority_score DESC, discovered_at ASC);
    CREATE INDEX IF NOT EXISTS idx_queue_source ON queue_entries(source);
    CREATE INDEX IF NOT EXISTS idx_queue_category ON queue_entries(category);
    CREATE INDEX IF NOT EXISTS idx_queue_scored_at ON queue_entries(scored_at);

    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        job_type TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 2,
        schedule_expression TEXT NOT NULL,
        config TEXT NOT NULL DEFAULT '{}',
        retry_policy TEXT NOT NULL,
        created_at TEXT NOT NULL,
        next_run_at TEXT NOT NULL,
        last_run_at TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        metadata TEXT NOT NULL DEFAULT '{}'
    );

    CREATE INDEX IF NOT EXISTS idx_jobs_priority ON jobs(priority);
    CREATE INDEX IF NOT EXISTS idx_jobs_next_run ON jobs(next_run_at);
    CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
"#;

// ============================================================================
// Timestamp Codec
// ============================================================================

/// Encode a timestamp as fixed-width RFC 3339 UTC text
///
/// Fixed width keeps lexical order equal to chronological order, so
/// timestamp columns can be compared and sorted directly in SQL.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a timestamp written by [`format_ts`]
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::invalid("timestamp", format!("'{s}': {e}")))
}

/// Read a required timestamp column inside a row mapper
pub(crate) fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a nullable timestamp column inside a row mapper
pub(crate) fn opt_ts_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::TempDir;

    #[test]
    fn test_in_memory_schema() {
        let db = Database::in_memory().unwrap();
        let tables: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                )?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(names)
            })
            .unwrap();
        assert_eq!(tables, vec!["jobs", "queue_entries", "url_records"]);
    }

    #[test]
    fn test_open_creates_parent_and_is_reopenable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("crawl.db");

        let db = Database::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO url_records (url, content_hash, first_seen_at, last_seen_at, site)
                 VALUES ('https://a.example/', 'h', 'x', 'x', 'a.example')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        db.close().unwrap();

        let db = Database::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap();
        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM url_records", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(db.path(), Some(path.as_path()));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::in_memory().unwrap();
        let result: Result<()> = db.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO url_records (url, content_hash, first_seen_at, last_seen_at, site)
                 VALUES ('https://a.example/', 'h', 'x', 'x', 'a.example')",
                [],
            )?;
            Err(Error::other("abort"))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM url_records", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_timestamp_codec_orders_lexically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 9, 23, 59, 59).unwrap();
        let late = early + ChronoDuration::milliseconds(1);
        let (a, b) = (format_ts(&early), format_ts(&late));
        assert!(a < b);
        assert_eq!(a.len(), b.len());
        assert_eq!(parse_ts(&a).unwrap(), early);
        assert!(parse_ts("yesterday").is_err());
    }
}
