//! Common test utilities

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use crawl_scheduler::storage::Database;

/// Fixed reference instant for time-dependent tests
#[allow(dead_code)]
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// Fresh in-memory database
#[allow(dead_code)]
pub fn memory_db() -> Arc<Database> {
    Arc::new(Database::in_memory().expect("in-memory database"))
}

/// Database file under `dir`, opened with a generous busy timeout
#[allow(dead_code)]
pub fn file_db(dir: &Path) -> Arc<Database> {
    Arc::new(Database::open(dir.join("crawl.db"), Duration::from_secs(10)).expect("database file"))
}
