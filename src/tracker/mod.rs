//! URL tracking: the system of record for crawled URLs
//!
//! One `url_records` row per URL ever crawled, upserted on every recorded
//! crawl. [`UrlTracker::should_crawl`] answers whether a URL is due, with an
//! explicit reason for every decision.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::{format_ts, opt_ts_column, ts_column, Database};
use crate::utils::{domain_suffixes, site_of};

/// Upper bound on the failure backoff, in days
pub const MAX_FAILURE_BACKOFF_DAYS: i64 = 7;

// ============================================================================
// Core Types
// ============================================================================

/// Outcome of a crawl attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    Success,
    Failed,
    Partial,
}

impl CrawlStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStatus::Success => "success",
            CrawlStatus::Failed => "failed",
            CrawlStatus::Partial => "partial",
        }
    }
}

impl std::str::FromStr for CrawlStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(CrawlStatus::Success),
            "failed" => Ok(CrawlStatus::Failed),
            "partial" => Ok(CrawlStatus::Partial),
            other => Err(Error::invalid("crawl status", other)),
        }
    }
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored tracking record for one URL
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UrlRecord {
    pub url: String,
    pub content_hash: String,
    pub content_length: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub scrape_count: u32,
    pub site: String,
    pub extraction_method: Option<String>,
    pub status: CrawlStatus,
    pub quality_score: Option<u8>,
    pub tags: Vec<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub http_status: Option<u16>,
    /// Consecutive failed crawls, reset by any non-failed crawl
    pub failure_count: u32,
}

/// Everything known about one crawl attempt, as handed to [`UrlTracker::record_crawl`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlOutcome {
    pub url: String,
    pub content_hash: String,
    pub content_length: u64,
    /// Derived from the URL when absent
    pub site: Option<String>,
    pub extraction_method: Option<String>,
    pub status: CrawlStatus,
    pub quality_score: Option<u8>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub http_status: Option<u16>,
}

impl CrawlOutcome {
    pub fn success(url: impl Into<String>, content_hash: impl Into<String>, content_length: u64) -> Self {
        Self {
            url: url.into(),
            content_hash: content_hash.into(),
            content_length,
            site: None,
            extraction_method: None,
            status: CrawlStatus::Success,
            quality_score: None,
            tags: Vec::new(),
            etag: None,
            last_modified: None,
            http_status: Some(200),
        }
    }

    pub fn failed(url: impl Into<String>) -> Self {
        Self {
            status: CrawlStatus::Failed,
            http_status: None,
            ..Self::success(url, "", 0)
        }
    }

    pub fn with_status(mut self, status: CrawlStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality_score = Some(quality.min(100));
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.extraction_method = Some(method.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_last_modified(mut self, value: impl Into<String>) -> Self {
        self.last_modified = Some(value.into());
        self
    }

    pub fn with_http_status(mut self, code: u16) -> Self {
        self.http_status = Some(code);
        self
    }
}

/// Why [`UrlTracker::should_crawl`] decided the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrawlReason {
    /// Never crawled
    New,
    /// Last crawl failed and the backoff has elapsed
    RetryFailed,
    /// Last crawl failed and the backoff has not elapsed yet
    BackoffPending,
    /// Refresh interval elapsed
    RefreshDue,
    RecentlySeen,
}

impl CrawlReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::RetryFailed => "retry-failed",
            Self::BackoffPending => "backoff-pending",
            Self::RefreshDue => "refresh-due",
            Self::RecentlySeen => "recently-seen",
        }
    }
}

impl fmt::Display for CrawlReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed answer of [`UrlTracker::should_crawl`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CrawlDecision {
    pub crawl: bool,
    pub reason: CrawlReason,
    /// When the URL becomes (or became) due; `None` for new URLs
    pub due_at: Option<DateTime<Utc>>,
}

/// Per-site aggregate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteStats {
    pub site: String,
    pub total_urls: u64,
    pub total_crawls: u64,
    pub avg_crawls_per_url: f64,
    /// Distinct URLs / total crawl attempts
    pub unique_crawl_ratio: f64,
    pub last_activity: Option<DateTime<Utc>>,
    pub avg_quality: Option<f64>,
    pub success_count: u64,
    pub failed_count: u64,
}

/// A URL that has been re-crawled, with its observed crawl cadence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangingUrl {
    pub url: String,
    pub site: String,
    pub scrape_count: u32,
    pub days_per_change: f64,
    pub last_seen_at: DateTime<Utc>,
    pub quality_score: Option<u8>,
}

impl ChangingUrl {
    /// Observed changes per day, the input of refresh-interval adjustment
    pub fn changes_per_day(&self) -> f64 {
        if self.days_per_change <= 0.0 {
            f64::from(self.scrape_count)
        } else {
            1.0 / self.days_per_change
        }
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// SQLite-backed URL tracker
pub struct UrlTracker {
    db: Arc<Database>,
}

impl UrlTracker {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Decide whether `url` is due for a crawl
    ///
    /// `site_overrides` maps a site (host without `www.`, parent domains
    /// included) to its refresh interval in days.
    pub fn should_crawl(
        &self,
        url: &str,
        default_refresh_days: u32,
        site_overrides: &HashMap<String, u32>,
    ) -> Result<CrawlDecision> {
        self.should_crawl_at(url, default_refresh_days, site_overrides, Utc::now())
    }

    pub fn should_crawl_at(
        &self,
        url: &str,
        default_refresh_days: u32,
        site_overrides: &HashMap<String, u32>,
        now: DateTime<Utc>,
    ) -> Result<CrawlDecision> {
        let Some(record) = self.get_record(url)? else {
            tracing::debug!(url, "No tracking record, crawling");
            return Ok(CrawlDecision {
                crawl: true,
                reason: CrawlReason::New,
                due_at: None,
            });
        };

        if record.status == CrawlStatus::Failed {
            let attempts = i64::from(record.failure_count.max(1));
            let backoff_days = (attempts * attempts).min(MAX_FAILURE_BACKOFF_DAYS);
            let due_at = record.last_seen_at + Duration::days(backoff_days);
            let crawl = now >= due_at;
            tracing::debug!(url, attempts, backoff_days, crawl, "Failed URL backoff check");
            return Ok(CrawlDecision {
                crawl,
                reason: if crawl {
                    CrawlReason::RetryFailed
                } else {
                    CrawlReason::BackoffPending
                },
                due_at: Some(due_at),
            });
        }

        let refresh_days = lookup_override(&record.site, site_overrides)
            .or_else(|| lookup_override(&site_of(url), site_overrides))
            .unwrap_or(default_refresh_days);
        let due_at = record.last_seen_at + Duration::days(i64::from(refresh_days));
        let crawl = now >= due_at;

        Ok(CrawlDecision {
            crawl,
            reason: if crawl {
                CrawlReason::RefreshDue
            } else {
                CrawlReason::RecentlySeen
            },
            due_at: Some(due_at),
        })
    }

    /// Upsert the tracking record for one crawl attempt
    pub fn record_crawl(&self, outcome: &CrawlOutcome) -> Result<()> {
        self.record_crawl_at(outcome, Utc::now())
    }

    pub fn record_crawl_at(&self, outcome: &CrawlOutcome, now: DateTime<Utc>) -> Result<()> {
        if outcome.url.trim().is_empty() {
            return Err(Error::invalid("url", "empty"));
        }

        let site = outcome
            .site
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| site_of(&outcome.url));
        let tags = if outcome.tags.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&outcome.tags)?)
        };
        let initial_failures: u32 = u32::from(outcome.status == CrawlStatus::Failed);
        let now = format_ts(&now);

        self.db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO url_records (
                    url, content_hash, content_length, first_seen_at, last_seen_at,
                    scrape_count, site, extraction_method, status, quality_score,
                    tags, etag, last_modified, http_status, failure_count
                ) VALUES (?1, ?2, ?3, ?4, ?4, 1, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(url) DO UPDATE SET
                    content_hash = excluded.content_hash,
                    content_length = excluded.content_length,
                    last_seen_at = MAX(url_records.first_seen_at, excluded.last_seen_at),
                    scrape_count = url_records.scrape_count + 1,
                    site = excluded.site,
                    extraction_method = excluded.extraction_method,
                    status = excluded.status,
                    quality_score = excluded.quality_score,
                    tags = excluded.tags,
                    etag = excluded.etag,
                    last_modified = excluded.last_modified,
                    http_status = excluded.http_status,
                    failure_count = CASE
                        WHEN excluded.status = 'failed' THEN url_records.failure_count + 1
                        ELSE 0
                    END
                "#,
                params![
                    outcome.url,
                    outcome.content_hash,
                    outcome.content_length as i64,
                    now,
                    site,
                    outcome.extraction_method,
                    outcome.status.as_str(),
                    outcome.quality_score,
                    tags,
                    outcome.etag,
                    outcome.last_modified,
                    outcome.http_status,
                    initial_failures,
                ],
            )?;
            Ok(())
        })?;

        tracing::debug!(url = %outcome.url, status = %outcome.status, "Crawl recorded");
        Ok(())
    }

    /// `true` if the URL is unknown or its stored hash differs
    pub fn detect_content_change(&self, url: &str, new_hash: &str) -> Result<bool> {
        let stored: Option<String> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT content_hash FROM url_records WHERE url = ?1",
                    params![url],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        Ok(stored.map_or(true, |old| old != new_hash))
    }

    pub fn get_record(&self, url: &str) -> Result<Option<UrlRecord>> {
        self.db.with_conn(|conn| {
            let record = conn
                .query_row(
                    &format!("SELECT {RECORD_COLUMNS} FROM url_records WHERE url = ?1"),
                    params![url],
                    record_from_row,
                )
                .optional()?;
            Ok(record)
        })
    }

    /// Aggregates for one site, or for every site ordered by URL count
    pub fn site_stats(&self, site: Option<&str>) -> Result<Vec<SiteStats>> {
        let base = r#"
            SELECT
                site,
                COUNT(*),
                SUM(scrape_count),
                AVG(scrape_count),
                COUNT(*) * 1.0 / SUM(scrape_count),
                MAX(last_seen_at),
                AVG(quality_score),
                SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END)
            FROM url_records
        "#;

        self.db.with_conn(|conn| {
            let (sql, args): (String, Vec<String>) = match site {
                Some(s) => (
                    format!("{base} WHERE site = ?1 GROUP BY site"),
                    vec![s.to_string()],
                ),
                None => (
                    format!("{base} GROUP BY site ORDER BY COUNT(*) DESC, site ASC"),
                    Vec::new(),
                ),
            };

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                    Ok(SiteStats {
                        site: row.get(0)?,
                        total_urls: row.get::<_, i64>(1)? as u64,
                        total_crawls: row.get::<_, i64>(2)? as u64,
                        avg_crawls_per_url: row.get(3)?,
                        unique_crawl_ratio: row.get(4)?,
                        last_activity: opt_ts_column(row, 5)?,
                        avg_quality: row.get(6)?,
                        success_count: row.get::<_, i64>(7)? as u64,
                        failed_count: row.get::<_, i64>(8)? as u64,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Re-crawled URLs ordered by days-per-crawl, fastest first
    pub fn frequently_changing_urls(&self, limit: usize) -> Result<Vec<ChangingUrl>> {
        self.frequently_changing_urls_at(limit, Utc::now())
    }

    pub fn frequently_changing_urls_at(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChangingUrl>> {
        let rows: Vec<(String, String, u32, DateTime<Utc>, DateTime<Utc>, Option<u8>)> =
            self.db.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT url, site, scrape_count, first_seen_at, last_seen_at, quality_score
                     FROM url_records WHERE scrape_count > 1",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            ts_column(row, 3)?,
                            ts_column(row, 4)?,
                            row.get(5)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })?;

        let mut changing: Vec<ChangingUrl> = rows
            .into_iter()
            .map(|(url, site, scrape_count, first_seen, last_seen_at, quality_score)| {
                let age_days = (now - first_seen).num_seconds().max(0) as f64 / 86_400.0;
                ChangingUrl {
                    url,
                    site,
                    scrape_count,
                    days_per_change: age_days / f64::from(scrape_count),
                    last_seen_at,
                    quality_score,
                }
            })
            .collect();

        changing.sort_by(|a, b| {
            a.days_per_change
                .total_cmp(&b.days_per_change)
                .then_with(|| a.url.cmp(&b.url))
        });
        changing.truncate(limit);
        Ok(changing)
    }

    /// Delete failed records not seen for `days_old` days
    pub fn cleanup_old_records(&self, days_old: u32) -> Result<usize> {
        self.cleanup_old_records_at(days_old, Utc::now())
    }

    pub fn cleanup_old_records_at(&self, days_old: u32, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = format_ts(&(now - Duration::days(i64::from(days_old))));
        let removed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM url_records WHERE status = 'failed' AND last_seen_at < ?1",
                params![cutoff],
            )?)
        })?;

        tracing::info!(removed, days_old, "Cleaned up old URL records");
        Ok(removed)
    }
}

fn lookup_override(site: &str, overrides: &HashMap<String, u32>) -> Option<u32> {
    if overrides.is_empty() {
        return None;
    }
    domain_suffixes(site).find_map(|s| overrides.get(s).copied())
}

const RECORD_COLUMNS: &str = "url, content_hash, content_length, first_seen_at, last_seen_at, \
     scrape_count, site, extraction_method, status, quality_score, tags, etag, \
     last_modified, http_status, failure_count";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<UrlRecord> {
    let status: String = row.get(8)?;
    let tags: Option<String> = row.get(10)?;
    let tags = match tags {
        Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring malformed stored tags");
            Vec::new()
        }),
        None => Vec::new(),
    };

    Ok(UrlRecord {
        url: row.get(0)?,
        content_hash: row.get(1)?,
        content_length: row.get::<_, i64>(2)?.max(0) as u64,
        first_seen_at: ts_column(row, 3)?,
        last_seen_at: ts_column(row, 4)?,
        scrape_count: row.get(5)?,
        site: row.get(6)?,
        extraction_method: row.get(7)?,
        status: status.parse().unwrap_or(CrawlStatus::Failed),
        quality_score: row.get(9)?,
        tags,
        etag: row.get(11)?,
        last_modified: row.get(12)?,
        http_status: row.get(13)?,
        failure_count: row.get(14)?,
    })
}
