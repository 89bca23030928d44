//! Discovery queue: URLs found by discovery producers, awaiting a crawl
//!
//! Each URL appears at most once. Entries move through
//! `queued -> processing -> {completed, failed}`, failed entries can be
//! requeued, and `skipped` records entries deliberately not crawled.
//! Claims ([`DiscoveryQueue::next_batch`]) run in a single IMMEDIATE
//! transaction, so concurrent consumers never receive the same entry.

pub mod frontier;
pub mod inference;
pub mod prioritizer;

use std::collections::BTreeMap;
use std::fmt;
use std::io::BufRead;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::Metadata;
use crate::storage::{format_ts, opt_ts_column, parse_ts, ts_column, Database};
use crate::utils::parse_crawl_url;

pub use frontier::{CrawlFrontier, FrontierBatch, RefreshSettings};
pub use inference::{infer_base_priority, infer_category, DiscoverySource};
pub use prioritizer::{
    score, CrawlHistory, PriorityStatistics, QueuePrioritizer, ScoreBreakdown, ScoreInputs,
    ScoreWeights, SourcePriority,
};

/// Quality assumed for candidates that carry no estimate
pub const DEFAULT_QUALITY_ESTIMATE: f64 = 0.5;

// ============================================================================
// Core Types
// ============================================================================

/// Lifecycle state of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(QueueStatus::Queued),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            "skipped" => Ok(QueueStatus::Skipped),
            other => Err(Error::invalid("queue status", other)),
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored queue entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub id: i64,
    pub url: String,
    pub source: String,
    pub category: String,
    /// 1 (most urgent) to 10
    pub base_priority: u8,
    pub priority_score: f64,
    pub discovered_at: DateTime<Utc>,
    /// Set when the entry is claimed
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: QueueStatus,
    pub quality_estimate: f64,
    pub metadata: Metadata,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub scored_at: Option<DateTime<Utc>>,
}

/// A URL offered by a discovery producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateUrl {
    pub url: String,
    #[serde(default = "default_source")]
    pub source: String,
    /// Inferred from the domain when absent
    #[serde(default)]
    pub category: Option<String>,
    /// Inferred from the source and domain when absent
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub quality_estimate: Option<f64>,
    #[serde(default)]
    pub metadata: Metadata,
}

fn default_source() -> String {
    String::from("manual")
}

impl CandidateUrl {
    pub fn new(url: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            source: source.into(),
            category: None,
            priority: None,
            quality_estimate: None,
            metadata: Metadata::default(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality_estimate = Some(quality);
        self
    }
}

/// Result for one candidate in a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ItemOutcome {
    Added { url: String },
    Skipped { url: String, reason: String },
    Error { url: String, reason: String },
}

/// Per-batch tally of [`ItemOutcome`]s
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub added: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchSummary {
    pub fn record(&mut self, outcome: ItemOutcome) {
        match &outcome {
            ItemOutcome::Added { .. } => self.added += 1,
            ItemOutcome::Skipped { .. } => self.skipped += 1,
            ItemOutcome::Error { .. } => self.failed += 1,
        }
        self.outcomes.push(outcome);
    }

    pub fn merge(&mut self, other: BatchSummary) {
        for outcome in other.outcomes {
            self.record(outcome);
        }
    }
}

/// Optional restrictions on [`DiscoveryQueue::next_batch`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchFilter {
    pub categories: Vec<String>,
    pub min_quality: Option<f64>,
}

impl BatchFilter {
    pub fn categories<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            categories: categories.into_iter().map(Into::into).collect(),
            min_quality: None,
        }
    }

    pub fn with_min_quality(mut self, min_quality: f64) -> Self {
        self.min_quality = Some(min_quality);
        self
    }
}

/// Aggregate counts for monitoring
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStatistics {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_source: BTreeMap<String, SourceBreakdown>,
    pub by_category: BTreeMap<String, u64>,
    /// Queued entries awaiting a claim
    pub queue_size: u64,
    /// Completed entries as a percentage of all entries
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceBreakdown {
    pub count: u64,
    pub avg_quality: f64,
}

// ============================================================================
// Queue
// ============================================================================

/// SQLite-backed discovery queue
pub struct DiscoveryQueue {
    db: Arc<Database>,
    weights: ScoreWeights,
}

impl DiscoveryQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_weights(db, ScoreWeights::default())
    }

    /// Queue whose initial scores use `weights`
    pub fn with_weights(db: Arc<Database>, weights: ScoreWeights) -> Self {
        Self { db, weights }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Add candidates, ignoring URLs already queued
    ///
    /// Invalid candidates are reported per item and never abort the batch.
    /// A storage failure rolls back the whole batch.
    pub fn add(&self, candidates: &[CandidateUrl]) -> Result<BatchSummary> {
        self.add_at(candidates, Utc::now())
    }

    pub fn add_at(&self, candidates: &[CandidateUrl], now: DateTime<Utc>) -> Result<BatchSummary> {
        let discovered_at = format_ts(&now);

        let summary = self.db.with_transaction(|tx| {
            let mut summary = BatchSummary::default();
            for candidate in candidates {
                let prepared = match prepare_candidate(candidate) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::debug!(url = %candidate.url, error = %e, "Rejected candidate");
                        summary.record(ItemOutcome::Error {
                            url: candidate.url.clone(),
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };

                let history = match crawl_history(tx, &prepared.url)? {
                    Some(row) => match row.decode() {
                        Ok(history) => Some(history),
                        Err(e) => {
                            tracing::warn!(url = %prepared.url, error = %e, "Unreadable crawl record");
                            summary.record(ItemOutcome::Error {
                                url: prepared.url,
                                reason: e.to_string(),
                            });
                            continue;
                        }
                    },
                    None => None,
                };
                let breakdown = score(
                    &self.weights,
                    &ScoreInputs {
                        url: &prepared.url,
                        source: prepared.source.as_str(),
                        category: &prepared.category,
                        base_priority: prepared.base_priority,
                        quality_estimate: prepared.quality_estimate,
                        discovered_at: now,
                        metadata: &candidate.metadata,
                        history,
                    },
                    now,
                );

                let inserted = tx.execute(
                    r#"
                    INSERT OR IGNORE INTO queue_entries (
                        url, source, category, base_priority, priority_score,
                        discovered_at, status, quality_estimate, metadata, scored_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7, ?8, ?6)
                    "#,
                    params![
                        prepared.url,
                        prepared.source.as_str(),
                        prepared.category,
                        prepared.base_priority,
                        breakdown.final_score,
                        discovered_at,
                        prepared.quality_estimate,
                        candidate.metadata.to_stored(),
                    ],
                )?;

                summary.record(if inserted == 1 {
                    ItemOutcome::Added { url: prepared.url }
                } else {
                    ItemOutcome::Skipped {
                        url: prepared.url,
                        reason: String::from("already queued"),
                    }
                });
            }
            Ok(summary)
        })?;

        tracing::info!(
            added = summary.added,
            skipped = summary.skipped,
            failed = summary.failed,
            "Discovery batch processed"
        );
        Ok(summary)
    }

    /// Claim up to `limit` queued entries, highest score first
    ///
    /// Ties break by discovery time, then insertion order. Claimed entries
    /// move to `processing` before this returns.
    pub fn next_batch(&self, limit: usize, filter: &BatchFilter) -> Result<Vec<QueueEntry>> {
        self.next_batch_at(limit, filter, Utc::now())
    }

    pub fn next_batch_at(
        &self,
        limit: usize,
        filter: &BatchFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut sql = format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE status = 'queued'");
        let mut args: Vec<rusqlite::types::Value> = Vec::new();
        if !filter.categories.is_empty() {
            let placeholders = vec!["?"; filter.categories.len()].join(", ");
            sql.push_str(&format!(" AND category IN ({placeholders})"));
            args.extend(filter.categories.iter().cloned().map(Into::into));
        }
        if let Some(min_quality) = filter.min_quality {
            sql.push_str(" AND quality_estimate >= ?");
            args.push(min_quality.into());
        }
        sql.push_str(" ORDER BY priority_score DESC, discovered_at ASC, id ASC LIMIT ?");
        args.push((limit as i64).into());

        let scheduled_at = format_ts(&now);
        let claimed = self.db.with_transaction(|tx| {
            let mut entries = {
                let mut stmt = tx.prepare(&sql)?;
                let entries = stmt
                    .query_map(params_from_iter(args.iter()), entry_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                entries
            };

            let mut claim = tx.prepare(
                "UPDATE queue_entries SET status = 'processing', scheduled_at = ?1 \
                 WHERE id = ?2 AND status = 'queued'",
            )?;
            for entry in &mut entries {
                if claim.execute(params![scheduled_at, entry.id])? != 1 {
                    return Err(Error::other(format!("lost claim on queue entry {}", entry.id)));
                }
                entry.status = QueueStatus::Processing;
                entry.scheduled_at = Some(now);
            }
            Ok(entries)
        })?;

        tracing::debug!(claimed = claimed.len(), limit, "Claimed queue batch");
        Ok(claimed)
    }

    /// Finish a claimed entry
    ///
    /// Success moves it to `completed` and stores `quality` (0.0 - 1.0) when
    /// given; failure moves it to `failed` and bumps its retry count.
    pub fn mark_done(
        &self,
        url: &str,
        success: bool,
        quality: Option<f64>,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        self.mark_done_at(url, success, quality, failure_reason, Utc::now())
    }

    pub fn mark_done_at(
        &self,
        url: &str,
        success: bool,
        quality: Option<f64>,
        failure_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let target = if success {
            QueueStatus::Completed
        } else {
            QueueStatus::Failed
        };
        let quality = quality.filter(|q| q.is_finite()).map(|q| q.clamp(0.0, 1.0));

        self.db.with_transaction(|tx| {
            require_status(tx, url, &[QueueStatus::Processing], target)?;
            if success {
                tx.execute(
                    "UPDATE queue_entries \
                     SET status = 'completed', \
                         quality_estimate = COALESCE(?2, quality_estimate), \
                         failure_reason = NULL \
                     WHERE url = ?1 AND status = 'processing'",
                    params![url, quality],
                )?;
            } else {
                tx.execute(
                    "UPDATE queue_entries \
                     SET status = 'failed', retry_count = retry_count + 1, \
                         last_retry_at = ?2, failure_reason = ?3 \
                     WHERE url = ?1 AND status = 'processing'",
                    params![url, format_ts(&now), failure_reason],
                )?;
            }
            Ok(())
        })?;

        tracing::debug!(url, status = %target, "Queue entry finished");
        Ok(())
    }

    /// Record that a queued or claimed entry will not be crawled
    pub fn mark_skipped(&self, url: &str, reason: &str) -> Result<()> {
        self.db.with_transaction(|tx| {
            require_status(
                tx,
                url,
                &[QueueStatus::Queued, QueueStatus::Processing],
                QueueStatus::Skipped,
            )?;
            tx.execute(
                "UPDATE queue_entries SET status = 'skipped', failure_reason = ?2 \
                 WHERE url = ?1 AND status IN ('queued', 'processing')",
                params![url, reason],
            )?;
            Ok(())
        })?;

        tracing::debug!(url, reason, "Queue entry skipped");
        Ok(())
    }

    /// Return failed entries to `queued`
    ///
    /// Without `url`, every failed entry with fewer than `max_retries`
    /// retries is requeued. With `url`, that entry is requeued regardless of
    /// its retry count and must currently be `failed`.
    pub fn requeue_failed(&self, url: Option<&str>, max_retries: u32) -> Result<usize> {
        let requeued = self.db.with_transaction(|tx| match url {
            Some(url) => {
                require_status(tx, url, &[QueueStatus::Failed], QueueStatus::Queued)?;
                Ok(tx.execute(
                    "UPDATE queue_entries SET status = 'queued', scheduled_at = NULL \
                     WHERE url = ?1 AND status = 'failed'",
                    params![url],
                )?)
            }
            None => Ok(tx.execute(
                "UPDATE queue_entries SET status = 'queued', scheduled_at = NULL \
                 WHERE status = 'failed' AND retry_count < ?1",
                params![max_retries],
            )?),
        })?;

        tracing::info!(requeued, max_retries, "Failed queue entries requeued");
        Ok(requeued)
    }

    /// Fail claims held longer than `max_age`
    ///
    /// Recovers entries whose consumer died mid-crawl. They become `failed`
    /// with reason `claim expired` and are picked up by
    /// [`requeue_failed`](Self::requeue_failed).
    pub fn expire_stale_claims(&self, max_age: Duration) -> Result<usize> {
        self.expire_stale_claims_at(max_age, Utc::now())
    }

    pub fn expire_stale_claims_at(&self, max_age: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = format_ts(&(now - max_age));
        let expired = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE queue_entries \
                 SET status = 'failed', retry_count = retry_count + 1, \
                     last_retry_at = ?2, failure_reason = 'claim expired' \
                 WHERE status = 'processing' AND scheduled_at < ?1",
                params![cutoff, format_ts(&now)],
            )?)
        })?;

        if expired > 0 {
            tracing::warn!(expired, "Expired stale queue claims");
        }
        Ok(expired)
    }

    /// Delete completed and failed entries discovered more than `days_old` days ago
    pub fn cleanup_older_than(&self, days_old: u32) -> Result<usize> {
        self.cleanup_older_than_at(days_old, Utc::now())
    }

    pub fn cleanup_older_than_at(&self, days_old: u32, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = format_ts(&(now - Duration::days(i64::from(days_old))));
        let removed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM queue_entries \
                 WHERE status IN ('completed', 'failed') AND discovered_at < ?1",
                params![cutoff],
            )?)
        })?;

        tracing::info!(removed, days_old, "Cleaned up old queue entries");
        Ok(removed)
    }

    pub fn get(&self, url: &str) -> Result<Option<QueueEntry>> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE url = ?1"),
                    params![url],
                    entry_from_row,
                )
                .optional()?)
        })
    }

    pub fn statistics(&self) -> Result<QueueStatistics> {
        self.db.with_conn(|conn| {
            let mut stats = QueueStatistics::default();

            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM queue_entries GROUP BY status")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            for row in rows {
                let (status, count) = row?;
                stats.total += count as u64;
                stats.by_status.insert(status, count as u64);
            }

            let mut stmt = conn.prepare(
                "SELECT source, COUNT(*), COALESCE(AVG(quality_estimate), 0) \
                 FROM queue_entries GROUP BY source",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    SourceBreakdown {
                        count: row.get::<_, i64>(1)? as u64,
                        avg_quality: row.get(2)?,
                    },
                ))
            })?;
            for row in rows {
                let (source, breakdown) = row?;
                stats.by_source.insert(source, breakdown);
            }

            let mut stmt =
                conn.prepare("SELECT category, COUNT(*) FROM queue_entries GROUP BY category")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            for row in rows {
                let (category, count) = row?;
                stats.by_category.insert(category, count as u64);
            }

            stats.queue_size = stats.by_status.get("queued").copied().unwrap_or(0);
            let completed = stats.by_status.get("completed").copied().unwrap_or(0);
            stats.success_rate = completed as f64 / stats.total.max(1) as f64 * 100.0;
            Ok(stats)
        })
    }
}

/// Parse newline-delimited JSON candidates
///
/// Blank lines are ignored. Lines that fail to parse become
/// [`ItemOutcome::Error`] entries keyed by `line N`.
pub fn parse_candidates_jsonl<R: BufRead>(reader: R) -> Result<(Vec<CandidateUrl>, BatchSummary)> {
    let mut candidates = Vec::new();
    let mut rejected = BatchSummary::default();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<CandidateUrl>(trimmed) {
            Ok(candidate) => candidates.push(candidate),
            Err(e) => rejected.record(ItemOutcome::Error {
                url: format!("line {}", idx + 1),
                reason: e.to_string(),
            }),
        }
    }

    Ok((candidates, rejected))
}

// ============================================================================
// Helpers
// ============================================================================

struct PreparedCandidate {
    url: String,
    source: DiscoverySource,
    category: String,
    base_priority: u8,
    quality_estimate: f64,
}

fn prepare_candidate(candidate: &CandidateUrl) -> Result<PreparedCandidate> {
    let parsed = parse_crawl_url(&candidate.url)?;
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();

    let source = DiscoverySource::parse(&candidate.source)
        .ok_or_else(|| Error::invalid("source", "empty"))?;

    let quality_estimate = match candidate.quality_estimate {
        Some(q) if q.is_finite() && (0.0..=1.0).contains(&q) => q,
        Some(q) => return Err(Error::invalid("quality_estimate", format!("{q} outside 0.0 - 1.0"))),
        None => DEFAULT_QUALITY_ESTIMATE,
    };

    let base_priority = match candidate.priority {
        Some(p) if (1..=10).contains(&p) => p,
        Some(p) => return Err(Error::invalid("priority", format!("{p} outside 1 - 10"))),
        None => infer_base_priority(&source, &host),
    };

    let category = candidate
        .category
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| infer_category(&host).to_string());

    Ok(PreparedCandidate {
        url: candidate.url.trim().to_string(),
        source,
        category,
        base_priority,
        quality_estimate,
    })
}

/// Raw `url_records` columns used for scoring
struct HistoryRow {
    status: String,
    last_seen_at: String,
}

impl HistoryRow {
    fn decode(&self) -> Result<CrawlHistory> {
        Ok(CrawlHistory {
            status: self.status.parse()?,
            last_seen_at: parse_ts(&self.last_seen_at)?,
        })
    }
}

fn crawl_history(tx: &Transaction<'_>, url: &str) -> Result<Option<HistoryRow>> {
    let row = tx
        .query_row(
            "SELECT status, last_seen_at FROM url_records WHERE url = ?1",
            params![url],
            |row| {
                Ok(HistoryRow {
                    status: row.get(0)?,
                    last_seen_at: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Ensure `url` exists and is in one of `allowed`, else a typed error
fn require_status(
    tx: &Transaction<'_>,
    url: &str,
    allowed: &[QueueStatus],
    target: QueueStatus,
) -> Result<()> {
    let current: Option<String> = tx
        .query_row(
            "SELECT status FROM queue_entries WHERE url = ?1",
            params![url],
            |row| row.get(0),
        )
        .optional()?;

    let current: QueueStatus = current
        .ok_or_else(|| Error::not_found("queue entry", url))?
        .parse()?;
    if allowed.contains(&current) {
        Ok(())
    } else {
        Err(Error::transition(url, current.as_str(), target.as_str()))
    }
}

const ENTRY_COLUMNS: &str = "id, url, source, category, base_priority, priority_score, \
     discovered_at, scheduled_at, status, quality_estimate, metadata, retry_count, \
     last_retry_at, failure_reason, scored_at";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let status: String = row.get(8)?;
    let metadata: String = row.get(10)?;

    Ok(QueueEntry {
        id: row.get(0)?,
        url: row.get(1)?,
        source: row.get(2)?,
        category: row.get(3)?,
        base_priority: row.get::<_, i64>(4)?.clamp(1, 10) as u8,
        priority_score: row.get(5)?,
        discovered_at: ts_column(row, 6)?,
        scheduled_at: opt_ts_column(row, 7)?,
        status: status.parse().unwrap_or(QueueStatus::Failed),
        quality_estimate: row.get(9)?,
        metadata: Metadata::from_stored(&metadata),
        retry_count: row.get(11)?,
        last_retry_at: opt_ts_column(row, 12)?,
        failure_reason: row.get(13)?,
        scored_at: opt_ts_column(row, 14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn queue() -> DiscoveryQueue {
        DiscoveryQueue::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_add_is_idempotent() {
        let queue = queue();
        let batch = vec![
            CandidateUrl::new("https://a.example/1", "feed"),
            CandidateUrl::new("https://a.example/1", "feed"),
        ];
        let summary = queue.add_at(&batch, t0()).unwrap();
        assert_eq!((summary.added, summary.skipped), (1, 1));

        let again = queue.add_at(&batch[..1], t0()).unwrap();
        assert_eq!(again.added, 0);
        assert_eq!(queue.statistics().unwrap().total, 1);
    }

    #[test]
    fn test_corrupt_crawl_record_fails_only_its_item() {
        let queue = queue();
        queue
            .database()
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO url_records (url, content_hash, first_seen_at, last_seen_at, site, status) \
                     VALUES ('https://a.example/bad', 'h', ?1, ?1, 'a.example', 'exploded')",
                    params![format_ts(&t0())],
                )?;
                Ok(())
            })
            .unwrap();

        let summary = queue
            .add_at(
                &[
                    CandidateUrl::new("https://a.example/bad", "feed"),
                    CandidateUrl::new("https://a.example/good", "feed"),
                ],
                t0(),
            )
            .unwrap();
        assert_eq!((summary.added, summary.failed), (1, 1));
        assert!(matches!(
            &summary.outcomes[0],
            ItemOutcome::Error { url, .. } if url == "https://a.example/bad"
        ));
        assert!(queue.get("https://a.example/good").unwrap().is_some());
    }

    #[test]
    fn test_invalid_candidates_do_not_abort_batch() {
        let queue = queue();
        let batch = vec![
            CandidateUrl::new("not a url", "feed"),
            CandidateUrl::new("https://a.example/ok", ""),
            CandidateUrl::new("https://a.example/q", "feed").with_quality(1.5),
            CandidateUrl::new("https://a.example/p", "feed").with_priority(0),
            CandidateUrl::new("https://a.example/good", "rss"),
        ];
        let summary = queue.add_at(&batch, t0()).unwrap();
        assert_eq!(summary.added, 1);
        assert_eq!(summary.failed, 4);

        let entry = queue.get("https://a.example/good").unwrap().unwrap();
        assert_eq!(entry.source, "feed");
        assert_eq!(entry.base_priority, 6);
        assert_eq!(entry.category, "general");
        assert!(entry.scored_at.is_some());
    }

    #[test]
    fn test_claim_order_and_transitions() {
        let queue = queue();
        queue
            .add_at(
                &[
                    CandidateUrl::new("https://a.example/low", "search").with_quality(0.1),
                    CandidateUrl::new("https://a.example/high", "manual").with_quality(0.9),
                ],
                t0(),
            )
            .unwrap();

        let batch = queue.next_batch_at(1, &BatchFilter::default(), t0()).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].url, "https://a.example/high");
        assert_eq!(batch[0].status, QueueStatus::Processing);

        // Not yet claimed
        let err = queue
            .mark_done("https://a.example/low", true, None, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        queue
            .mark_done("https://a.example/high", false, None, Some("timeout"))
            .unwrap();
        let failed = queue.get("https://a.example/high").unwrap().unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.failure_reason.as_deref(), Some("timeout"));

        assert_eq!(queue.requeue_failed(None, 3).unwrap(), 1);
        assert_eq!(queue.requeue_failed(None, 1).unwrap(), 0);
    }

    #[test]
    fn test_mark_done_unknown_url() {
        let err = queue()
            .mark_done("https://missing.example", true, None, None)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_category_filter() {
        let queue = queue();
        queue
            .add_at(
                &[
                    CandidateUrl::new("https://github.com/a/b", "api"),
                    CandidateUrl::new("https://arxiv.org/abs/1", "api"),
                ],
                t0(),
            )
            .unwrap();

        let batch = queue
            .next_batch_at(10, &BatchFilter::categories(["research"]), t0())
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].category, "research");
    }

    #[test]
    fn test_expire_stale_claims() {
        let queue = queue();
        queue
            .add_at(&[CandidateUrl::new("https://a.example/x", "feed")], t0())
            .unwrap();
        queue.next_batch_at(5, &BatchFilter::default(), t0()).unwrap();

        let expired = queue
            .expire_stale_claims_at(Duration::hours(1), t0() + Duration::hours(2))
            .unwrap();
        assert_eq!(expired, 1);
        let entry = queue.get("https://a.example/x").unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Failed);
        assert_eq!(entry.failure_reason.as_deref(), Some("claim expired"));
    }

    #[test]
    fn test_cleanup_keeps_active_entries() {
        let queue = queue();
        queue
            .add_at(
                &[
                    CandidateUrl::new("https://a.example/done", "feed"),
                    CandidateUrl::new("https://a.example/waiting", "feed"),
                ],
                t0(),
            )
            .unwrap();
        let claimed = queue.next_batch_at(1, &BatchFilter::default(), t0()).unwrap();
        queue.mark_done(&claimed[0].url, true, Some(0.8), None).unwrap();

        let removed = queue
            .cleanup_older_than_at(30, t0() + Duration::days(31))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(queue.statistics().unwrap().queue_size, 1);
    }

    #[test]
    fn test_parse_candidates_jsonl() {
        let input = "{\"url\":\"https://a.example/1\",\"source\":\"rss\"}\n\n{broken\n{\"url\":\"https://a.example/2\"}\n";
        let (candidates, rejected) = parse_candidates_jsonl(input.as_bytes()).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[1].source, "manual");
        assert_eq!(rejected.failed, 1);
        assert!(matches!(
            &rejected.outcomes[0],
            ItemOutcome::Error { url, .. } if url == "line 3"
        ));
    }
}
