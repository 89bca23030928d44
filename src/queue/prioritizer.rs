//! Priority scoring for queued URLs
//!
//! [`score`] is a pure function of one entry, its crawl history and the
//! clock; [`QueuePrioritizer`] applies it to stored entries in batches and
//! reports on the resulting distribution.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::Metadata;
use crate::queue::inference::DiscoverySource;
use crate::storage::{format_ts, opt_ts_column, ts_column, Database};
use crate::tracker::CrawlStatus;
use crate::utils::domain_suffixes;

/// Scores above this fall in the "high" bucket
pub const HIGH_PRIORITY_THRESHOLD: f64 = 1.0;

/// Scores below this fall in the "low" bucket
pub const LOW_PRIORITY_THRESHOLD: f64 = 0.5;

// ============================================================================
// Weights
// ============================================================================

/// Tunable scoring weights
///
/// Every field has a default, so a config file only needs to name the
/// weights it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    /// Bonus per canonical source label
    pub source_bonuses: BTreeMap<String, f64>,
    pub category_bonuses: BTreeMap<String, f64>,
    /// Bonus per authoritative domain, matched on the host or a parent domain
    pub authority_domains: BTreeMap<String, f64>,

    pub discovered_within_day: f64,
    pub discovered_within_week: f64,
    pub discovered_within_month: f64,

    pub last_crawl_success: f64,
    pub last_crawl_failed: f64,
    /// Applied when the URL was crawled less than a week ago
    pub crawled_within_week: f64,
    /// Applied when the URL was crawled less than a month ago
    pub crawled_within_month: f64,

    pub strategy_density_factor: f64,
    pub strategy_density_cap: f64,
    pub keywords: Vec<String>,
    pub keyword_bonus: f64,
    pub keyword_cap: f64,

    /// Added per step below base priority 10
    pub priority_hint_step: f64,

    /// Upper clamp of the final score
    pub max_score: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        let table = |pairs: &[(&str, f64)]| -> BTreeMap<String, f64> {
            pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
        };

        Self {
            source_bonuses: table(&[
                ("manual", 0.30),
                ("api-discovery", 0.20),
                ("feed", 0.15),
                ("sitemap", 0.10),
                ("search", 0.05),
            ]),
            category_bonuses: table(&[
                ("strategy", 0.25),
                ("research", 0.20),
                ("tutorial", 0.15),
                ("code", 0.10),
                ("blog", 0.05),
                ("news", 0.02),
            ]),
            authority_domains: table(&[
                ("quantstart.com", 0.30),
                ("blog.quantinsti.com", 0.25),
                ("arxiv.org", 0.30),
                ("papers.ssrn.com", 0.25),
                ("github.com", 0.20),
                ("investopedia.com", 0.20),
                ("bloomberg.com", 0.15),
                ("reuters.com", 0.15),
            ]),
            discovered_within_day: 0.20,
            discovered_within_week: 0.10,
            discovered_within_month: 0.05,
            last_crawl_success: 0.10,
            last_crawl_failed: -0.20,
            crawled_within_week: -0.30,
            crawled_within_month: -0.10,
            strategy_density_factor: 0.2,
            strategy_density_cap: 0.2,
            keywords: [
                "backtest",
                "algorithm",
                "strategy",
                "quantitative",
                "machine learning",
                "python",
                "trading",
                "portfolio",
            ]
            .iter()
            .map(|k| k.to_string())
            .collect(),
            keyword_bonus: 0.05,
            keyword_cap: 0.25,
            priority_hint_step: 0.05,
            max_score: 2.0,
        }
    }
}

impl ScoreWeights {
    fn domain_bonus(&self, host: &str) -> f64 {
        if host.is_empty() {
            return 0.0;
        }
        domain_suffixes(host)
            .find_map(|suffix| self.authority_domains.get(suffix).copied())
            .unwrap_or(0.0)
    }
}

// ============================================================================
// Pure Scoring
// ============================================================================

/// Last known crawl of a URL, as read from the tracker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrawlHistory {
    pub status: CrawlStatus,
    pub last_seen_at: DateTime<Utc>,
}

/// Everything the score depends on
#[derive(Debug, Clone)]
pub struct ScoreInputs<'a> {
    pub url: &'a str,
    /// Canonical source label
    pub source: &'a str,
    pub category: &'a str,
    pub base_priority: u8,
    pub quality_estimate: f64,
    pub discovered_at: DateTime<Utc>,
    pub metadata: &'a Metadata,
    pub history: Option<CrawlHistory>,
}

/// Per-term contribution to a priority score
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub base: f64,
    pub source_bonus: f64,
    pub category_bonus: f64,
    pub recency_bonus: f64,
    pub domain_bonus: f64,
    pub crawl_history_bonus: f64,
    pub freshness_penalty: f64,
    pub content_bonus: f64,
    pub priority_hint: f64,
    /// Sum of all terms before clamping
    pub raw_total: f64,
    pub final_score: f64,
}

impl ScoreBreakdown {
    /// Named terms in evaluation order
    pub fn components(&self) -> [(&'static str, f64); 9] {
        [
            ("base", self.base),
            ("source_bonus", self.source_bonus),
            ("category_bonus", self.category_bonus),
            ("recency_bonus", self.recency_bonus),
            ("domain_bonus", self.domain_bonus),
            ("crawl_history_bonus", self.crawl_history_bonus),
            ("freshness_penalty", self.freshness_penalty),
            ("content_bonus", self.content_bonus),
            ("priority_hint", self.priority_hint),
        ]
    }
}

/// Score one entry, clamped to `[0, weights.max_score]`
pub fn score(weights: &ScoreWeights, inputs: &ScoreInputs<'_>, now: DateTime<Utc>) -> ScoreBreakdown {
    let mut b = ScoreBreakdown {
        base: clamp_unit(inputs.quality_estimate),
        ..Default::default()
    };

    b.source_bonus = weights
        .source_bonuses
        .get(inputs.source)
        .copied()
        .unwrap_or(0.0);
    b.category_bonus = weights
        .category_bonuses
        .get(inputs.category)
        .copied()
        .unwrap_or(0.0);

    let days_old = (now - inputs.discovered_at).num_days().max(0);
    b.recency_bonus = match days_old {
        0..=1 => weights.discovered_within_day,
        2..=7 => weights.discovered_within_week,
        8..=30 => weights.discovered_within_month,
        _ => 0.0,
    };

    let host = url::Url::parse(inputs.url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_default();
    b.domain_bonus = weights.domain_bonus(&host);

    if let Some(history) = inputs.history {
        b.crawl_history_bonus = match history.status {
            CrawlStatus::Success => weights.last_crawl_success,
            CrawlStatus::Failed => weights.last_crawl_failed,
            CrawlStatus::Partial => 0.0,
        };
        let days_since = (now - history.last_seen_at).num_days();
        b.freshness_penalty = if days_since < 7 {
            weights.crawled_within_week
        } else if days_since < 30 {
            weights.crawled_within_month
        } else {
            0.0
        };
    }

    b.content_bonus = content_bonus(weights, inputs.metadata);

    let steps = 10u8.saturating_sub(inputs.base_priority.clamp(1, 10));
    b.priority_hint = f64::from(steps) * weights.priority_hint_step;

    b.raw_total = b.components().iter().map(|(_, v)| v).sum();
    b.final_score = if b.raw_total.is_finite() {
        b.raw_total.clamp(0.0, weights.max_score)
    } else {
        0.0
    };
    b
}

fn content_bonus(weights: &ScoreWeights, metadata: &Metadata) -> f64 {
    let density = metadata
        .strategy_density
        .filter(|d| d.is_finite() && *d > 0.0)
        .map_or(0.0, |d| (d * weights.strategy_density_factor).min(weights.strategy_density_cap));

    let text = metadata.searchable_text();
    let hits = weights
        .keywords
        .iter()
        .filter(|k| !k.is_empty() && text.contains(k.to_lowercase().as_str()))
        .count();
    let keywords = (hits as f64 * weights.keyword_bonus).min(weights.keyword_cap);

    density + keywords
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

// ============================================================================
// Stored Scoring
// ============================================================================

/// Score distribution over queued entries
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PriorityStatistics {
    pub queued: u64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    /// Above [`HIGH_PRIORITY_THRESHOLD`]
    pub high: u64,
    pub medium: u64,
    /// Below [`LOW_PRIORITY_THRESHOLD`]
    pub low: u64,
    /// Sources ordered by average score, best first
    pub sources: Vec<SourcePriority>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourcePriority {
    pub source: String,
    pub count: u64,
    pub average: f64,
}

/// Applies [`score`] to stored queue entries
pub struct QueuePrioritizer {
    db: Arc<Database>,
    weights: ScoreWeights,
}

const SCORING_COLUMNS: &str = "q.id, q.url, q.source, q.category, q.base_priority, \
     q.quality_estimate, q.discovered_at, q.metadata, r.status, r.last_seen_at";

struct ScoringRow {
    id: i64,
    url: String,
    source: String,
    category: String,
    base_priority: u8,
    quality_estimate: f64,
    discovered_at: DateTime<Utc>,
    metadata: Metadata,
    history: Option<CrawlHistory>,
}

impl ScoringRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let raw_metadata: String = row.get(7)?;
        let status: Option<String> = row.get(8)?;
        let last_seen = opt_ts_column(row, 9)?;
        let history = match (status, last_seen) {
            (Some(status), Some(last_seen_at)) => Some(CrawlHistory {
                status: status.parse().unwrap_or(CrawlStatus::Failed),
                last_seen_at,
            }),
            _ => None,
        };

        Ok(Self {
            id: row.get(0)?,
            url: row.get(1)?,
            source: row.get(2)?,
            category: row.get(3)?,
            base_priority: row.get::<_, i64>(4)?.clamp(1, 10) as u8,
            quality_estimate: row.get(5)?,
            discovered_at: ts_column(row, 6)?,
            metadata: Metadata::from_stored(&raw_metadata),
            history,
        })
    }

    fn score(&self, weights: &ScoreWeights, now: DateTime<Utc>) -> ScoreBreakdown {
        let inputs = ScoreInputs {
            url: &self.url,
            source: &self.source,
            category: &self.category,
            base_priority: self.base_priority,
            quality_estimate: self.quality_estimate,
            discovered_at: self.discovered_at,
            metadata: &self.metadata,
            history: self.history,
        };
        score(weights, &inputs, now)
    }
}

impl QueuePrioritizer {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_weights(db, ScoreWeights::default())
    }

    pub fn with_weights(db: Arc<Database>, weights: ScoreWeights) -> Self {
        Self { db, weights }
    }

    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    /// Rescore up to `batch_size` queued entries, least recently scored first
    ///
    /// Returns the number of entries rescored. Unscored entries go first, so
    /// repeated calls eventually cover the whole queue.
    pub fn calculate_priority_scores(&self, batch_size: usize) -> Result<usize> {
        self.calculate_priority_scores_at(batch_size, Utc::now())
    }

    pub fn calculate_priority_scores_at(&self, batch_size: usize, now: DateTime<Utc>) -> Result<usize> {
        if batch_size == 0 {
            return Ok(0);
        }
        let scored_at = format_ts(&now);

        let updated = self.db.with_transaction(|tx| {
            let rows = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {SCORING_COLUMNS} FROM queue_entries q \
                     LEFT JOIN url_records r ON r.url = q.url \
                     WHERE q.status = 'queued' \
                     ORDER BY (q.scored_at IS NOT NULL), q.scored_at ASC, q.id ASC \
                     LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(params![batch_size as i64], ScoringRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            let mut update = tx.prepare(
                "UPDATE queue_entries SET priority_score = ?1, scored_at = ?2 WHERE id = ?3",
            )?;
            for row in &rows {
                let breakdown = row.score(&self.weights, now);
                update.execute(params![breakdown.final_score, scored_at, row.id])?;
            }
            Ok(rows.len())
        })?;

        tracing::info!(updated, batch_size, "Priority scores recalculated");
        Ok(updated)
    }

    /// Rescore every queued entry, one batch at a time
    pub fn calculate_all_priority_scores(&self, batch_size: usize) -> Result<usize> {
        self.calculate_all_priority_scores_at(batch_size, Utc::now())
    }

    pub fn calculate_all_priority_scores_at(&self, batch_size: usize, now: DateTime<Utc>) -> Result<usize> {
        if batch_size == 0 {
            return Ok(0);
        }
        let queued: i64 = self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM queue_entries WHERE status = 'queued'",
                [],
                |row| row.get(0),
            )?)
        })?;

        let rounds = (queued.max(0) as usize).div_ceil(batch_size);
        let mut total = 0;
        for _ in 0..rounds {
            let n = self.calculate_priority_scores_at(batch_size, now)?;
            total += n;
            if n < batch_size {
                break;
            }
        }
        Ok(total)
    }

    /// Full term-by-term breakdown for one stored entry
    pub fn debug_score(&self, url: &str) -> Result<ScoreBreakdown> {
        self.debug_score_at(url, Utc::now())
    }

    pub fn debug_score_at(&self, url: &str, now: DateTime<Utc>) -> Result<ScoreBreakdown> {
        let row = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {SCORING_COLUMNS} FROM queue_entries q \
                         LEFT JOIN url_records r ON r.url = q.url \
                         WHERE q.url = ?1"
                    ),
                    params![url],
                    ScoringRow::from_row,
                )
                .optional()?)
        })?;

        let row = row.ok_or_else(|| Error::not_found("queue entry", url))?;
        Ok(row.score(&self.weights, now))
    }

    /// Score distribution over queued entries
    pub fn priority_statistics(&self) -> Result<PriorityStatistics> {
        self.db.with_conn(|conn| {
            let mut stats = conn.query_row(
                "SELECT COUNT(*), COALESCE(AVG(priority_score), 0), \
                        COALESCE(MIN(priority_score), 0), COALESCE(MAX(priority_score), 0), \
                        COUNT(CASE WHEN priority_score > ?1 THEN 1 END), \
                        COUNT(CASE WHEN priority_score < ?2 THEN 1 END) \
                 FROM queue_entries WHERE status = 'queued'",
                params![HIGH_PRIORITY_THRESHOLD, LOW_PRIORITY_THRESHOLD],
                |row| {
                    let queued: i64 = row.get(0)?;
                    let high: i64 = row.get(4)?;
                    let low: i64 = row.get(5)?;
                    Ok(PriorityStatistics {
                        queued: queued as u64,
                        average: row.get(1)?,
                        min: row.get(2)?,
                        max: row.get(3)?,
                        high: high as u64,
                        medium: (queued - high - low).max(0) as u64,
                        low: low as u64,
                        sources: Vec::new(),
                    })
                },
            )?;

            let mut stmt = conn.prepare(
                "SELECT source, COUNT(*), AVG(priority_score) FROM queue_entries \
                 WHERE status = 'queued' GROUP BY source \
                 ORDER BY AVG(priority_score) DESC, source ASC",
            )?;
            stats.sources = stmt
                .query_map([], |row| {
                    Ok(SourcePriority {
                        source: row.get(0)?,
                        count: row.get::<_, i64>(1)? as u64,
                        average: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(stats)
        })
    }

    /// Multiply the stored score of every queued entry from `source`
    ///
    /// Results stay within `[0, max_score]`. The next rescoring pass
    /// replaces the adjusted scores.
    pub fn rescale_source(&self, source: &str, multiplier: f64) -> Result<usize> {
        if !multiplier.is_finite() || multiplier < 0.0 {
            return Err(Error::invalid(
                "multiplier",
                format!("{multiplier} is not a finite non-negative number"),
            ));
        }
        let source = DiscoverySource::parse(source)
            .ok_or_else(|| Error::invalid("source", "empty"))?;

        let updated = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE queue_entries \
                 SET priority_score = MIN(MAX(priority_score * ?1, 0.0), ?2) \
                 WHERE source = ?3 AND status = 'queued'",
                params![multiplier, self.weights.max_score, source.as_str()],
            )?)
        })?;

        tracing::info!(source = %source, multiplier, updated, "Source priority rescaled");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn inputs<'a>(url: &'a str, metadata: &'a Metadata) -> ScoreInputs<'a> {
        ScoreInputs {
            url,
            source: "search",
            category: "general",
            base_priority: 10,
            quality_estimate: 0.5,
            discovered_at: now() - Duration::days(90),
            metadata,
            history: None,
        }
    }

    #[test]
    fn test_plain_entry_scores_its_quality() {
        let meta = Metadata::default();
        let mut i = inputs("https://a.example/x", &meta);
        i.source = "unlisted";
        let b = score(&ScoreWeights::default(), &i, now());
        assert!((b.final_score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_manual_strategy_entry_is_capped() {
        let meta = Metadata::default();
        let i = ScoreInputs {
            source: "manual",
            category: "strategy",
            base_priority: 2,
            quality_estimate: 0.9,
            discovered_at: now(),
            ..inputs("https://a.example/post-1", &meta)
        };
        let b = score(&ScoreWeights::default(), &i, now());
        assert!((b.source_bonus - 0.30).abs() < 1e-9);
        assert!((b.category_bonus - 0.25).abs() < 1e-9);
        assert!((b.recency_bonus - 0.20).abs() < 1e-9);
        assert!((b.priority_hint - 0.40).abs() < 1e-9);
        assert!(b.raw_total > 2.0);
        assert_eq!(b.final_score, 2.0);
    }

    #[test]
    fn test_recent_crawl_penalizes() {
        let meta = Metadata::default();
        let mut i = inputs("https://github.com/x/y", &meta);
        i.history = Some(CrawlHistory {
            status: CrawlStatus::Success,
            last_seen_at: now() - Duration::days(2),
        });
        let b = score(&ScoreWeights::default(), &i, now());
        assert!((b.domain_bonus - 0.20).abs() < 1e-9);
        assert!((b.crawl_history_bonus - 0.10).abs() < 1e-9);
        assert!((b.freshness_penalty + 0.30).abs() < 1e-9);
    }

    #[test]
    fn test_content_bonus_caps() {
        let meta = Metadata::default()
            .with_title("Python backtest of a trading strategy algorithm")
            .with_description("Quantitative portfolio research")
            .with_strategy_density(5.0);
        let b = score(&ScoreWeights::default(), &inputs("https://a.example", &meta), now());
        // 0.2 density cap plus 0.25 keyword cap
        assert!((b.content_bonus - 0.45).abs() < 1e-9);
    }

    #[test]
    fn test_score_never_negative() {
        let meta = Metadata::default();
        let mut i = inputs("https://a.example", &meta);
        i.quality_estimate = f64::NAN;
        i.history = Some(CrawlHistory {
            status: CrawlStatus::Failed,
            last_seen_at: now(),
        });
        let b = score(&ScoreWeights::default(), &i, now());
        assert!(b.raw_total < 0.0);
        assert_eq!(b.final_score, 0.0);
    }

    #[test]
    fn test_partial_weights_deserialize() {
        let weights: ScoreWeights = toml::from_str("max_score = 3.0").unwrap();
        assert_eq!(weights.max_score, 3.0);
        assert_eq!(weights.source_bonuses["manual"], 0.30);
    }

    #[test]
    fn test_debug_score_unknown_url() {
        let db = Arc::new(Database::in_memory().unwrap());
        let prioritizer = QueuePrioritizer::new(db);
        let err = prioritizer.debug_score("https://missing.example").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_rescale_rejects_negative() {
        let db = Arc::new(Database::in_memory().unwrap());
        let prioritizer = QueuePrioritizer::new(db);
        assert!(prioritizer.rescale_source("manual", -1.0).is_err());
        assert_eq!(prioritizer.rescale_source("manual", 1.5).unwrap(), 0);
    }
}
