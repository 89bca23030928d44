//! Crawl frontier: the queue filtered through the tracker's due check

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::queue::{BatchFilter, DiscoveryQueue, QueueEntry};
use crate::tracker::{CrawlDecision, CrawlOutcome, CrawlStatus, UrlTracker};

/// Refresh intervals used for the due check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshSettings {
    pub default_refresh_days: u32,
    #[serde(default)]
    pub site_overrides: HashMap<String, u32>,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            default_refresh_days: crate::policy::DEFAULT_REFRESH_DAYS,
            site_overrides: HashMap::new(),
        }
    }
}

/// Claimed entries split by the tracker's verdict
#[derive(Debug, Default)]
pub struct FrontierBatch {
    /// Due for a crawl, still `processing`
    pub ready: Vec<QueueEntry>,
    /// Not due, already marked `skipped`
    pub skipped: Vec<(QueueEntry, CrawlDecision)>,
}

/// Hands out queue entries that the tracker says are due
pub struct CrawlFrontier {
    queue: Arc<DiscoveryQueue>,
    tracker: Arc<UrlTracker>,
    settings: RefreshSettings,
}

impl CrawlFrontier {
    pub fn new(queue: Arc<DiscoveryQueue>, tracker: Arc<UrlTracker>, settings: RefreshSettings) -> Self {
        Self {
            queue,
            tracker,
            settings,
        }
    }

    /// Claim up to `limit` entries and skip those that are not due
    ///
    /// A tracker error aborts the call. Entries claimed so far stay
    /// `processing` until [`DiscoveryQueue::expire_stale_claims`] fails them.
    pub fn next_crawlable(&self, limit: usize, filter: &BatchFilter) -> Result<FrontierBatch> {
        self.next_crawlable_at(limit, filter, Utc::now())
    }

    pub fn next_crawlable_at(
        &self,
        limit: usize,
        filter: &BatchFilter,
        now: DateTime<Utc>,
    ) -> Result<FrontierBatch> {
        let claimed = self.queue.next_batch_at(limit, filter, now)?;
        let mut batch = FrontierBatch::default();

        for entry in claimed {
            let decision = self.tracker.should_crawl_at(
                &entry.url,
                self.settings.default_refresh_days,
                &self.settings.site_overrides,
                now,
            )?;

            if decision.crawl {
                batch.ready.push(entry);
            } else {
                self.queue.mark_skipped(&entry.url, decision.reason.as_str())?;
                tracing::debug!(url = %entry.url, reason = %decision.reason, "Skipping entry, not due");
                batch.skipped.push((entry, decision));
            }
        }

        crate::metrics::record_claims(batch.ready.len(), batch.skipped.len());
        tracing::info!(
            ready = batch.ready.len(),
            skipped = batch.skipped.len(),
            "Frontier batch prepared"
        );
        Ok(batch)
    }

    /// Record a finished crawl in the tracker, then close the queue entry
    ///
    /// Quality scores (0-100) are stored on the entry as 0.0 - 1.0.
    pub fn complete(&self, outcome: &CrawlOutcome) -> Result<()> {
        self.complete_at(outcome, Utc::now())
    }

    pub fn complete_at(&self, outcome: &CrawlOutcome, now: DateTime<Utc>) -> Result<()> {
        self.tracker.record_crawl_at(outcome, now)?;

        let success = outcome.status != CrawlStatus::Failed;
        let quality = outcome.quality_score.map(|q| f64::from(q.min(100)) / 100.0);
        let reason = (!success).then(|| match outcome.http_status {
            Some(code) => format!("http status {code}"),
            None => String::from("crawl failed"),
        });

        self.queue
            .mark_done_at(&outcome.url, success, quality, reason.as_deref(), now)?;
        crate::metrics::record_finished(success);
        Ok(())
    }
}
