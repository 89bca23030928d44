//! Built-in job handlers for queue and tracker maintenance

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::job::{Job, JobPriority, NewJob};
use super::retry::ErrorClass;
use super::runner::{JobError, JobHandler, JobScheduler};
use crate::queue::{CandidateUrl, DiscoveryQueue, QueuePrioritizer};
use crate::tracker::UrlTracker;

pub const REPRIORITIZE: &str = "reprioritize";
pub const QUEUE_CLEANUP: &str = "queue-cleanup";
pub const QUEUE_MAINTENANCE: &str = "queue-maintenance";
pub const ENQUEUE_URLS: &str = "enqueue-urls";

/// Queue size above which maintenance logs a backlog warning
pub const QUEUE_HIGH_WATER: u64 = 1000;

/// Queue size below which maintenance logs a starvation warning
pub const QUEUE_LOW_WATER: u64 = 10;

fn config_u64(job: &Job, key: &str, default: u64) -> Result<u64, JobError> {
    match job.config.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v.as_u64().ok_or_else(|| {
            JobError::invalid_target(format!("config '{key}' must be a non-negative integer"))
        }),
    }
}

fn config_u32(job: &Job, key: &str, default: u32) -> Result<u32, JobError> {
    let value = config_u64(job, key, u64::from(default))?;
    u32::try_from(value)
        .map_err(|_| JobError::invalid_target(format!("config '{key}' is out of range")))
}

fn config_str<'a>(job: &'a Job, key: &str) -> Option<&'a str> {
    job.config.get(key).and_then(Value::as_str)
}

/// Run blocking store work off the async worker threads
async fn blocking<T, F>(work: F) -> Result<T, JobError>
where
    T: Send + 'static,
    F: FnOnce() -> crate::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result.map_err(JobError::from),
        Err(e) => Err(JobError::new(ErrorClass::Unknown, format!("blocking task failed: {e}"))),
    }
}

/// Rescore every queued entry
pub struct ReprioritizeHandler {
    prioritizer: Arc<QueuePrioritizer>,
}

impl ReprioritizeHandler {
    pub fn new(prioritizer: Arc<QueuePrioritizer>) -> Self {
        Self { prioritizer }
    }
}

#[async_trait]
impl JobHandler for ReprioritizeHandler {
    async fn run(&self, job: &Job) -> Result<String, JobError> {
        let batch_size = config_u64(job, "batch_size", 1000)?.max(1);
        let batch_size = usize::try_from(batch_size).unwrap_or(usize::MAX);
        let prioritizer = Arc::clone(&self.prioritizer);
        let updated =
            blocking(move || prioritizer.calculate_all_priority_scores(batch_size)).await?;
        Ok(format!("rescored {updated} entries"))
    }
}

/// Purge finished queue entries and stale tracker records
pub struct QueueCleanupHandler {
    queue: Arc<DiscoveryQueue>,
    tracker: Arc<UrlTracker>,
}

impl QueueCleanupHandler {
    pub fn new(queue: Arc<DiscoveryQueue>, tracker: Arc<UrlTracker>) -> Self {
        Self { queue, tracker }
    }
}

#[async_trait]
impl JobHandler for QueueCleanupHandler {
    async fn run(&self, job: &Job) -> Result<String, JobError> {
        let queue_days = config_u32(job, "queue_days", 90)?;
        let tracker_days = config_u32(job, "tracker_days", 365)?;
        let queue = Arc::clone(&self.queue);
        let tracker = Arc::clone(&self.tracker);

        let (entries, records) = blocking(move || {
            let entries = queue.cleanup_older_than(queue_days)?;
            let records = tracker.cleanup_old_records(tracker_days)?;
            Ok((entries, records))
        })
        .await?;

        Ok(format!(
            "removed {entries} queue entries and {records} tracker records"
        ))
    }
}

/// Report queue health, expire abandoned claims and requeue failures
pub struct QueueMaintenanceHandler {
    queue: Arc<DiscoveryQueue>,
}

impl QueueMaintenanceHandler {
    pub fn new(queue: Arc<DiscoveryQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl JobHandler for QueueMaintenanceHandler {
    async fn run(&self, job: &Job) -> Result<String, JobError> {
        let stale_minutes = config_u64(job, "stale_claim_minutes", 60)?;
        let max_retries = config_u32(job, "requeue_max_retries", 3)?;
        let stale_minutes = i64::try_from(stale_minutes).unwrap_or(i64::MAX);
        let max_age = chrono::Duration::try_minutes(stale_minutes)
            .ok_or_else(|| JobError::invalid_target("stale_claim_minutes is out of range"))?;
        let queue = Arc::clone(&self.queue);

        let (stats, expired, requeued) = blocking(move || {
            let expired = queue.expire_stale_claims(max_age)?;
            let requeued = queue.requeue_failed(None, max_retries)?;
            let stats = queue.statistics()?;
            Ok((stats, expired, requeued))
        })
        .await?;

        crate::metrics::set_queue_size(stats.queue_size);
        if stats.queue_size > QUEUE_HIGH_WATER {
            tracing::warn!(queued = stats.queue_size, "Discovery queue backlog is growing");
        } else if stats.queue_size < QUEUE_LOW_WATER {
            tracing::warn!(queued = stats.queue_size, "Discovery queue is nearly empty");
        }

        Ok(format!(
            "queued={} expired={expired} requeued={requeued} success_rate={:.1}%",
            stats.queue_size, stats.success_rate
        ))
    }
}

/// Add the URLs listed in the job's config to the discovery queue
///
/// Config keys: `urls` (array of strings, required), `source` and `category`.
pub struct EnqueueUrlsHandler {
    queue: Arc<DiscoveryQueue>,
}

impl EnqueueUrlsHandler {
    pub fn new(queue: Arc<DiscoveryQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl JobHandler for EnqueueUrlsHandler {
    async fn run(&self, job: &Job) -> Result<String, JobError> {
        let urls: Vec<String> = job
            .config
            .get("urls")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if urls.is_empty() {
            return Err(JobError::invalid_target("config 'urls' lists no URLs"));
        }

        let source = config_str(job, "source").unwrap_or("manual").to_string();
        let category = config_str(job, "category").map(str::to_string);
        let candidates: Vec<CandidateUrl> = urls
            .into_iter()
            .map(|url| {
                let candidate = CandidateUrl::new(url, source.as_str());
                match &category {
                    Some(c) => candidate.with_category(c.as_str()),
                    None => candidate,
                }
            })
            .collect();

        let queue = Arc::clone(&self.queue);
        let summary = blocking(move || queue.add(&candidates)).await?;
        crate::metrics::record_candidates(summary.added, summary.skipped, summary.failed);
        Ok(format!(
            "added={} skipped={} failed={}",
            summary.added, summary.skipped, summary.failed
        ))
    }
}

/// Register every built-in handler on `scheduler`
pub fn register_builtin_handlers(
    scheduler: &mut JobScheduler,
    queue: Arc<DiscoveryQueue>,
    prioritizer: Arc<QueuePrioritizer>,
    tracker: Arc<UrlTracker>,
) {
    scheduler.register(REPRIORITIZE, ReprioritizeHandler::new(prioritizer));
    scheduler.register(
        QUEUE_CLEANUP,
        QueueCleanupHandler::new(Arc::clone(&queue), tracker),
    );
    scheduler.register(QUEUE_MAINTENANCE, QueueMaintenanceHandler::new(Arc::clone(&queue)));
    scheduler.register(ENQUEUE_URLS, EnqueueUrlsHandler::new(queue));
}

/// Standard maintenance jobs created by `jobs create-defaults`
pub fn default_jobs() -> Vec<NewJob> {
    vec![
        NewJob::new("reprioritize-queue", REPRIORITIZE)
            .with_priority(JobPriority::High)
            .with_schedule("every_1h")
            .with_config("batch_size", json!(1000)),
        NewJob::new("queue-maintenance", QUEUE_MAINTENANCE)
            .with_priority(JobPriority::Medium)
            .with_schedule("every_6h")
            .with_config("stale_claim_minutes", json!(60))
            .with_config("requeue_max_retries", json!(3)),
        NewJob::new("queue-cleanup", QUEUE_CLEANUP)
            .with_priority(JobPriority::Low)
            .with_schedule("every_1d")
            .with_config("queue_days", json!(90))
            .with_config("tracker_days", json!(365)),
    ]
}
