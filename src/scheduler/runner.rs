//! Job execution: handler registry, bounded worker pool and polling loop

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;

use super::error::SchedulerError;
use super::job::{Job, NewJob};
use super::retry::{with_retry_if, ErrorClass, RetryPolicy};
use super::store::JobQueue;
use crate::error::{ClassifiedError, Error, ErrorCategory, Result};

/// Minimum gap between a successful run and the next one
const MIN_RESCHEDULE_SECS: i64 = 1;

// ============================================================================
// Handler Interface
// ============================================================================

/// Failure reported by a job handler
#[derive(Debug, Clone, PartialEq)]
pub struct JobError {
    pub class: ErrorClass,
    pub message: String,
}

impl JobError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn invalid_target(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::InvalidTarget, message)
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.class, self.message)
    }
}

impl std::error::Error for JobError {}

impl From<Error> for JobError {
    fn from(err: Error) -> Self {
        let class = if err.is_recoverable() {
            ErrorClass::Transient
        } else {
            match err.category() {
                ErrorCategory::Data | ErrorCategory::Config => ErrorClass::InvalidTarget,
                _ => ErrorClass::Unknown,
            }
        };
        Self::new(class, err.to_string())
    }
}

/// Work performed for one `job_type`
///
/// Handlers receive the whole job, including its opaque `config`, and
/// return a short human-readable summary on success.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job) -> std::result::Result<String, JobError>;
}

// ============================================================================
// Outcomes
// ============================================================================

/// What happened to a job after one execution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum JobRunOutcome {
    Succeeded {
        summary: String,
        next_run_at: DateTime<Utc>,
    },
    Retrying {
        error: String,
        attempt: u32,
        next_run_at: DateTime<Utc>,
    },
    Failed {
        error: String,
    },
    /// The job left `running` (operator cancel) before the outcome was stored
    Superseded,
}

impl JobRunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
            Self::Superseded => "superseded",
        }
    }
}

/// Counts for one scheduler tick
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickSummary {
    pub claimed: usize,
    pub succeeded: usize,
    pub retrying: usize,
    pub failed: usize,
    pub superseded: usize,
    /// Executions whose outcome could not be stored
    pub errors: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: &JobRunOutcome) {
        match outcome {
            JobRunOutcome::Succeeded { .. } => self.succeeded += 1,
            JobRunOutcome::Retrying { .. } => self.retrying += 1,
            JobRunOutcome::Failed { .. } => self.failed += 1,
            JobRunOutcome::Superseded => self.superseded += 1,
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Runtime settings of the polling loop
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    /// Upper bound on concurrently running handlers
    pub max_workers: usize,
    /// Prometheus textfile rewritten after every tick
    pub metrics_file: Option<PathBuf>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_workers: 10,
            metrics_file: None,
        }
    }
}

/// Runs due jobs through their registered handlers
pub struct JobScheduler {
    queue: Arc<JobQueue>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    settings: SchedulerSettings,
    store_retry: RetryPolicy,
}

impl JobScheduler {
    pub fn new(queue: Arc<JobQueue>, settings: SchedulerSettings) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            settings,
            store_retry: RetryPolicy::new(super::job::RetrySettings {
                max_retries: 5,
                initial_delay_secs: 0.05,
                max_delay_secs: 2.0,
                backoff_factor: 2.0,
                jitter: true,
            }),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Register the handler for `job_type`, replacing any previous one
    pub fn register(&mut self, job_type: impl Into<String>, handler: impl JobHandler + 'static) {
        let job_type = job_type.into();
        tracing::debug!(job_type = %job_type, "Registered job handler");
        self.handlers.insert(job_type, Arc::new(handler));
    }

    pub fn has_handler(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Validate and store a new job
    pub fn create_job(&self, new_job: NewJob) -> Result<Job> {
        self.create_job_at(new_job, Utc::now())
    }

    pub fn create_job_at(&self, new_job: NewJob, now: DateTime<Utc>) -> Result<Job> {
        let job = new_job.into_job(now)?;
        if !job.schedule().recognized {
            tracing::warn!(job = %job.name, expression = %job.schedule_expression, "Job will run hourly");
        }
        if !self.has_handler(&job.job_type) {
            tracing::warn!(job = %job.name, job_type = %job.job_type, "No handler registered for job type");
        }
        self.queue.add(&job)?;
        Ok(job)
    }

    /// Run one claimed job and store its outcome
    pub async fn execute(&self, job: &Job) -> Result<JobRunOutcome> {
        let result = match self.handlers.get(&job.job_type) {
            None => Err(JobError::invalid_target(format!(
                "no handler registered for job type '{}'",
                job.job_type
            ))),
            Some(handler) => {
                let handler = Arc::clone(handler);
                let owned = job.clone();
                let _timer = crate::metrics::start_job_timer(&job.job_type);
                tracing::info!(job_id = %job.id, name = %job.name, job_type = %job.job_type, "Executing job");

                match tokio::spawn(async move { handler.run(&owned).await }).await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(JobError::new(ErrorClass::Unknown, "handler panicked")),
                    Err(e) => {
                        return Err(SchedulerError::WorkerJoin {
                            job_id: job.id.clone(),
                            reason: e.to_string(),
                        }
                        .into())
                    }
                }
            }
        };

        let outcome = self.finish(job, result, Utc::now()).await?;
        crate::metrics::record_job_execution(&job.job_type, outcome.label());
        Ok(outcome)
    }

    /// Store the outcome of a run that ended at `now`
    pub async fn finish(
        &self,
        job: &Job,
        result: std::result::Result<String, JobError>,
        now: DateTime<Utc>,
    ) -> Result<JobRunOutcome> {
        match result {
            Ok(summary) => {
                let next_run_at = job
                    .schedule()
                    .next_after(now)
                    .max(now + chrono::Duration::seconds(MIN_RESCHEDULE_SECS));
                let applied = self
                    .persist(|| self.queue.complete_run(&job.id, next_run_at))
                    .await?;
                if !applied {
                    return Ok(JobRunOutcome::Superseded);
                }
                tracing::info!(job_id = %job.id, name = %job.name, %next_run_at, summary = %summary, "Job succeeded");
                Ok(JobRunOutcome::Succeeded {
                    summary,
                    next_run_at,
                })
            }
            Err(err) => {
                let policy = RetryPolicy::new(job.retry.clone());
                let attempt = job.retry_count;
                let message = err.to_string();

                if policy.should_retry(attempt, err.class) {
                    let delay = policy.calculate_delay(attempt);
                    let delay = chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::days(1))
                        .max(chrono::Duration::seconds(MIN_RESCHEDULE_SECS));
                    let next_run_at = now + delay;
                    let applied = self
                        .persist(|| {
                            self.queue
                                .schedule_retry(&job.id, next_run_at, attempt + 1, &message)
                        })
                        .await?;
                    if !applied {
                        return Ok(JobRunOutcome::Superseded);
                    }
                    tracing::warn!(
                        job_id = %job.id,
                        name = %job.name,
                        attempt = attempt + 1,
                        %next_run_at,
                        error = %message,
                        "Job failed, retry scheduled"
                    );
                    Ok(JobRunOutcome::Retrying {
                        error: message,
                        attempt: attempt + 1,
                        next_run_at,
                    })
                } else {
                    let applied = self
                        .persist(|| self.queue.fail_permanently(&job.id, attempt, &message))
                        .await?;
                    if !applied {
                        return Ok(JobRunOutcome::Superseded);
                    }
                    tracing::error!(
                        job_id = %job.id,
                        name = %job.name,
                        retries = attempt,
                        error = %message,
                        "Job failed permanently"
                    );
                    Ok(JobRunOutcome::Failed { error: message })
                }
            }
        }
    }

    /// Store writes retried while the database is busy
    async fn persist<F>(&self, write: F) -> Result<bool>
    where
        F: Fn() -> Result<bool>,
    {
        let write = &write;
        with_retry_if(
            &self.store_retry,
            move || async move { write() },
            |e: &Error| e.is_recoverable(),
        )
        .await
    }

    /// Claim every job due at `now` and run them on the worker pool
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let jobs = self.queue.claim_ready(now, usize::MAX)?;
        let mut summary = TickSummary {
            claimed: jobs.len(),
            ..Default::default()
        };
        if jobs.is_empty() {
            return Ok(summary);
        }

        let workers = self.settings.max_workers.max(1);
        let results: Vec<(String, Result<JobRunOutcome>)> = stream::iter(jobs)
            .map(|job| async move {
                let outcome = self.execute(&job).await;
                (job.id, outcome)
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        for (job_id, result) in results {
            match result {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(job_id = %job_id, error = %e, "Job outcome could not be stored");
                }
            }
        }

        tracing::info!(
            claimed = summary.claimed,
            succeeded = summary.succeeded,
            retrying = summary.retrying,
            failed = summary.failed,
            "Scheduler tick complete"
        );
        Ok(summary)
    }

    /// Tick until `shutdown` flips to `true`, sleeping `poll_interval` between ticks
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            max_workers = self.settings.max_workers,
            "Job scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.tick(Utc::now()).await {
                tracing::error!(error = %e, "Scheduler tick failed");
            }
            self.write_metrics();

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Job scheduler stopped");
        Ok(())
    }

    pub fn write_metrics(&self) {
        if let Some(path) = &self.settings.metrics_file {
            if let Err(e) = crate::metrics::write_textfile(path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to write metrics file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{JobStatus, RetrySettings};
    use crate::storage::Database;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fails(ErrorClass);

    #[async_trait]
    impl JobHandler for Fails {
        async fn run(&self, _job: &Job) -> std::result::Result<String, JobError> {
            Err(JobError::new(self.0, "boom"))
        }
    }

    struct Counts(Arc<AtomicUsize>);

    #[async_trait]
    impl JobHandler for Counts {
        async fn run(&self, _job: &Job) -> std::result::Result<String, JobError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("run {n}"))
        }
    }

    struct Panics;

    #[async_trait]
    impl JobHandler for Panics {
        async fn run(&self, _job: &Job) -> std::result::Result<String, JobError> {
            panic!("handler bug");
        }
    }

    fn scheduler() -> JobScheduler {
        let db = Arc::new(Database::in_memory().unwrap());
        JobScheduler::new(Arc::new(JobQueue::new(db)), SchedulerSettings::default())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_success_reschedules() {
        let mut sched = scheduler();
        let runs = Arc::new(AtomicUsize::new(0));
        sched.register("count", Counts(runs.clone()));
        let job = sched
            .create_job_at(
                NewJob::new("counter", "count").with_schedule("every_30m").run_immediately(),
                t0(),
            )
            .unwrap();

        let summary = sched.tick(t0()).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let stored = sched.queue().get(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.next_run_at > t0() + chrono::Duration::minutes(29));
    }

    #[tokio::test]
    async fn test_retryable_failure_backs_off() {
        let mut sched = scheduler();
        sched.register("flaky", Fails(ErrorClass::Transient));
        let job = sched
            .create_job_at(NewJob::new("flaky", "flaky").run_immediately(), t0())
            .unwrap();

        let claimed = sched.queue().claim_ready(t0(), 1).unwrap();
        let outcome = sched.execute(&claimed[0]).await.unwrap();
        assert!(matches!(outcome, JobRunOutcome::Retrying { attempt: 1, .. }));

        let stored = sched.queue().get(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Retrying);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("[transient] boom"));
    }

    #[tokio::test]
    async fn test_retries_exhaust_to_failed() {
        let mut sched = scheduler();
        sched.register("flaky", Fails(ErrorClass::Timeout));
        let retry = RetrySettings {
            max_retries: 1,
            ..Default::default()
        };
        let job = sched
            .create_job_at(NewJob::new("flaky", "flaky").with_retry(retry).run_immediately(), t0())
            .unwrap();

        let first = sched.queue().claim_ready(t0(), 1).unwrap().remove(0);
        let outcome = sched.finish(&first, Err(JobError::new(ErrorClass::Timeout, "slow")), t0()).await.unwrap();
        assert_eq!(outcome.label(), "retrying");

        let later = t0() + chrono::Duration::hours(1);
        let second = sched.queue().claim_ready(later, 1).unwrap().remove(0);
        assert_eq!(second.retry_count, 1);
        let outcome = sched.execute(&second).await.unwrap();
        assert_eq!(outcome.label(), "failed");
        assert_eq!(
            sched.queue().get(&job.id).unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_unknown_job_type_fails_permanently() {
        let sched = scheduler();
        sched
            .create_job_at(NewJob::new("orphan", "nobody-handles-this").run_immediately(), t0())
            .unwrap();
        let summary = sched.tick(t0()).await.unwrap();
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_is_retryable() {
        let mut sched = scheduler();
        sched.register("panics", Panics);
        sched
            .create_job_at(NewJob::new("panicky", "panics").run_immediately(), t0())
            .unwrap();
        let summary = sched.tick(t0()).await.unwrap();
        assert_eq!(summary.retrying, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let sched = scheduler();
        let (tx, rx) = watch::channel(true);
        sched.run(rx).await.unwrap();
        drop(tx);
    }

    #[test]
    fn test_job_error_from_crate_error() {
        let err: JobError = Error::invalid("url", "bad").into();
        assert_eq!(err.class, ErrorClass::InvalidTarget);
        let err: JobError = Error::other("unexpected").into();
        assert_eq!(err.class, ErrorClass::Unknown);
    }
}
