//! Periodic job scheduling with retry and backoff
//!
//! Jobs are named, typed units of recurring work persisted in SQLite. Each
//! job carries a schedule expression (`every_30m`, `every 6 hours`, ...), a
//! priority and a retry policy. The [`JobScheduler`] polls for due jobs,
//! claims them atomically and runs them through the [`JobHandler`]
//! registered for their `job_type`, bounded by a worker limit.
//!
//! # Job Lifecycle
//!
//! ```text
//!            claim                success
//! pending ──────────► running ─────────────► pending (next interval)
//!    ▲                  │  │
//!    │ retry due        │  │ permanent error / retries exhausted
//!    │                  │  └──────────────────► failed
//! retrying ◄────────────┘ retryable error
//!
//! operator: pending/running/retrying ──cancel──► cancelled
//!           failed/cancelled ────────requeue───► pending
//! ```
//!
//! # Modules
//!
//! - [`job`]: job definitions, priorities, statuses and schedule expressions
//! - [`retry`]: error classes and exponential backoff
//! - [`store`]: SQLite-backed [`JobQueue`]
//! - [`runner`]: handler trait, worker pool and polling loop
//! - [`handlers`]: built-in queue and tracker maintenance jobs
//! - [`error`]: scheduler error type

pub mod error;
pub mod handlers;
pub mod job;
pub mod retry;
pub mod runner;
pub mod store;

pub use error::{SchedulerError, SchedulerResult};
pub use handlers::{default_jobs, register_builtin_handlers};
pub use job::{Job, JobConfig, JobPriority, JobStatus, NewJob, RetrySettings, ScheduleExpression};
pub use retry::{with_retry_if, ErrorClass, RetryPolicy};
pub use runner::{
    JobError, JobHandler, JobRunOutcome, JobScheduler, SchedulerSettings, TickSummary,
};
pub use store::JobQueue;
