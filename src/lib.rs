//! crawl-scheduler - crawl-target discovery and execution scheduling
//!
//! Decides which URLs a crawler should fetch next and runs the recurring
//! maintenance around that decision, backed by a single embedded SQLite store.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`detector`] - Content hashing, header comparison, similarity and quality estimates
//! - [`tracker`] - Per-URL crawl history and the crawl-due decision
//! - [`policy`] - Refresh intervals per site and content type, with recommendations
//! - [`queue`] - Discovery queue, priority scoring and the crawl frontier
//! - [`scheduler`] - Persistent periodic jobs with retry and backoff
//! - [`storage`] - SQLite database handle and schema
//! - [`config`] - Configuration management and settings
//! - [`metrics`] - Prometheus counters for queue and scheduler activity
//! - [`models`] - Shared value types
//! - [`utils`] - URL and text helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use crawl_scheduler::queue::{BatchFilter, CandidateUrl, DiscoveryQueue};
//! use crawl_scheduler::storage::Database;
//!
//! fn main() -> crawl_scheduler::Result<()> {
//!     let db = Arc::new(Database::open("data/crawl.db", std::time::Duration::from_secs(5))?);
//!     let queue = DiscoveryQueue::new(db);
//!     queue.add(&[CandidateUrl::new("https://example.com/news/1", "feed")])?;
//!     let batch = queue.next_batch(10, &BatchFilter::default())?;
//!     println!("claimed {} entries", batch.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod detector;
pub mod error;
pub mod metrics;
pub mod models;
pub mod policy;
pub mod queue;
pub mod scheduler;
pub mod storage;
pub mod tracker;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::detector::{ChangeDetector, ChangeVerdict, HttpMeta};
    pub use crate::error::{ClassifiedError, Error, ErrorCategory, Result};
    pub use crate::models::Metadata;
    pub use crate::policy::{PolicyTarget, RefreshPolicyManager};
    pub use crate::queue::{
        BatchFilter, CandidateUrl, CrawlFrontier, DiscoveryQueue, QueueEntry, QueuePrioritizer,
        QueueStatus,
    };
    pub use crate::scheduler::{Job, JobHandler, JobQueue, JobScheduler, NewJob, RetryPolicy};
    pub use crate::storage::Database;
    pub use crate::tracker::{CrawlDecision, CrawlOutcome, CrawlStatus, UrlTracker};
}

// Direct re-exports for convenience
pub use error::{Error, Result};
