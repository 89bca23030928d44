//! Prometheus metrics for the discovery queue and job scheduler
//!
//! This module provides metrics tracking for:
//! - Queue: candidates added/skipped/rejected, claims, finished entries, size
//! - Scheduler: job executions by outcome, handler duration
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use std::path::Path;
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for queue metrics
struct QueueMetrics {
    candidates: CounterVec,
    claimed: CounterVec,
    finished: CounterVec,
    queue_size: Gauge,
}

/// Container for job scheduler metrics
struct SchedulerMetrics {
    executions: CounterVec,
    duration: HistogramVec,
}

static QUEUE_METRICS: OnceLock<QueueMetrics> = OnceLock::new();

static SCHEDULER_METRICS: OnceLock<SchedulerMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; only the first call registers anything.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let queue = QueueMetrics {
        candidates: register_counter_vec!(
            "crawlsched_queue_candidates_total",
            "Discovery candidates by intake outcome",
            &["outcome"]
        )?,
        claimed: register_counter_vec!(
            "crawlsched_queue_claimed_total",
            "Queue entries claimed for crawling",
            &["disposition"]
        )?,
        finished: register_counter_vec!(
            "crawlsched_queue_finished_total",
            "Claimed queue entries finished, by status",
            &["status"]
        )?,
        queue_size: register_gauge!(
            "crawlsched_queue_size",
            "Queued entries awaiting a claim at the last maintenance pass"
        )?,
    };

    let scheduler = SchedulerMetrics {
        executions: register_counter_vec!(
            "crawlsched_job_executions_total",
            "Job executions by job type and outcome",
            &["job_type", "outcome"]
        )?,
        duration: register_histogram_vec!(
            "crawlsched_job_duration_seconds",
            "Job handler duration in seconds",
            &["job_type"],
            vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
        )?,
    };

    QUEUE_METRICS
        .set(queue)
        .map_err(|_| "Queue metrics already initialized")?;
    SCHEDULER_METRICS
        .set(scheduler)
        .map_err(|_| "Scheduler metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    QUEUE_METRICS.get().is_some() && SCHEDULER_METRICS.get().is_some()
}

// ============================================================================
// Export
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Write the current metrics to `path` for a textfile collector
///
/// The file is replaced atomically so a scraper never reads a partial write.
pub fn write_textfile(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let text = encode_metrics()?;
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ============================================================================
// Recording
// ============================================================================

/// Record the outcome counts of one discovery batch
pub fn record_candidates(added: usize, skipped: usize, failed: usize) {
    let Some(m) = QUEUE_METRICS.get() else {
        return;
    };

    for (outcome, count) in [("added", added), ("skipped", skipped), ("error", failed)] {
        if count > 0 {
            m.candidates
                .with_label_values(&[outcome])
                .inc_by(count as f64);
        }
    }
}

/// Record claimed entries split into crawlable and not-due
pub fn record_claims(ready: usize, not_due: usize) {
    let Some(m) = QUEUE_METRICS.get() else {
        return;
    };

    if ready > 0 {
        m.claimed.with_label_values(&["ready"]).inc_by(ready as f64);
    }
    if not_due > 0 {
        m.claimed
            .with_label_values(&["not-due"])
            .inc_by(not_due as f64);
    }
}

/// Record one finished queue entry
pub fn record_finished(success: bool) {
    if let Some(m) = QUEUE_METRICS.get() {
        let status = if success { "completed" } else { "failed" };
        m.finished.with_label_values(&[status]).inc();
    }
}

pub fn set_queue_size(queued: u64) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.queue_size.set(queued as f64);
    }
}

/// Record one job execution
pub fn record_job_execution(job_type: &str, outcome: &str) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.executions.with_label_values(&[job_type, outcome]).inc();
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start a handler timer for `job_type`
pub fn start_job_timer(job_type: &str) -> MetricsTimer {
    match SCHEDULER_METRICS.get() {
        Some(m) => MetricsTimer::new(m.duration.with_label_values(&[job_type]).start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================
