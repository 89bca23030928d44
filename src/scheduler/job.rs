//! Job definitions and schedule expressions

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use super::error::{SchedulerError, SchedulerResult};

/// Opaque per-job settings handed to the handler
pub type JobConfig = BTreeMap<String, serde_json::Value>;

/// Interval used for unrecognized schedule expressions
pub const FALLBACK_INTERVAL_HOURS: i64 = 1;

/// Longest interval a schedule expression may name
pub const MAX_INTERVAL_DAYS: i64 = 3650;

// ============================================================================
// Priority & Status
// ============================================================================

/// Job priority; higher levels run first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl JobPriority {
    pub fn level(self) -> i64 {
        self as i64
    }

    /// Map a stored level back, clamping out-of-range values
    pub fn from_level(level: i64) -> Self {
        match level {
            i64::MIN..=1 => Self::Low,
            2 => Self::Medium,
            3 => Self::High,
            _ => Self::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl std::str::FromStr for JobPriority {
    type Err = SchedulerError;

    fn from_str(s: &str) -> SchedulerResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" | "1" => Ok(Self::Low),
            "medium" | "2" => Ok(Self::Medium),
            "high" | "3" => Ok(Self::High),
            "critical" | "4" => Ok(Self::Critical),
            other => Err(SchedulerError::invalid_job(
                "priority",
                format!("unknown priority '{other}'"),
            )),
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle state
///
/// A successful run returns the job straight to `Pending` with a new
/// `next_run_at`; `Failed` and `Cancelled` only leave through an operator
/// requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Retrying,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> SchedulerResult<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "retrying" => Ok(Self::Retrying),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(SchedulerError::SerializationError {
                reason: format!("unknown job status '{other}'"),
            }),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Retry Settings
// ============================================================================

/// Per-job retry parameters, stored with the job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_secs: f64,
    pub max_delay_secs: f64,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_secs: 1.0,
            max_delay_secs: 300.0,
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetrySettings {
    pub fn validate(&self) -> SchedulerResult<()> {
        let finite_non_negative = |v: f64| v.is_finite() && v >= 0.0;
        if !self.initial_delay_secs.is_finite() || self.initial_delay_secs <= 0.0 {
            return Err(SchedulerError::invalid_job(
                "retry_policy.initial_delay_secs",
                "must be a finite positive number",
            ));
        }
        if !finite_non_negative(self.max_delay_secs) || self.max_delay_secs < self.initial_delay_secs {
            return Err(SchedulerError::invalid_job(
                "retry_policy.max_delay_secs",
                "must be finite and at least initial_delay_secs",
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(SchedulerError::invalid_job(
                "retry_policy.backoff_factor",
                "must be at least 1.0",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Schedule Expressions
// ============================================================================

/// Parsed recurrence of a job
///
/// Grammar: `every_<N><m|h|d>` (`every_30m`, `every_6h`, `every_1d`) or
/// `every <N> minutes|hours|days`. Anything else falls back to hourly with
/// `recognized == false`, as does any interval over [`MAX_INTERVAL_DAYS`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleExpression {
    pub raw: String,
    pub interval: Duration,
    pub recognized: bool,
}

impl ScheduleExpression {
    pub fn parse(raw: &str) -> Self {
        static COMPACT_RE: OnceLock<Regex> = OnceLock::new();
        static LONG_RE: OnceLock<Regex> = OnceLock::new();

        let compact = COMPACT_RE
            .get_or_init(|| Regex::new(r"^every_(\d+)([mhd])$").expect("Invalid regex pattern"));
        let long = LONG_RE.get_or_init(|| {
            Regex::new(r"^every\s+(\d+)\s+(minutes?|mins?|hours?|hrs?|days?)$")
                .expect("Invalid regex pattern")
        });

        let normalized = raw.trim().to_ascii_lowercase();
        let parsed = compact
            .captures(&normalized)
            .or_else(|| long.captures(&normalized))
            .and_then(|caps| {
                let n: i64 = caps[1].parse().ok().filter(|n| *n > 0)?;
                match caps[2].chars().next()? {
                    'm' => Duration::try_minutes(n),
                    'h' => Duration::try_hours(n),
                    'd' => Duration::try_days(n),
                    _ => None,
                }
            })
            .filter(|interval| *interval <= Duration::days(MAX_INTERVAL_DAYS));

        match parsed {
            Some(interval) => Self {
                raw: raw.to_string(),
                interval,
                recognized: true,
            },
            None => Self {
                raw: raw.to_string(),
                interval: Duration::hours(FALLBACK_INTERVAL_HOURS),
                recognized: false,
            },
        }
    }

    /// Next run after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.interval
    }
}

impl fmt::Display for ScheduleExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// Stored job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub job_type: String,
    pub priority: JobPriority,
    pub schedule_expression: String,
    pub config: JobConfig,
    pub retry: RetrySettings,
    pub created_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    /// Failed attempts since the last success
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub metadata: JobConfig,
}

impl Job {
    pub fn schedule(&self) -> ScheduleExpression {
        ScheduleExpression::parse(&self.schedule_expression)
    }
}

/// Definition of a job to create
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub job_type: String,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default = "default_schedule")]
    pub schedule_expression: String,
    #[serde(default)]
    pub config: JobConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub metadata: JobConfig,
    /// First run at creation instead of one interval later
    #[serde(default)]
    pub run_immediately: bool,
}

fn default_schedule() -> String {
    String::from("every_1h")
}

impl NewJob {
    pub fn new(name: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            priority: JobPriority::default(),
            schedule_expression: default_schedule(),
            config: JobConfig::new(),
            retry: RetrySettings::default(),
            metadata: JobConfig::new(),
            run_immediately: false,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_schedule(mut self, expression: impl Into<String>) -> Self {
        self.schedule_expression = expression.into();
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn run_immediately(mut self) -> Self {
        self.run_immediately = true;
        self
    }

    /// Validate and materialize into a pending [`Job`]
    pub fn into_job(self, now: DateTime<Utc>) -> SchedulerResult<Job> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::invalid_job("name", "must not be empty"));
        }
        if self.job_type.trim().is_empty() {
            return Err(SchedulerError::invalid_job("job_type", "must not be empty"));
        }
        self.retry.validate()?;

        let schedule = ScheduleExpression::parse(&self.schedule_expression);
        let next_run_at = if self.run_immediately {
            now
        } else {
            schedule.next_after(now)
        };

        Ok(Job {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.name.trim().to_string(),
            job_type: self.job_type.trim().to_string(),
            priority: self.priority,
            schedule_expression: self.schedule_expression,
            config: self.config,
            retry: self.retry,
            created_at: now,
            next_run_at,
            last_run_at: None,
            status: JobStatus::Pending,
            retry_count: 0,
            last_error: None,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_compact_schedule_forms() {
        assert_eq!(ScheduleExpression::parse("every_30m").interval, Duration::minutes(30));
        assert_eq!(ScheduleExpression::parse("every_6h").interval, Duration::hours(6));
        assert_eq!(ScheduleExpression::parse("every_1d").interval, Duration::days(1));
        assert!(ScheduleExpression::parse("every_1d").recognized);
    }

    #[test]
    fn test_long_schedule_form() {
        let expr = ScheduleExpression::parse("every 2 hours");
        assert!(expr.recognized);
        assert_eq!(expr.interval, Duration::hours(2));
        assert_eq!(ScheduleExpression::parse("Every 15 Minutes").interval, Duration::minutes(15));
    }

    #[test]
    fn test_unrecognized_schedule_runs_hourly() {
        for raw in ["0 * * * *", "every_0h", "every_5w", "every_99999999999999d", ""] {
            let expr = ScheduleExpression::parse(raw);
            assert!(!expr.recognized, "{raw}");
            assert_eq!(expr.interval, Duration::hours(1));
        }
    }

    #[test]
    fn test_priority_levels_round_trip() {
        for p in [JobPriority::Low, JobPriority::Medium, JobPriority::High, JobPriority::Critical] {
            assert_eq!(JobPriority::from_level(p.level()), p);
        }
        assert_eq!(JobPriority::from_level(99), JobPriority::Critical);
        assert_eq!("HIGH".parse::<JobPriority>().unwrap(), JobPriority::High);
        assert!("urgent".parse::<JobPriority>().is_err());
    }

    #[test]
    fn test_new_job_first_run() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let job = NewJob::new("sweep", "queue-cleanup")
            .with_schedule("every_6h")
            .into_job(now)
            .unwrap();
        assert_eq!(job.next_run_at, now + Duration::hours(6));
        assert_eq!(job.status, JobStatus::Pending);

        let job = NewJob::new("sweep", "queue-cleanup")
            .run_immediately()
            .into_job(now)
            .unwrap();
        assert_eq!(job.next_run_at, now);
    }

    #[test]
    fn test_new_job_validation() {
        let now = Utc::now();
        assert!(NewJob::new(" ", "x").into_job(now).is_err());
        let bad_retry = RetrySettings {
            backoff_factor: 0.5,
            ..Default::default()
        };
        assert!(NewJob::new("a", "x").with_retry(bad_retry).into_job(now).is_err());
    }
}
