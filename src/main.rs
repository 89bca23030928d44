use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crawl_scheduler::config::Config;
use crawl_scheduler::detector::ChangeDetector;
use crawl_scheduler::policy::{PolicyTarget, RefreshPolicyManager};
use crawl_scheduler::queue::{
    parse_candidates_jsonl, BatchFilter, CandidateUrl, CrawlFrontier, DiscoveryQueue,
    QueuePrioritizer,
};
use crawl_scheduler::scheduler::{
    default_jobs, register_builtin_handlers, JobConfig, JobPriority, JobQueue, JobScheduler,
    JobStatus, NewJob, RetrySettings,
};
use crawl_scheduler::storage::Database;
use crawl_scheduler::tracker::{CrawlOutcome, CrawlStatus, UrlTracker};

#[derive(Parser)]
#[command(
    name = "crawlsched",
    version,
    about = "Crawl-target discovery queue, URL tracking and recurring job scheduler",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file (environment variables are used otherwise)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Discovery queue operations
    #[command(subcommand)]
    Queue(QueueCommand),

    /// URL tracker operations
    #[command(subcommand)]
    Tracker(TrackerCommand),

    /// Refresh policy operations
    #[command(subcommand)]
    Policy(PolicyCommand),

    /// Recurring job operations
    #[command(subcommand)]
    Jobs(JobsCommand),
}

#[derive(Subcommand)]
enum QueueCommand {
    /// Add URLs to the discovery queue
    Add {
        #[arg(required = true)]
        urls: Vec<String>,

        /// Discovery source (manual, api_discovery, feed, sitemap, search, ...)
        #[arg(short, long, default_value = "manual")]
        source: String,

        #[arg(short, long)]
        category: Option<String>,

        /// Base priority, 1 (most urgent) to 10
        #[arg(short, long)]
        priority: Option<u8>,

        /// Quality estimate, 0.0 to 1.0
        #[arg(short, long)]
        quality: Option<f64>,
    },

    /// Import candidates from a JSON Lines file
    Import { file: PathBuf },

    /// Show queue statistics
    Status,

    /// Claim the next crawlable entries
    Next {
        #[arg(short = 'n', long)]
        count: Option<usize>,

        /// Restrict to these categories (repeatable)
        #[arg(short, long)]
        category: Vec<String>,

        #[arg(long)]
        min_quality: Option<f64>,
    },

    /// Finish a claimed entry
    Done {
        url: String,

        /// Mark the entry failed instead of completed
        #[arg(long)]
        failed: bool,

        #[arg(short, long)]
        quality: Option<f64>,

        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Recompute priority scores
    Reprioritize {
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Rescore one batch only instead of the whole queue
        #[arg(long)]
        single_batch: bool,
    },

    /// Delete finished entries older than the retention window
    Cleanup {
        #[arg(short, long)]
        days: Option<u32>,
    },

    /// Show the score components of one entry
    DebugScore { url: String },

    /// Show the priority score distribution
    PriorityStats,

    /// Return failed entries to the queue
    Requeue {
        /// Requeue this URL regardless of its retry count
        #[arg(short, long)]
        url: Option<String>,

        #[arg(long, default_value = "3")]
        max_retries: u32,
    },

    /// Fail entries claimed longer ago than the given age
    ExpireClaims {
        #[arg(short, long, default_value = "60")]
        minutes: i64,
    },
}

#[derive(Subcommand)]
enum TrackerCommand {
    /// Decide whether a URL is due for a crawl
    Check { url: String },

    /// Record a crawl attempt
    Record(RecordArgs),

    /// Per-site statistics
    Stats {
        #[arg(short, long)]
        site: Option<String>,
    },

    /// URLs that were re-crawled most often per day
    Changing {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Delete records not seen within the retention window
    Cleanup {
        #[arg(short, long)]
        days: Option<u32>,
    },
}

#[derive(Args)]
struct RecordArgs {
    url: String,

    /// Precomputed content hash
    #[arg(long, conflicts_with = "content_file")]
    hash: Option<String>,

    /// Hash, measure and grade this file's content
    #[arg(long)]
    content_file: Option<PathBuf>,

    /// Crawl status (success, failed, partial)
    #[arg(long, default_value = "success")]
    status: CrawlStatus,

    /// Quality score, 0 to 100
    #[arg(short, long)]
    quality: Option<u8>,

    #[arg(long)]
    method: Option<String>,

    #[arg(long)]
    etag: Option<String>,

    #[arg(long)]
    last_modified: Option<String>,

    #[arg(long)]
    http_status: Option<u16>,

    /// Also close the URL's queue entry
    #[arg(long)]
    finish_queue: bool,
}

#[derive(Subcommand)]
enum PolicyCommand {
    /// Compute the refresh interval for a URL
    Interval {
        url: String,

        #[arg(long)]
        content_type: Option<String>,

        #[arg(short, long)]
        quality: Option<u8>,

        /// Observed changes per day
        #[arg(long)]
        change_frequency: Option<f64>,
    },

    /// Detect the content type of a URL
    Detect {
        url: String,

        #[arg(short, long)]
        title: Option<String>,

        #[arg(long)]
        content_file: Option<PathBuf>,
    },

    /// Set a refresh interval
    Set {
        #[arg(long, conflicts_with_all = ["content_type", "default"])]
        site: Option<String>,

        #[arg(long, conflicts_with = "default")]
        content_type: Option<String>,

        /// Set the global default
        #[arg(long)]
        default: bool,

        #[arg(short, long)]
        days: u32,
    },

    /// Recommend interval changes from the tracker history
    Recommend,
}

#[derive(Subcommand)]
enum JobsCommand {
    /// Create a recurring job
    CreateJob {
        #[arg(short, long)]
        name: String,

        #[arg(short = 't', long = "type")]
        job_type: String,

        #[arg(short, long, default_value = "medium")]
        priority: JobPriority,

        /// Schedule expression, e.g. every_30m or "every 6 hours"
        #[arg(short, long, default_value = "every_1h")]
        schedule: String,

        /// Handler configuration as a JSON object
        #[arg(long)]
        job_config: Option<String>,

        #[arg(long)]
        max_retries: Option<u32>,

        /// Run at the next poll instead of one interval from now
        #[arg(long)]
        now: bool,
    },

    /// Create the standard maintenance jobs that do not exist yet
    CreateDefaults,

    /// List jobs
    ListJobs {
        /// Only jobs due now
        #[arg(long, conflicts_with = "status")]
        ready: bool,

        #[arg(long)]
        status: Option<JobStatus>,
    },

    /// Cancel a job
    Cancel { id: String },

    /// Return a failed or cancelled job to pending
    Requeue { id: String },

    /// Run the job scheduler
    RunScheduler {
        /// Run one tick and exit
        #[arg(long)]
        once: bool,

        /// Prometheus textfile rewritten after every tick
        #[arg(long)]
        metrics_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.database.path = db.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }

    setup_tracing(&config.logging.format, &config.logging.level, cli.verbose)?;

    if let Err(e) = crawl_scheduler::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics disabled");
    }

    let app = App::open(config)?;

    match cli.command {
        Commands::Queue(cmd) => app.queue_command(cmd)?,
        Commands::Tracker(cmd) => app.tracker_command(cmd)?,
        Commands::Policy(cmd) => app.policy_command(cmd)?,
        Commands::Jobs(cmd) => app.jobs_command(cmd).await?,
    }

    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if verbose => tracing_subscriber::EnvFilter::new("crawl_scheduler=debug,crawlsched=debug,info"),
        Err(_) => tracing_subscriber::EnvFilter::try_new(format!(
            "crawl_scheduler={level},crawlsched={level},warn"
        ))
        .context("Invalid log level")?,
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_content(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read content file: {}", path.display()))
}

/// Shared handles built once per invocation
struct App {
    config: Config,
    db: Arc<Database>,
}

impl App {
    fn open(config: Config) -> Result<Self> {
        let db = Database::open(&config.database.path, config.busy_timeout()).with_context(|| {
            format!("Failed to open database: {}", config.database.path.display())
        })?;
        Ok(Self {
            config,
            db: Arc::new(db),
        })
    }

    fn discovery_queue(&self) -> DiscoveryQueue {
        DiscoveryQueue::with_weights(Arc::clone(&self.db), self.config.score_weights())
    }

    fn prioritizer(&self) -> QueuePrioritizer {
        QueuePrioritizer::with_weights(Arc::clone(&self.db), self.config.score_weights())
    }

    fn tracker(&self) -> UrlTracker {
        UrlTracker::new(Arc::clone(&self.db))
    }

    fn frontier(&self) -> CrawlFrontier {
        CrawlFrontier::new(
            Arc::new(self.discovery_queue()),
            Arc::new(self.tracker()),
            self.config.refresh_settings(),
        )
    }

    fn policy_manager(&self) -> Result<RefreshPolicyManager> {
        match &self.config.policy.file {
            Some(path) => Ok(RefreshPolicyManager::load(path)?),
            None => Ok(RefreshPolicyManager::with_defaults()),
        }
    }

    fn job_queue(&self) -> Arc<JobQueue> {
        Arc::new(JobQueue::new(Arc::clone(&self.db)))
    }

    fn queue_command(&self, cmd: QueueCommand) -> Result<()> {
        let queue = self.discovery_queue();

        match cmd {
            QueueCommand::Add {
                urls,
                source,
                category,
                priority,
                quality,
            } => {
                let candidates: Vec<CandidateUrl> = urls
                    .into_iter()
                    .map(|url| {
                        let mut candidate = CandidateUrl::new(url, source.as_str());
                        candidate.category = category.clone();
                        candidate.priority = priority;
                        candidate.quality_estimate = quality;
                        candidate
                    })
                    .collect();
                let summary = queue.add(&candidates)?;
                crawl_scheduler::metrics::record_candidates(
                    summary.added,
                    summary.skipped,
                    summary.failed,
                );
                print_json(&summary)?;
            }

            QueueCommand::Import { file } => {
                let reader = BufReader::new(
                    File::open(&file)
                        .with_context(|| format!("Failed to open {}", file.display()))?,
                );
                let (candidates, mut summary) = parse_candidates_jsonl(reader)?;
                summary.merge(queue.add(&candidates)?);
                crawl_scheduler::metrics::record_candidates(
                    summary.added,
                    summary.skipped,
                    summary.failed,
                );
                tracing::info!(
                    file = %file.display(),
                    added = summary.added,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    "Import complete"
                );
                print_json(&summary)?;
            }

            QueueCommand::Status => print_json(&queue.statistics()?)?,

            QueueCommand::Next {
                count,
                category,
                min_quality,
            } => {
                let mut filter = BatchFilter::categories(category);
                if let Some(q) = min_quality {
                    filter = filter.with_min_quality(q);
                }
                let limit = count.unwrap_or(self.config.queue.batch_size);
                let batch = self.frontier().next_crawlable(limit, &filter)?;
                for (entry, decision) in &batch.skipped {
                    println!("skipped\t{}\t{}", entry.url, decision.reason);
                }
                for entry in &batch.ready {
                    println!(
                        "ready\t{}\t{:.4}\t{}\t{}",
                        entry.url, entry.priority_score, entry.source, entry.category
                    );
                }
            }

            QueueCommand::Done {
                url,
                failed,
                quality,
                reason,
            } => {
                queue.mark_done(&url, !failed, quality, reason.as_deref())?;
                crawl_scheduler::metrics::record_finished(!failed);
                println!("{} {}", url, if failed { "failed" } else { "completed" });
            }

            QueueCommand::Reprioritize {
                batch_size,
                single_batch,
            } => {
                let batch_size = batch_size.unwrap_or(self.config.queue.score_batch_size);
                let prioritizer = self.prioritizer();
                let updated = if single_batch {
                    prioritizer.calculate_priority_scores(batch_size)?
                } else {
                    prioritizer.calculate_all_priority_scores(batch_size)?
                };
                println!("Rescored {updated} entries");
            }

            QueueCommand::Cleanup { days } => {
                let days = days.unwrap_or(self.config.queue.cleanup_days);
                let removed = queue.cleanup_older_than(days)?;
                println!("Removed {removed} entries older than {days} days");
            }

            QueueCommand::DebugScore { url } => {
                let breakdown = self.prioritizer().debug_score(&url)?;
                for (name, value) in breakdown.components() {
                    println!("{name:<22}{value:>8.4}");
                }
                println!("{:<22}{:>8.4}", "raw_total", breakdown.raw_total);
                println!("{:<22}{:>8.4}", "final_score", breakdown.final_score);
            }

            QueueCommand::PriorityStats => print_json(&self.prioritizer().priority_statistics()?)?,

            QueueCommand::Requeue { url, max_retries } => {
                let requeued = queue.requeue_failed(url.as_deref(), max_retries)?;
                println!("Requeued {requeued} entries");
            }

            QueueCommand::ExpireClaims { minutes } => {
                let max_age = chrono::Duration::try_minutes(minutes)
                    .context("minutes is out of range")?;
                let expired = queue.expire_stale_claims(max_age)?;
                println!("Expired {expired} stale claims");
            }
        }

        Ok(())
    }

    fn tracker_command(&self, cmd: TrackerCommand) -> Result<()> {
        let tracker = self.tracker();

        match cmd {
            TrackerCommand::Check { url } => {
                let refresh = self.config.refresh_settings();
                let decision = tracker.should_crawl(
                    &url,
                    refresh.default_refresh_days,
                    &refresh.site_overrides,
                )?;
                print_json(&decision)?;
            }

            TrackerCommand::Record(args) => {
                let outcome = build_outcome(args.content_facts()?, &args);
                if args.finish_queue {
                    self.frontier().complete(&outcome)?;
                } else {
                    tracker.record_crawl(&outcome)?;
                }
                match tracker.get_record(&outcome.url)? {
                    Some(record) => print_json(&record)?,
                    None => println!("Recorded {}", outcome.url),
                }
            }

            TrackerCommand::Stats { site } => print_json(&tracker.site_stats(site.as_deref())?)?,

            TrackerCommand::Changing { limit } => {
                for url in tracker.frequently_changing_urls(limit)? {
                    println!(
                        "{}\t{}\t{:.2} days/change\t{} crawls",
                        url.site, url.url, url.days_per_change, url.scrape_count
                    );
                }
            }

            TrackerCommand::Cleanup { days } => {
                let days = days.unwrap_or(self.config.tracker.retention_days);
                let removed = tracker.cleanup_old_records(days)?;
                println!("Removed {removed} records older than {days} days");
            }
        }

        Ok(())
    }

    fn policy_command(&self, cmd: PolicyCommand) -> Result<()> {
        let manager = self.policy_manager()?;

        match cmd {
            PolicyCommand::Interval {
                url,
                content_type,
                quality,
                change_frequency,
            } => {
                let interval = manager.get_refresh_interval(
                    &url,
                    content_type.as_deref(),
                    quality,
                    change_frequency,
                );
                println!("{} days ({})", interval.days, interval.reason_trail());
            }

            PolicyCommand::Detect {
                url,
                title,
                content_file,
            } => {
                let content = content_file.as_deref().map(read_content).transpose()?;
                let detected =
                    manager.detect_content_type(&url, title.as_deref(), content.as_deref(), None);
                println!("{detected}");
            }

            PolicyCommand::Set {
                site,
                content_type,
                default,
                days,
            } => {
                let target = match (site, content_type, default) {
                    (Some(site), _, _) => PolicyTarget::Site(site),
                    (None, Some(content_type), _) => PolicyTarget::ContentType(content_type),
                    (None, None, true) => PolicyTarget::Default,
                    (None, None, false) => {
                        anyhow::bail!("one of --site, --content-type or --default is required")
                    }
                };
                if self.config.policy.file.is_none() {
                    tracing::warn!("No policy file configured, the change will not persist");
                }
                let label = target.to_string();
                manager.update_policy(target, days)?;
                println!("{label} = {days} days");
            }

            PolicyCommand::Recommend => print_json(&manager.recommendations(&self.tracker())?)?,
        }

        Ok(())
    }

    async fn jobs_command(&self, cmd: JobsCommand) -> Result<()> {
        let jobs = self.job_queue();

        match cmd {
            JobsCommand::CreateJob {
                name,
                job_type,
                priority,
                schedule,
                job_config,
                max_retries,
                now,
            } => {
                let mut new_job = NewJob::new(name, job_type)
                    .with_priority(priority)
                    .with_schedule(schedule);
                if let Some(raw) = job_config {
                    new_job.config = serde_json::from_str::<JobConfig>(&raw)
                        .context("--job-config must be a JSON object")?;
                }
                if let Some(max_retries) = max_retries {
                    new_job = new_job.with_retry(RetrySettings {
                        max_retries,
                        ..Default::default()
                    });
                }
                if now {
                    new_job = new_job.run_immediately();
                }
                let job = self.job_scheduler(jobs, None).create_job(new_job)?;
                println!("Created job {} ({}), next run {}", job.name, job.id, job.next_run_at);
            }

            JobsCommand::CreateDefaults => {
                let scheduler = self.job_scheduler(Arc::clone(&jobs), None);
                for new_job in default_jobs() {
                    if let Some(existing) = jobs.get_by_name(&new_job.name)? {
                        println!("Exists  {} ({})", existing.name, existing.id);
                        continue;
                    }
                    let job = scheduler.create_job(new_job)?;
                    println!("Created {} ({}), {}", job.name, job.id, job.schedule_expression);
                }
            }

            JobsCommand::ListJobs { ready, status } => {
                let listed = if ready {
                    jobs.ready_jobs(Utc::now())?
                } else {
                    jobs.list(status)?
                };
                for job in listed {
                    println!(
                        "{}\t{}\t{}\t{}\t{}\tnext={}\tretries={}",
                        job.id,
                        job.name,
                        job.job_type,
                        job.priority,
                        job.status,
                        job.next_run_at,
                        job.retry_count
                    );
                }
            }

            JobsCommand::Cancel { id } => {
                let job = jobs.cancel(&id)?;
                println!("Cancelled {} ({})", job.name, job.id);
            }

            JobsCommand::Requeue { id } => {
                let job = jobs.requeue(&id, Utc::now())?;
                println!("Requeued {} ({}), next run {}", job.name, job.id, job.next_run_at);
            }

            JobsCommand::RunScheduler { once, metrics_file } => {
                let scheduler = self.job_scheduler(jobs, metrics_file);

                if once {
                    let summary = scheduler.tick(Utc::now()).await?;
                    scheduler.write_metrics();
                    print_json(&summary)?;
                    return Ok(());
                }

                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("Shutdown signal received");
                        let _ = shutdown_tx.send(true);
                    }
                });
                scheduler.run(shutdown_rx).await?;
            }
        }

        Ok(())
    }

    fn job_scheduler(&self, jobs: Arc<JobQueue>, metrics_file: Option<PathBuf>) -> JobScheduler {
        let mut scheduler =
            JobScheduler::new(jobs, self.config.scheduler_settings(metrics_file));
        register_builtin_handlers(
            &mut scheduler,
            Arc::new(self.discovery_queue()),
            Arc::new(self.prioritizer()),
            Arc::new(self.tracker()),
        );
        scheduler
    }
}

/// Hash, length and quality of a recorded crawl
struct ContentFacts {
    hash: String,
    length: u64,
    quality: Option<u8>,
}

impl RecordArgs {
    fn content_facts(&self) -> Result<ContentFacts> {
        match (&self.content_file, &self.hash) {
            (Some(path), _) => {
                let content = read_content(path)?;
                Ok(ContentFacts {
                    hash: ChangeDetector::hash(&content),
                    length: content.len() as u64,
                    quality: Some(
                        self.quality
                            .unwrap_or_else(|| ChangeDetector::estimate_quality(&content)),
                    ),
                })
            }
            (None, Some(hash)) => Ok(ContentFacts {
                hash: hash.clone(),
                length: 0,
                quality: self.quality,
            }),
            (None, None) if self.status == CrawlStatus::Failed => Ok(ContentFacts {
                hash: String::new(),
                length: 0,
                quality: self.quality,
            }),
            (None, None) => {
                anyhow::bail!("--hash or --content-file is required unless --status failed")
            }
        }
    }
}

fn build_outcome(facts: ContentFacts, args: &RecordArgs) -> CrawlOutcome {
    let mut outcome = if args.status == CrawlStatus::Failed {
        CrawlOutcome::failed(args.url.as_str())
    } else {
        CrawlOutcome::success(args.url.as_str(), facts.hash, facts.length).with_status(args.status)
    };
    if let Some(q) = facts.quality {
        outcome = outcome.with_quality(q);
    }
    if let Some(method) = &args.method {
        outcome = outcome.with_method(method.as_str());
    }
    if let Some(etag) = &args.etag {
        outcome = outcome.with_etag(etag.as_str());
    }
    if let Some(value) = &args.last_modified {
        outcome = outcome.with_last_modified(value.as_str());
    }
    if let Some(code) = args.http_status {
        outcome = outcome.with_http_status(code);
    }
    outcome
}
