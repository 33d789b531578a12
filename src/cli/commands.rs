//! CLI command definitions for recurq.
//!
//! Manages job schedulers of a Redis-backed queue, runs a worker and prints
//! queue metrics.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::queue::{Job, JobOptions, Queue, DEFAULT_PREFIX};
use crate::repeat::{JobTemplate, RepeatOptions};
use crate::worker::{Processor, Worker, WorkerConfig};

/// Default Redis connection URL.
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default queue name.
const DEFAULT_QUEUE: &str = "default";

/// Redis-backed job queue with recurring job schedulers.
#[derive(Parser)]
#[command(name = "recurq")]
#[command(about = "Manage job schedulers and run workers on a Redis-backed queue")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL, global = true)]
    pub redis_url: String,

    /// Queue name.
    #[arg(short, long, default_value = DEFAULT_QUEUE, global = true)]
    pub queue: String,

    /// Key prefix.
    #[arg(long, default_value = DEFAULT_PREFIX, global = true)]
    pub prefix: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Manage job schedulers.
    #[command(subcommand)]
    Scheduler(SchedulerCommand),

    /// Run a worker that logs every job until Ctrl-C.
    Work(WorkArgs),

    /// Print queue metrics in Prometheus text format.
    Metrics,
}

/// Job scheduler subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum SchedulerCommand {
    /// Create or update a job scheduler.
    Upsert(UpsertArgs),

    /// Show one job scheduler.
    Get {
        /// Scheduler id.
        id: String,
    },

    /// List job schedulers ordered by next occurrence.
    List {
        /// First rank (inclusive).
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        start: isize,

        /// Last rank (inclusive, negative counts from the end).
        #[arg(long, default_value = "-1", allow_hyphen_values = true)]
        end: isize,

        /// Latest next occurrence first.
        #[arg(long)]
        desc: bool,
    },

    /// Count job schedulers.
    Count,

    /// Remove a job scheduler and its pending job.
    Remove {
        /// Scheduler id.
        id: String,
    },

    /// Remove a job scheduler by its repeat index key (including legacy keys).
    RemoveKey {
        /// Repeat index key.
        key: String,
    },
}

/// Arguments for `recurq scheduler upsert`.
#[derive(Parser, Debug)]
pub struct UpsertArgs {
    /// Scheduler id.
    pub id: String,

    /// Name of the produced jobs (defaults to the scheduler id).
    #[arg(short, long)]
    pub name: Option<String>,

    /// Interval in milliseconds.
    #[arg(short, long, conflicts_with = "pattern")]
    pub every: Option<i64>,

    /// Cron pattern (5, 6 or 7 fields).
    #[arg(short, long)]
    pub pattern: Option<String>,

    /// IANA timezone of the cron pattern.
    #[arg(long)]
    pub tz: Option<String>,

    /// Evaluate the cron pattern in UTC regardless of `--tz`.
    #[arg(long)]
    pub utc: bool,

    /// First occurrence not before this Unix time in milliseconds.
    #[arg(long)]
    pub start_date: Option<i64>,

    /// No occurrence after this Unix time in milliseconds.
    #[arg(long)]
    pub end_date: Option<i64>,

    /// Maximum number of jobs to produce.
    #[arg(long)]
    pub limit: Option<u32>,

    /// Phase of interval slots in milliseconds.
    #[arg(long)]
    pub offset: Option<i64>,

    /// Produce the first cron job right away.
    #[arg(long)]
    pub immediately: bool,

    /// JSON data of the produced jobs.
    #[arg(short, long, default_value = "null")]
    pub data: String,

    /// Attempts per produced job.
    #[arg(long, default_value = "1")]
    pub attempts: u32,
}

impl UpsertArgs {
    fn repeat_options(&self) -> RepeatOptions {
        RepeatOptions {
            pattern: self.pattern.clone(),
            every: self.every,
            tz: self.tz.clone(),
            utc: self.utc,
            start_date: self.start_date,
            end_date: self.end_date,
            limit: self.limit,
            offset: self.offset,
            immediately: self.immediately,
            count: 0,
        }
    }
}

/// Arguments for `recurq work`.
#[derive(Parser, Debug)]
pub struct WorkArgs {
    /// Number of processing loops.
    #[arg(short, long, default_value = "1")]
    pub concurrency: usize,

    /// Lock duration in milliseconds.
    #[arg(long, default_value = "30000")]
    pub lock_duration_ms: u64,

    /// Stalled job check interval in milliseconds.
    #[arg(long, default_value = "30000")]
    pub stalled_interval_ms: u64,

    /// Times a job may stall before it fails.
    #[arg(long, default_value = "1")]
    pub max_stalled_count: u32,
}

impl WorkArgs {
    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new(self.concurrency)
            .with_lock_duration(Duration::from_millis(self.lock_duration_ms))
            .with_stalled_interval(Duration::from_millis(self.stalled_interval_ms))
            .with_max_stalled_count(self.max_stalled_count)
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let queue = Queue::connect(&cli.redis_url, &cli.prefix, &cli.queue)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open queue '{}': {}", cli.queue, e))?;

    match cli.command {
        Commands::Scheduler(command) => run_scheduler_command(&queue, command).await?,
        Commands::Work(args) => run_work_command(queue, args).await?,
        Commands::Metrics => run_metrics_command(&queue).await?,
    }
    Ok(())
}

async fn run_scheduler_command(queue: &Queue, command: SchedulerCommand) -> anyhow::Result<()> {
    match command {
        SchedulerCommand::Upsert(args) => {
            let data: serde_json::Value = serde_json::from_str(&args.data)
                .map_err(|e| anyhow::anyhow!("Invalid --data JSON: {}", e))?;
            let template =
                JobTemplate::new(data, JobOptions::default().with_attempts(args.attempts));
            let name = args.name.clone().unwrap_or_else(|| args.id.clone());

            match queue
                .upsert_job_scheduler(&args.id, args.repeat_options(), &name, template)
                .await?
            {
                Some(job) => print_json(&job)?,
                None => println!("Recurrence has no further occurrence; nothing scheduled"),
            }
        }
        SchedulerCommand::Get { id } => match queue.get_job_scheduler(&id).await? {
            Some(record) => print_json(&record)?,
            None => anyhow::bail!("Job scheduler '{}' not found", id),
        },
        SchedulerCommand::List { start, end, desc } => {
            let records = queue.get_job_schedulers(start, end, !desc).await?;
            print_json(&records)?;
        }
        SchedulerCommand::Count => {
            println!("{}", queue.get_job_schedulers_count().await?);
        }
        SchedulerCommand::Remove { id } => {
            let removed = queue.remove_job_scheduler(&id).await?;
            println!("{}", if removed { "removed" } else { "not found" });
        }
        SchedulerCommand::RemoveKey { key } => {
            let removed = queue.remove_repeatable_by_key(&key).await?;
            println!("{}", if removed { "removed" } else { "not found" });
        }
    }
    Ok(())
}

/// Processor that logs each job and returns its data.
struct LoggingProcessor;

#[async_trait]
impl Processor for LoggingProcessor {
    async fn process(&self, job: &Job) -> anyhow::Result<serde_json::Value> {
        info!(job_id = %job.id, name = %job.name, data = %job.data, "Job received");
        Ok(job.data.clone())
    }
}

async fn run_work_command(queue: Queue, args: WorkArgs) -> anyhow::Result<()> {
    let mut worker = Worker::new(queue, Arc::new(LoggingProcessor), args.worker_config());
    worker.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");

    worker.shutdown().await?;
    let stats = worker.stats();
    info!(
        completed = stats.jobs_completed,
        failed = stats.jobs_failed,
        deferred = stats.jobs_deferred,
        "Worker stopped"
    );
    Ok(())
}

async fn run_metrics_command(queue: &Queue) -> anyhow::Result<()> {
    init_metrics().map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {}", e))?;

    let collector = MetricsCollector::new();
    for (state, count) in queue.job_counts().await? {
        collector.update_queue_depth(queue.name(), state.as_str(), count);
    }

    print!("{}", export_metrics());
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
    println!("{}", json);
    Ok(())
}
