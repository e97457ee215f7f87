use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use grid_control::backend::process::ProcessRunner;
use grid_control::backend::slurm::SlurmQueues;
use grid_control::backend::BackendRegistry;
use grid_control::broker::{BrokerStrategy, DiscoveryCache, StaticQueues};
use grid_control::config::{DiscoverySource, EngineConfig};
use grid_control::scheduler::{Driver, JobDb, JobManager, JobState, StopReason};
use grid_control::shutdown::install_shutdown_handler;
use grid_control::task::Task;

#[derive(Parser, Debug)]
#[command(name = "grid-control")]
#[command(version)]
#[command(about = "Submit, track and retry jobs across batch and grid backends")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run scheduling cycles until the task is finished or interrupted
    Run(RunArgs),

    /// Ask the backends to cancel outstanding jobs
    Cancel {
        #[command(flatten)]
        engine: EngineArgs,

        /// Job numbers, e.g. "3" or "0-9,12"
        jobs: String,
    },

    /// Show job counts per state
    Status {
        #[command(flatten)]
        db: DbArgs,
    },

    /// List jobs
    List {
        #[command(flatten)]
        db: DbArgs,

        /// Only jobs in this state
        #[arg(long)]
        state: Option<String>,
    },

    /// Exclude jobs from automatic submission
    Disable {
        #[command(flatten)]
        db: DbArgs,

        /// Job numbers, e.g. "3" or "0-9,12"
        jobs: String,
    },

    /// Make disabled or finished jobs submittable again
    Reset {
        #[command(flatten)]
        db: DbArgs,

        /// Job numbers, e.g. "3" or "0-9,12"
        jobs: String,
    },

    /// Convert the job database into its compressed archive form
    Compact {
        #[command(flatten)]
        db: DbArgs,
    },

    /// Convert an archived job database back into one file per job
    Expand {
        #[command(flatten)]
        db: DbArgs,
    },
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct EngineArgs {
    /// Configuration file (JSON)
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Override the configured work directory
    #[arg(long, short = 'w')]
    workdir: Option<PathBuf>,
}

impl EngineArgs {
    fn load(&self) -> Result<EngineConfig, Box<dyn std::error::Error>> {
        let mut config = EngineConfig::load(&self.config)?;
        if let Some(workdir) = &self.workdir {
            config.workdir = workdir.clone();
        }
        Ok(config)
    }
}

#[derive(Parser, Debug)]
struct DbArgs {
    /// Work directory holding the job database
    #[arg(long, short = 'w', default_value = "work")]
    workdir: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    engine: EngineArgs,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Stop after this many cycles
    #[arg(long, conflicts_with = "once")]
    cycles: Option<usize>,
}

// =============================================================================
// Output Types
// =============================================================================

#[derive(Serialize)]
struct StatusOutput {
    total: usize,
    states: BTreeMap<String, usize>,
}

#[derive(Serialize)]
struct JobRow {
    job: u32,
    state: String,
    attempt: u32,
    global_id: Option<String>,
    destination: Option<String>,
    exit_code: Option<i32>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Run(run_args) => run(run_args).await?,
        Commands::Cancel { engine, jobs } => {
            let config = engine.load()?;
            let job_nums = parse_job_list(&jobs)?;
            let mut manager = build_manager(&config)?;
            let confirmed = manager.cancel_jobs(&job_nums).await?;
            println!("Cancelled {} of {} jobs", confirmed.len(), job_nums.len());
        }
        Commands::Status { db } => {
            let jobs = JobDb::open_existing(&db.workdir)?;
            print_status(&jobs, &db.output)?;
        }
        Commands::List { db, state } => {
            let filter = state.map(|s| s.parse::<JobState>()).transpose()?;
            let jobs = JobDb::open_existing(&db.workdir)?;
            print_jobs(&jobs, filter, &db.output)?;
        }
        Commands::Disable { db, jobs } => {
            override_jobs(&db.workdir, &jobs, "disabled", |job, n| job.disable(n))?;
        }
        Commands::Reset { db, jobs } => {
            override_jobs(&db.workdir, &jobs, "reset", |job, n| job.reset(n))?;
        }
        Commands::Compact { db } => {
            let mut jobs = JobDb::open_existing(&db.workdir)?;
            jobs.compact()?;
            println!("Archived {} jobs", jobs.len());
        }
        Commands::Expand { db } => {
            let mut jobs = JobDb::open_existing(&db.workdir)?;
            jobs.expand()?;
            println!("Expanded {} jobs", jobs.len());
        }
    }

    Ok(())
}

// =============================================================================
// Run
// =============================================================================

fn build_manager(config: &EngineConfig) -> Result<JobManager, Box<dyn std::error::Error>> {
    let token = Arc::new(config.credential.build());
    let backend = BackendRegistry::default().build(
        &config.backends,
        &config.router,
        config.broker.seed,
        &config.workdir,
        token,
    )?;
    let task: Arc<dyn Task> = Arc::new(config.task.clone());
    let db = JobDb::open(&config.workdir, task.job_count())?;

    let mut manager = JobManager::new(db, backend, task, config.jobs)
        .with_broker(Box::new(config.broker.build()));

    let capability = [&config.broker.sites, &config.broker.queues]
        .iter()
        .any(|spec| spec.strategy == BrokerStrategy::Capability);
    if capability {
        let discovery = match config.broker.discovery {
            DiscoverySource::Static => {
                DiscoveryCache::new(StaticQueues(config.broker.queue_info.clone()))
            }
            DiscoverySource::Slurm => DiscoveryCache::new(SlurmQueues::new(ProcessRunner::default())),
        };
        manager = manager.with_discovery(discovery);
    }
    Ok(manager)
}

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.engine.load()?;
    tracing::info!(
        task = %config.task.task_id,
        jobs = config.task.job_count,
        workdir = %config.workdir.display(),
        backends = config.backends.len(),
        "Starting grid-control"
    );

    let manager = build_manager(&config)?;
    let shutdown = install_shutdown_handler()?;
    let mut driver = Driver::new(
        manager,
        Duration::from_secs(config.driver.poll_interval),
        shutdown,
    );

    let limit = if args.once { Some(1) } else { args.cycles };
    let reason = driver.run_cycles(limit).await?;
    match reason {
        StopReason::Finished => tracing::info!("Task finished"),
        StopReason::Shutdown => tracing::info!("Stopped on request"),
        StopReason::CycleLimit => tracing::info!("Cycle limit reached"),
    }

    print_status(driver.manager().db(), &OutputFormat::Table)?;
    Ok(())
}

// =============================================================================
// Job Database Commands
// =============================================================================

fn override_jobs(
    workdir: &Path,
    spec: &str,
    verb: &str,
    apply: impl Fn(&mut grid_control::scheduler::Job, u32) -> grid_control::error::Result<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let job_nums = parse_job_list(spec)?;
    let mut db = JobDb::open_existing(workdir)?;
    for &job_num in &job_nums {
        apply(db.get_mut(job_num)?, job_num)?;
    }
    db.commit_many(&job_nums)?;
    println!("{} {} jobs", capitalize(verb), job_nums.len());
    Ok(())
}

fn print_status(db: &JobDb, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let counts = db.state_counts();
    match output_format {
        OutputFormat::Json => {
            let output = StatusOutput {
                total: db.len(),
                states: counts.iter().map(|(s, n)| (s.to_string(), *n)).collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("{:<12} {:>8}", "STATE", "JOBS");
            println!("{}", "-".repeat(21));
            for (state, count) in &counts {
                println!("{:<12} {:>8}", state.to_string(), count);
            }
            println!("{}", "-".repeat(21));
            println!("{:<12} {:>8}", "TOTAL", db.len());
        }
    }
    Ok(())
}

fn print_jobs(
    db: &JobDb,
    filter: Option<JobState>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let rows: Vec<JobRow> = db
        .iter()
        .filter(|(_, job)| filter.map_or(true, |state| job.state() == state))
        .map(|(n, job)| JobRow {
            job: n,
            state: job.state().to_string(),
            attempt: job.attempt(),
            global_id: job.global_id().map(ToString::to_string),
            destination: job.destination().map(str::to_string),
            exit_code: job.exit_code,
        })
        .collect();

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<6} {:<10} {:<7} {:<20} GLOBAL ID",
                "JOB", "STATE", "ATTEMPT", "DESTINATION"
            );
            println!("{}", "-".repeat(78));
            for row in &rows {
                println!(
                    "{:<6} {:<10} {:<7} {:<20} {}",
                    row.job,
                    row.state,
                    row.attempt,
                    row.destination.as_deref().unwrap_or("-"),
                    row.global_id.as_deref().unwrap_or("-")
                );
            }
            println!();
            println!("Showing {} of {} jobs", rows.len(), db.len());
        }
    }
    Ok(())
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Parse "0-9,12" into job numbers.
fn parse_job_list(spec: &str) -> Result<Vec<u32>, String> {
    let mut jobs = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let parse = |s: &str| {
            s.trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid job number {:?}", s))
        };
        match part.split_once('-') {
            Some((from, to)) => {
                let (from, to) = (parse(from)?, parse(to)?);
                if from > to {
                    return Err(format!("invalid job range {:?}", part));
                }
                jobs.extend(from..=to);
            }
            None => jobs.push(parse(part)?),
        }
    }
    if jobs.is_empty() {
        return Err("no job numbers given".to_string());
    }
    jobs.sort_unstable();
    jobs.dedup();
    Ok(jobs)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
