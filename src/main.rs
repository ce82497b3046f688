use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use pwnsync::prefix::PREFIX_COUNT;
use pwnsync::store::Backend;
use pwnsync::types::{default_workers, DEFAULT_RANGE_ENDPOINT};
use pwnsync::{
    CancellationRegistry, Orchestrator, Prefix, PrefixReconciler, Reconcile, RecordReconciler,
    RetryPolicy, RunSummary, Status, SyncConfig, SyncError,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pwnsync")]
#[command(about = "Download Pwned Passwords range files and sync them into a store", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download every range into the cache directory
    Download {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Import the cache as one aggregate document per prefix
    ImportByPrefix {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        import: ImportArgs,
    },
    /// Import the cache as one record per hash
    ImportByRecord {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        import: ImportArgs,
    },
}

#[derive(clap::Args, Debug)]
struct CommonArgs {
    /// Directory holding one <PREFIX>.txt per range; must exist and be writable
    #[arg(short, long, env = "PWNSYNC_CACHE_DIR")]
    cache_dir: PathBuf,

    /// Range API base URL
    #[arg(long, env = "PWNSYNC_ENDPOINT", default_value = DEFAULT_RANGE_ENDPOINT)]
    endpoint: String,

    /// Workers per pipeline stage [default: cores * 20]
    #[arg(short, long, env = "PWNSYNC_WORKERS")]
    workers: Option<usize>,

    /// Capacity of the channels between stages [default: worker count]
    #[arg(long)]
    channel_capacity: Option<usize>,

    /// Maximum concurrent requests against the range API
    #[arg(long, default_value_t = 64)]
    max_connections: usize,

    /// Retries per range after the first failed attempt
    #[arg(long, default_value_t = 5)]
    retries: usize,

    /// Delay step between retries, grows linearly (e.g. "500ms")
    #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
    retry_delay: Duration,

    /// Timeout of a single range request
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Interval between status lines
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    status_interval: Duration,

    /// First prefix to download, for resuming an interrupted download
    #[arg(long)]
    resume_from: Option<Prefix>,
}

#[derive(clap::Args, Debug)]
struct ImportArgs {
    /// Download every range before importing instead of reading the cache only
    #[arg(short, long)]
    download: bool,

    /// Storage backend
    #[arg(long, value_enum, env = "PWNSYNC_BACKEND", default_value_t = BackendKind::Sqlite)]
    backend: BackendKind,

    /// SQLite database file, created if missing
    #[arg(long, env = "PWNSYNC_DATABASE", default_value = "pwned.sqlite")]
    database: PathBuf,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum BackendKind {
    /// Keep everything in memory (dry run)
    Memory,
    /// SQLite database file
    Sqlite,
}

impl ImportArgs {
    fn backend(&self) -> Backend {
        match self.backend {
            BackendKind::Memory => Backend::Memory,
            BackendKind::Sqlite => Backend::Sqlite {
                path: self.database.clone(),
            },
        }
    }
}

impl CommonArgs {
    fn into_config(self, download: bool) -> SyncConfig {
        let workers = self.workers.unwrap_or_else(default_workers).max(1);
        SyncConfig {
            cache_dir: self.cache_dir,
            range_endpoint: self.endpoint,
            workers,
            channel_capacity: self.channel_capacity.unwrap_or(workers),
            max_connections_per_host: self.max_connections,
            retry: RetryPolicy {
                retries: self.retries,
                step: self.retry_delay,
            },
            request_timeout: self.timeout,
            status_interval: self.status_interval,
            download,
            resume_from: self.resume_from,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing, RUST_LOG wins over --verbose
    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pwnsync={}", log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚀 pwnsync - Pwned Passwords range sync");

    let summary = run(args.command).await?;
    info!("Job finished.");
    info!("{}", summary);
    std::process::exit(summary.exit_code());
}

async fn run(command: Command) -> anyhow::Result<RunSummary> {
    let status = Arc::new(Status::new());
    let registry = Arc::new(CancellationRegistry::new());
    let _interrupt = registry.cancel_on_interrupt();

    match command {
        Command::Download { common } => {
            let config = common.into_config(true);
            let interval = config.status_interval;
            let remaining = PREFIX_COUNT - config.resume_from.map_or(0, Prefix::index);
            let orchestrator = Orchestrator::new(config, status.clone(), registry);
            let job = tokio::spawn(async move { orchestrator.download_all().await });

            if atty::is(atty::Stream::Stderr) {
                let pb = progress_bar(u64::from(remaining))?;
                status
                    .report_progress_while_running(&job, interval, &pb)
                    .await;
            } else {
                status.report_while_running(&job, interval).await;
            }
            finish(job).await
        }
        Command::ImportByPrefix { common, import } => {
            let store = import
                .backend()
                .open_prefix_store()
                .await
                .context("Failed to open prefix store")?;
            let reconciler = Arc::new(PrefixReconciler::new(store, status.clone()));
            import_with(common.into_config(import.download), reconciler, status, registry).await
        }
        Command::ImportByRecord { common, import } => {
            let store = import
                .backend()
                .open_record_store()
                .await
                .context("Failed to open record store")?;
            let reconciler = Arc::new(RecordReconciler::new(store, status.clone()));
            import_with(common.into_config(import.download), reconciler, status, registry).await
        }
    }
}

async fn import_with(
    config: SyncConfig,
    reconciler: Arc<dyn Reconcile>,
    status: Arc<Status>,
    registry: Arc<CancellationRegistry>,
) -> anyhow::Result<RunSummary> {
    let interval = config.status_interval;
    let orchestrator = Orchestrator::new(config, status.clone(), registry);
    let job = tokio::spawn(async move { orchestrator.import(reconciler).await });

    status.report_while_running(&job, interval).await;
    finish(job).await
}

async fn finish(job: JoinHandle<Result<RunSummary, SyncError>>) -> anyhow::Result<RunSummary> {
    let summary = job
        .await
        .context("Sync job failed")?
        .context("Sync aborted")?;
    Ok(summary)
}

fn progress_bar(len: u64) -> anyhow::Result<indicatif::ProgressBar> {
    let pb = indicatif::ProgressBar::new(len);
    pb.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg} | {elapsed_precise} elapsed, ETA {eta_precise}")?
            .progress_chars("█▓▒░ "),
    );
    pb.set_message(format!("📦 Downloading {} ranges", len));
    Ok(pb)
}
