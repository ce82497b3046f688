//! Main orchestration logic for the sync pipeline.
//!
//! Each stage is a pool of workers pulling from one shared bounded channel
//! and pushing into the next:
//!
//! ```text
//! prefix supply ──► download pool ─┐
//!                                  ├──► ingest pool ──► reconcile pool ──► store
//! cache discovery ─────────────────┘
//! ```
//!
//! A stage ends when its input channel is closed and drained. Its workers then
//! drop their senders, which closes the channel of the next stage.

use crate::cancel::CancellationRegistry;
use crate::discovery::{validate_cache_dir, CacheFiles};
use crate::download::Downloader;
use crate::error::SyncError;
use crate::ingest::ingest;
use crate::prefix::{Prefix, PrefixSpace};
use crate::reconcile::Reconcile;
use crate::status::{CurrentState, Status};
use crate::types::{FileData, SyncConfig};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Receiving end shared by every worker of one stage.
type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    /// Counters at the end of the run.
    pub state: CurrentState,
    /// Whether the run was interrupted.
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    /// Process exit code: 130 when interrupted, 2 when any unit was dropped, else 0.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            130
        } else if self.state.files_failed > 0 {
            2
        } else {
            0
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = Duration::from_secs(self.elapsed.as_secs());
        if self.cancelled {
            write!(f, "Job cancelled after {}", humantime::format_duration(elapsed))
        } else {
            write!(f, "Job finished in {}", humantime::format_duration(elapsed))
        }
    }
}

/// Wires the stages of one run together.
///
/// The status counters and the cancellation registry are owned by the caller,
/// so it can report progress and forward interrupts while a run is going.
pub struct Orchestrator {
    config: SyncConfig,
    status: Arc<Status>,
    registry: Arc<CancellationRegistry>,
}

impl Orchestrator {
    pub fn new(config: SyncConfig, status: Arc<Status>, registry: Arc<CancellationRegistry>) -> Self {
        Self {
            config,
            status,
            registry,
        }
    }

    /// Downloads every range into the cache directory.
    pub async fn download_all(&self) -> Result<RunSummary, SyncError> {
        let started = Instant::now();
        validate_cache_dir(&self.config.cache_dir)?;
        info!(
            "Downloading ranges from {} into {} with {} workers",
            self.config.range_endpoint,
            self.config.cache_dir.display(),
            self.config.workers
        );

        let prefixes = self.spawn_prefix_supply()?;
        let mut downloads = self.spawn_download_pool(prefixes, None)?;
        join_all("download", &mut downloads).await;

        Ok(self.summary(started))
    }

    /// Imports the cache into a store through `reconciler`.
    ///
    /// With `config.download` every range is fetched first; otherwise the
    /// files already in the cache directory are imported.
    pub async fn import(&self, reconciler: Arc<dyn Reconcile>) -> Result<RunSummary, SyncError> {
        let started = Instant::now();
        validate_cache_dir(&self.config.cache_dir)?;
        info!(
            "Importing {} with {} workers per stage",
            self.config.cache_dir.display(),
            self.config.workers
        );

        let capacity = self.config.channel_capacity.max(1);
        let (path_tx, path_rx) = mpsc::channel::<PathBuf>(capacity);
        let (data_tx, data_rx) = mpsc::channel::<FileData>(capacity);

        let mut producers = if self.config.download {
            let prefixes = self.spawn_prefix_supply()?;
            self.spawn_download_pool(prefixes, Some(path_tx))?
        } else {
            self.spawn_discovery(path_tx)?;
            JoinSet::new()
        };
        let mut ingesters = self.spawn_ingest_pool(path_rx, data_tx)?;
        let mut reconcilers = self.spawn_reconcile_pool(data_rx, reconciler)?;

        join_all("download", &mut producers).await;
        join_all("ingest", &mut ingesters).await;
        join_all("reconcile", &mut reconcilers).await;

        Ok(self.summary(started))
    }

    fn summary(&self, started: Instant) -> RunSummary {
        RunSummary {
            state: self.status.snapshot(),
            cancelled: self.registry.is_cancelled(),
            elapsed: started.elapsed(),
        }
    }

    /// Feeds every prefix, optionally starting at `resume_from`, into a bounded channel.
    fn spawn_prefix_supply(&self) -> Result<mpsc::Receiver<Prefix>, SyncError> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let space = match self.config.resume_from {
            Some(start) => {
                info!("Resuming prefix supply at {}", start);
                PrefixSpace::starting_at(start)
            }
            None => PrefixSpace::new(),
        };

        let supply = tokio::spawn(async move {
            for prefix in space {
                if tx.send(prefix).await.is_err() {
                    debug!("Prefix channel closed, stopping supply");
                    break;
                }
            }
        });
        self.registry.track_task("prefix supply", &supply)?;
        Ok(rx)
    }

    /// Lists the cache directory into `tx`.
    fn spawn_discovery(&self, tx: mpsc::Sender<PathBuf>) -> Result<(), SyncError> {
        let dir = self.config.cache_dir.clone();
        let status = Arc::clone(&self.status);

        let discovery = tokio::spawn(async move {
            let result: Result<(), SyncError> = async {
                let mut files = CacheFiles::open(&dir).await?;
                while let Some(path) = files.next_file().await? {
                    if tx.send(path).await.is_err() {
                        debug!("Path channel closed, stopping discovery");
                        break;
                    }
                    status.increase_files_queued();
                }
                Ok(())
            }
            .await;
            if let Err(e) = result {
                error!("Listing {} failed: {}", dir.display(), e);
            }
        });
        self.registry.track_task("cache discovery", &discovery)?;
        Ok(())
    }

    fn spawn_download_pool(
        &self,
        prefixes: mpsc::Receiver<Prefix>,
        paths: Option<mpsc::Sender<PathBuf>>,
    ) -> Result<JoinSet<()>, SyncError> {
        let token = self.registry.stage_token("download pool")?;
        let downloader = Downloader::new(&self.config)?;
        let status = Arc::clone(&self.status);
        let cancel = token.clone();

        Ok(spawn_pool(self.config.workers, prefixes, token, move |prefix| {
            let downloader = downloader.clone();
            let status = Arc::clone(&status);
            let paths = paths.clone();
            let cancel = cancel.clone();
            async move {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = downloader.download(prefix) => result,
                };
                match result {
                    Ok(path) => {
                        if let Some(paths) = paths {
                            if paths.send(path).await.is_err() {
                                return;
                            }
                        }
                        status.increase_files_queued();
                    }
                    Err(e) => {
                        error!("Dropping {}: {}", prefix, e);
                        status.increase_files_failed();
                    }
                }
            }
        }))
    }

    fn spawn_ingest_pool(
        &self,
        paths: mpsc::Receiver<PathBuf>,
        data: mpsc::Sender<FileData>,
    ) -> Result<JoinSet<()>, SyncError> {
        let token = self.registry.stage_token("ingest pool")?;
        let status = Arc::clone(&self.status);

        Ok(spawn_pool(self.config.workers, paths, token, move |path| {
            let status = Arc::clone(&status);
            let data = data.clone();
            async move {
                trace!("Reading {}", path.display());
                match ingest(path.clone()).await {
                    Ok(file) => {
                        if data.send(file).await.is_ok() {
                            status.increase_files_read();
                        }
                    }
                    Err(e) => {
                        error!("Skipping {}: {}", path.display(), e);
                        status.increase_files_failed();
                    }
                }
            }
        }))
    }

    fn spawn_reconcile_pool(
        &self,
        data: mpsc::Receiver<FileData>,
        reconciler: Arc<dyn Reconcile>,
    ) -> Result<JoinSet<()>, SyncError> {
        let token = self.registry.stage_token("reconcile pool")?;
        let status = Arc::clone(&self.status);

        // A write that has started always runs to completion; the token is
        // only checked before the next file is taken.
        Ok(spawn_pool(self.config.workers, data, token, move |file| {
            let reconciler = Arc::clone(&reconciler);
            let status = Arc::clone(&status);
            async move {
                let prefix = file.prefix;
                if let Err(e) = reconciler.reconcile(file).await {
                    error!("Reconciling {} failed: {}", prefix, e);
                    status.increase_files_failed();
                }
            }
        }))
    }
}

/// Starts `workers` tasks that apply `work` to units from `rx` until it is
/// closed and drained or `token` is cancelled.
fn spawn_pool<T, F, Fut>(
    workers: usize,
    rx: mpsc::Receiver<T>,
    token: CancellationToken,
    work: F,
) -> JoinSet<()>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let rx: SharedReceiver<T> = Arc::new(Mutex::new(rx));
    let mut set = JoinSet::new();
    for _ in 0..workers.max(1) {
        let rx = Arc::clone(&rx);
        let token = token.clone();
        let work = work.clone();
        set.spawn(async move {
            while let Some(unit) = next_unit(&rx, &token).await {
                work(unit).await;
            }
        });
    }
    set
}

async fn next_unit<T>(rx: &SharedReceiver<T>, token: &CancellationToken) -> Option<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        unit = async { rx.lock().await.recv().await } => unit,
    }
}

async fn join_all(stage: &str, set: &mut JoinSet<()>) {
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!("A {} worker panicked: {}", stage, e);
            } else {
                warn!("A {} worker was aborted", stage);
            }
        }
    }
    debug!("All {} workers finished", stage);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeCounts;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Counting(AtomicUsize);

    #[async_trait]
    impl Reconcile for Counting {
        async fn reconcile(&self, _data: FileData) -> Result<ChangeCounts, SyncError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(ChangeCounts::default())
        }
    }

    fn orchestrator(dir: &TempDir, workers: usize) -> Orchestrator {
        let config = SyncConfig {
            cache_dir: dir.path().to_path_buf(),
            workers,
            channel_capacity: 2,
            ..SyncConfig::default()
        };
        Orchestrator::new(
            config,
            Arc::new(Status::new()),
            Arc::new(CancellationRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_every_cached_file_reaches_the_reconciler() {
        let dir = TempDir::new().unwrap();
        for i in 0..20u32 {
            let prefix = Prefix::from_index(i).unwrap();
            std::fs::write(dir.path().join(format!("{}.txt", prefix)), "AAAA:1\n").unwrap();
        }
        let counting = Arc::new(Counting(AtomicUsize::new(0)));

        let summary = orchestrator(&dir, 3).import(counting.clone()).await.unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 20);
        assert_eq!(summary.state.files_queued, 20);
        assert_eq!(summary.state.files_read, 20);
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_foreign_files_are_counted_as_failed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("00000.txt"), "AAAA:1\n").unwrap();
        std::fs::write(dir.path().join("README"), "not a range").unwrap();
        let counting = Arc::new(Counting(AtomicUsize::new(0)));

        let summary = orchestrator(&dir, 2).import(counting.clone()).await.unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
        assert_eq!(summary.state.files_failed, 1);
        assert_eq!(summary.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_unusable_cache_dir_fails_before_start() {
        let dir = TempDir::new().unwrap();
        let mut orchestrator = orchestrator(&dir, 1);
        orchestrator.config.cache_dir = dir.path().join("missing");

        let result = orchestrator
            .import(Arc::new(Counting(AtomicUsize::new(0))))
            .await;
        assert!(matches!(result, Err(SyncError::CacheDir(_))));
    }

    #[tokio::test]
    async fn test_pool_stops_when_cancelled() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        let token = CancellationToken::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mut set = spawn_pool(4, rx, token.clone(), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tx.send(1).await.unwrap();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), join_all("test", &mut set))
            .await
            .unwrap();
        // The sender is still open, so only cancellation can have stopped the pool.
        assert!(seen.load(Ordering::SeqCst) <= 1);
        assert!(tx.send(2).await.is_err());
    }

    #[test]
    fn test_exit_codes() {
        let mut summary = RunSummary {
            state: CurrentState::default(),
            cancelled: false,
            elapsed: Duration::from_millis(1500),
        };
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.to_string(), "Job finished in 1s");
        summary.state.files_failed = 1;
        assert_eq!(summary.exit_code(), 2);
        summary.cancelled = true;
        assert_eq!(summary.exit_code(), 130);
    }
}
