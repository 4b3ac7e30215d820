/// Orchestrator - wires probing, scheduling and output together
///
/// The orchestrator:
/// - Builds the probe executor, worker pool and outcome bus from configuration
/// - Drives either the cadence scheduler or the store sweeper
/// - Reloads the roster on SIGHUP
/// - Drains in-flight batches and outcome files on shutdown
use anyhow::{Context, Result};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, LoggingConfig, SchedulerMode};
use crate::monitoring::{
    BatchIds, BatchProbeExecutor, CadenceScheduler, Fping, MemoryStore, OutcomeBus, ProbePool,
    StoreSweeper,
};
use crate::roster::{Roster, load_roster};
use crate::writer;
use logger::HostFilter;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Orchestrator {
    config: Arc<Config>,
    roster_path: PathBuf,
    bus: OutcomeBus,
    pool: Arc<ProbePool>,
    batch_ids: Arc<BatchIds>,
    writer: Option<JoinHandle<()>>,
}

impl Orchestrator {
    /// Create an orchestrator and run it until Ctrl-C or SIGTERM
    pub async fn start(config: Config, roster_path: PathBuf) -> Result<()> {
        let orchestrator = Self::new(config, roster_path).await?;
        orchestrator.run_until(shutdown_signal()).await
    }

    pub async fn new(config: Config, roster_path: PathBuf) -> Result<Self> {
        let config = Arc::new(config);

        let tool = Arc::new(Fping::new(
            &config.probe.program,
            config.probe.count,
            config.probe.per_host_timeout_ms,
        ));
        let executor = Arc::new(
            BatchProbeExecutor::new(
                tool,
                Duration::from_millis(config.probe.batch_timeout_ms),
                Duration::from_millis(config.probe.output_wait_ms),
            )
            .with_trace_hosts(trace_hosts(&config.logging)),
        );

        let bus = OutcomeBus::new(config.output.channel_capacity);
        let writer = writer::start(
            config.output.enabled,
            &config.output.directory,
            config.output.format,
            &bus,
        )
        .await
        .with_context(|| {
            format!("Failed to prepare output directory {}", config.output.directory.display())
        })?;

        let pool = Arc::new(ProbePool::start(
            config.pool.workers,
            config.pool.queue_capacity,
            executor,
            bus.clone(),
        ));

        Ok(Self { config, roster_path, bus, pool, batch_ids: Arc::new(BatchIds::new()), writer })
    }

    /// Poll until `shutdown` resolves, then drain
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(mode = ?self.config.scheduler.mode, roster = %self.roster_path.display(), "Starting poller");

        let loaded = load_roster(&self.roster_path).await;
        let load = match loaded {
            Ok(load) => load,
            Err(e) => {
                self.shutdown().await;
                return Err(e.into());
            }
        };
        if load.roster.is_empty() {
            warn!("Roster has no valid hosts, nothing will be probed until it is reloaded");
        }

        match self.config.scheduler.mode {
            SchedulerMode::Clustered => self.run_clustered(load.roster, shutdown).await,
            SchedulerMode::Store => self.run_store(load.roster, shutdown).await,
        }

        self.shutdown().await;
        Ok(())
    }

    async fn run_clustered(&self, roster: Roster, shutdown: impl Future<Output = ()>) {
        let scheduler = CadenceScheduler::new(self.pool.clone(), self.batch_ids.clone());
        scheduler.reload(&roster);

        let mut reload = ReloadSignal::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = reload.recv() => {
                    info!(roster = %self.roster_path.display(), "Roster reload requested");
                    match load_roster(&self.roster_path).await {
                        Ok(load) => {
                            scheduler.reload(&load.roster);
                        }
                        Err(e) => error!("Roster reload failed, keeping current clusters: {}", e),
                    }
                }
            }
        }

        scheduler.stop();
    }

    async fn run_store(&self, roster: Roster, shutdown: impl Future<Output = ()>) {
        let store = Arc::new(MemoryStore::from_roster(&roster));
        let sweeper = Arc::new(StoreSweeper::new(
            store.clone(),
            self.pool.clone(),
            self.batch_ids.clone(),
            Duration::from_secs(self.config.scheduler.sweep_interval_seconds),
        ));
        let handle = sweeper.spawn();

        let mut reload = ReloadSignal::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = reload.recv() => {
                    info!(roster = %self.roster_path.display(), "Roster reload requested");
                    match load_roster(&self.roster_path).await {
                        Ok(load) => {
                            let removed = store.sync(&load.roster).await;
                            info!(hosts = load.roster.len(), removed, "Store updated from roster");
                        }
                        Err(e) => error!("Roster reload failed, keeping current store: {}", e),
                    }
                }
            }
        }

        handle.abort();
        let _ = handle.await;
    }

    async fn shutdown(self) {
        info!("Shutting down, waiting for in-flight batches");
        self.pool.shutdown().await;

        let Self { pool, bus, writer, .. } = self;
        // the writer stops once every bus handle is gone
        drop(pool);
        drop(bus);

        if let Some(mut writer) = writer {
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
                warn!("Outcome writer did not drain in time");
                writer.abort();
            }
        }
        info!("Poller stopped");
    }
}

/// Whitelist for per-host trace logging from inline addresses and an optional file
fn trace_hosts(logging: &LoggingConfig) -> HostFilter {
    let mut filter = HostFilter::new(&logging.trace_hosts);
    if let Some(path) = &logging.trace_hosts_file {
        match HostFilter::from_file(path) {
            Ok(from_file) => filter.extend(from_file),
            Err(e) => warn!(path = %path.display(), "Cannot read trace host file: {}", e),
        }
    }
    if !filter.is_empty() {
        info!(hosts = filter.len(), "Per-host tracing limited to whitelist");
    }
    filter
}

/// SIGHUP on unix; never fires elsewhere
struct ReloadSignal {
    #[cfg(unix)]
    hangup: Option<tokio::signal::unix::Signal>,
}

impl ReloadSignal {
    fn new() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let hangup = match signal(SignalKind::hangup()) {
                Ok(hangup) => Some(hangup),
                Err(e) => {
                    warn!("Cannot listen for SIGHUP, roster reload disabled: {}", e);
                    None
                }
            };
            Self { hangup }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        if let Some(hangup) = self.hangup.as_mut() {
            if hangup.recv().await.is_some() {
                return;
            }
            self.hangup = None;
        }
        std::future::pending::<()>().await
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown requested");
}
