pub mod catalog;
pub mod config;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod reader;
pub mod retry;
pub mod scheduler;
pub mod swarm;
pub mod writer;

pub use crate::catalog::{StaticCatalog, StoredCatalog, TargetCatalog};
pub use crate::config::{SamplerSettings, SelectionPolicy};
pub use crate::db::{Database, SampleStore};
pub use crate::errors::{AppError, AppResult};
pub use crate::models::{
    HealthSample, MetricsReading, MetricsSnapshot, MonitoringTarget, PeerCounts, SampleOutcome,
    TargetRecord, TargetSummary,
};
pub use crate::reader::MetricsReader;
pub use crate::scheduler::{CheckReport, CycleSummary, SamplerHandle, SamplingScheduler};
pub use crate::swarm::{QueryError, SwarmQueryClient};

use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Store, scheduler and reader wired together from one settings value.
pub struct SwarmHealth {
    pub db: Arc<Database>,
    pub scheduler: SamplingScheduler,
    pub reader: MetricsReader,
}

impl SwarmHealth {
    /// Inline `targets` in the settings become a static catalog; without them
    /// the scheduler samples whatever has been ingested into the store.
    /// A configured `log_dir` gets the rolling JSON log unless a subscriber is
    /// already installed. Must be called inside a tokio runtime.
    pub fn open(settings: &SamplerSettings, client: Arc<dyn SwarmQueryClient>) -> AppResult<Self> {
        settings.validate()?;
        if let Some(log_dir) = &settings.log_dir {
            match init_tracing(log_dir) {
                Err(AppError::Internal(reason)) => {
                    tracing::debug!(reason = %reason, "keeping existing tracing subscriber");
                }
                other => other?,
            }
        }
        let db = Arc::new(Database::new(&settings.database_path)?);
        let catalog: Arc<dyn TargetCatalog> = if settings.targets.is_empty() {
            Arc::new(StoredCatalog::new(db.clone(), None))
        } else {
            Arc::new(StaticCatalog::from_records(&settings.targets))
        };
        let scheduler = SamplingScheduler::new(settings, catalog, client, db.clone())?;
        let reader = MetricsReader::new(db.clone(), settings.history_depth);
        tracing::info!(
            database = %db.path().display(),
            inline_targets = settings.targets.len(),
            "swarm health sampler ready"
        );
        Ok(Self { db, scheduler, reader })
    }

    /// Runs the scheduler until ctrl-c or a fatal store error.
    pub async fn run_until_shutdown(&self) -> AppResult<()> {
        let handle = self.scheduler.start();
        let cancel = handle.cancellation_token();
        let finished = handle.wait();
        tokio::pin!(finished);
        tokio::select! {
            result = &mut finished => return result,
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    tracing::warn!(error = %error, "ctrl-c listener failed, stopping");
                }
                tracing::info!("shutdown requested");
                cancel.cancel();
            }
        }
        finished.await
    }
}

/// Fails with `Internal` when a global subscriber is already set.
pub fn init_tracing(log_dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "sampler.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(format!("tracing init failed: {}", error)))
}
