use crate::catalog::TargetCatalog;
use crate::config::{SamplerSettings, SelectionPolicy};
use crate::db::SampleStore;
use crate::errors::{AppError, AppResult};
use crate::metrics::compute_snapshot;
use crate::models::{HealthSample, MetricsReading, MonitoringTarget, PeerCounts, SampleOutcome};
use crate::retry::{run_check, RetryPolicy};
use crate::swarm::SwarmQueryClient;
use crate::writer::{SampleWriter, WriterSettings};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

const REPORT_CHANNEL_CAPACITY: usize = 256;

/// Published for every completed check cycle, whatever its outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckReport {
    pub sample_id: String,
    pub target_id: String,
    pub url: String,
    pub outcome: SampleOutcome,
    pub counts: PeerCounts,
    pub attempts: u32,
    pub reason: Option<String>,
    pub metrics: MetricsReading,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    pub selected: usize,
    pub ineligible: usize,
    pub ok: usize,
    pub no_peers: usize,
    pub errors: usize,
    pub store_failures: usize,
}

impl CycleSummary {
    fn record(&mut self, outcome: SampleOutcome) {
        match outcome {
            SampleOutcome::Ok => self.ok += 1,
            SampleOutcome::NoPeers => self.no_peers += 1,
            SampleOutcome::Error => self.errors += 1,
        }
    }
}

#[derive(Clone)]
pub struct SamplingScheduler {
    catalog: Arc<dyn TargetCatalog>,
    client: Arc<dyn SwarmQueryClient>,
    store: Arc<dyn SampleStore>,
    writer: SampleWriter,
    policy: RetryPolicy,
    selection: SelectionPolicy,
    cycle_interval: Duration,
    history_depth: usize,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    reports: broadcast::Sender<CheckReport>,
}

impl SamplingScheduler {
    /// Must be called inside a tokio runtime: the sample writer task is
    /// spawned here.
    pub fn new(
        settings: &SamplerSettings,
        catalog: Arc<dyn TargetCatalog>,
        client: Arc<dyn SwarmQueryClient>,
        store: Arc<dyn SampleStore>,
    ) -> AppResult<Self> {
        settings.validate()?;
        let (writer, _writer_task) = SampleWriter::spawn(
            store.clone(),
            WriterSettings {
                write_attempts: settings.store_write_attempts,
                retry_delay: settings.store_retry_delay,
                failure_threshold: settings.store_failure_threshold,
            },
        );
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Ok(Self {
            catalog,
            client,
            store,
            writer,
            policy: settings.retry_policy(),
            selection: settings.selection_policy,
            cycle_interval: settings.cycle_interval,
            history_depth: settings.history_depth,
            permits: Arc::new(Semaphore::new(settings.concurrency)),
            cancel: CancellationToken::new(),
            reports,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CheckReport> {
        self.reports.subscribe()
    }

    /// Scheduler-wide shutdown: cancelling it stops every run started from
    /// this scheduler, and `run_once` calls start no further checks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Each run gets its own child token, so a stopped scheduler can be
    /// started again.
    pub fn start(&self) -> SamplerHandle {
        let mut scheduler = self.clone();
        scheduler.cancel = self.cancel.child_token();
        let cancel = scheduler.cancel.clone();
        let task = tokio::spawn(scheduler.run_loop());
        SamplerHandle {
            cancel,
            reports: self.reports.clone(),
            task,
        }
    }

    async fn run_loop(self) -> AppResult<()> {
        tracing::info!(
            interval_secs = self.cycle_interval.as_secs(),
            max_attempts = self.policy.max_attempts,
            concurrency = self.permits.available_permits(),
            "sampling scheduler started"
        );
        let mut cycle = 0u64;
        while !self.cancel.is_cancelled() {
            cycle += 1;
            match self.run_once().await {
                Ok(summary) => {
                    tracing::info!(
                        cycle,
                        selected = summary.selected,
                        ok = summary.ok,
                        no_peers = summary.no_peers,
                        errors = summary.errors,
                        store_failures = summary.store_failures,
                        "sampling cycle finished"
                    );
                }
                Err(error) if error.is_fatal() => {
                    tracing::error!(cycle, error = %error, "sampling scheduler stopping");
                    return Err(error);
                }
                Err(error) => {
                    tracing::warn!(cycle, error = %error, "sampling cycle failed");
                }
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.cycle_interval) => {}
            }
        }
        tracing::info!(cycles = cycle, "sampling scheduler stopped");
        Ok(())
    }

    /// One full pass over the selected targets. Per-target failures are
    /// counted, only store-wide unavailability is returned as an error.
    pub async fn run_once(&self) -> AppResult<CycleSummary> {
        let mut summary = CycleSummary::default();
        let mut seen = HashSet::new();
        let mut eligible = Vec::new();
        for target in self.catalog.targets()? {
            if !target.eligible {
                tracing::debug!(
                    target_id = %target.id,
                    url = %target.url,
                    "skipping ineligible target"
                );
                summary.ineligible += 1;
                continue;
            }
            if seen.insert(target.id.clone()) {
                eligible.push(target);
            }
        }
        self.store.register_targets(&eligible, self.catalog.source_name())?;

        let selected = select_targets(eligible, self.selection);
        summary.selected = selected.len();

        let cycle_cancel = self.cancel.child_token();
        let mut tasks = JoinSet::new();
        for target in selected {
            let permit = tokio::select! {
                biased;
                () = cycle_cancel.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => permit
                    .map_err(|_| AppError::Internal("worker pool closed".to_string()))?,
            };
            if cycle_cancel.is_cancelled() {
                break;
            }
            let scheduler = self.clone();
            let cancel = cycle_cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                scheduler.check_target(target, &cancel).await
            });
        }

        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(report)) => summary.record(report.outcome),
                Ok(Err(error)) if error.is_fatal() => {
                    summary.store_failures += 1;
                    cycle_cancel.cancel();
                    fatal.get_or_insert(error);
                }
                Ok(Err(_)) => summary.store_failures += 1,
                Err(error) => {
                    tracing::error!(error = %error, "check task panicked");
                    summary.errors += 1;
                }
            }
        }

        if let Some(error) = fatal {
            return Err(error);
        }
        Ok(summary)
    }

    async fn check_target(
        &self,
        target: MonitoringTarget,
        cancel: &CancellationToken,
    ) -> AppResult<CheckReport> {
        let check = run_check(self.client.as_ref(), &target.magnet, &self.policy, cancel).await;
        let sample = HealthSample::new(
            &target.id,
            Utc::now(),
            check.counts,
            check.outcome,
            check.attempts,
            check.reason.clone(),
        );

        let metrics = match self.metrics_with(&sample) {
            Ok(metrics) => metrics,
            Err(error) => {
                tracing::warn!(
                    target_id = %target.id,
                    error = %error,
                    "history unavailable, persisting without metrics"
                );
                MetricsReading::Insufficient { samples_available: 0 }
            }
        };
        let persisted_metrics = match sample.outcome {
            SampleOutcome::Ok => metrics.snapshot().copied(),
            _ => None,
        };

        let stored = match self.writer.append(sample, persisted_metrics).await {
            Ok(stored) => stored,
            Err(error) => {
                tracing::error!(
                    target_id = %target.id,
                    url = %target.url,
                    error = %error,
                    "check result could not be persisted"
                );
                return Err(error);
            }
        };

        let report = CheckReport {
            sample_id: stored.id.clone(),
            target_id: target.id.clone(),
            url: target.url.clone(),
            outcome: stored.outcome,
            counts: stored.counts(),
            attempts: stored.attempts,
            reason: stored.reason.clone(),
            metrics,
            timestamp: stored.timestamp,
        };
        match report.outcome {
            SampleOutcome::Ok => tracing::info!(
                target_id = %report.target_id,
                seeders = report.counts.seeders,
                leechers = report.counts.leechers,
                attempts = report.attempts,
                exploding = report.metrics.exploding_score(),
                "swarm sampled"
            ),
            SampleOutcome::NoPeers => tracing::info!(
                target_id = %report.target_id,
                attempts = report.attempts,
                "swarm has no peers"
            ),
            SampleOutcome::Error => tracing::warn!(
                target_id = %report.target_id,
                url = %report.url,
                attempts = report.attempts,
                reason = report.reason.as_deref().unwrap_or("unknown"),
                "swarm check failed"
            ),
        }
        let _ = self.reports.send(report.clone());
        Ok(report)
    }

    /// Stored ok history plus the new sample when it is itself ok.
    fn metrics_with(&self, sample: &HealthSample) -> AppResult<MetricsReading> {
        let depth = self.history_depth.max(2);
        if sample.outcome == SampleOutcome::Ok {
            let mut history = self.store.last_ok_samples(&sample.target_id, depth - 1)?;
            history.push(sample.clone());
            Ok(compute_snapshot(&history))
        } else {
            let history = self.store.last_ok_samples(&sample.target_id, depth)?;
            Ok(compute_snapshot(&history))
        }
    }
}

fn select_targets(
    mut targets: Vec<MonitoringTarget>,
    policy: SelectionPolicy,
) -> Vec<MonitoringTarget> {
    match policy {
        SelectionPolicy::All => targets,
        SelectionPolicy::RandomSubset { size } => {
            targets.shuffle(&mut rand::rng());
            targets.truncate(size);
            targets
        }
    }
}

/// Operational control over a running scheduler.
pub struct SamplerHandle {
    cancel: CancellationToken,
    reports: broadcast::Sender<CheckReport>,
    task: JoinHandle<AppResult<()>>,
}

impl SamplerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<CheckReport> {
        self.reports.subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops scheduling new checks, aborts pending backoff waits and waits for
    /// in-flight checks to settle.
    pub async fn stop(self) -> AppResult<()> {
        self.cancel.cancel();
        self.wait().await
    }

    pub async fn wait(self) -> AppResult<()> {
        self.task
            .await
            .map_err(|error| AppError::Internal(format!("scheduler task failed: {}", error)))?
    }
}
