use crate::errors::{AppError, AppResult};
use crate::models::TargetRecord;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_ATTEMPTS_ALLOWED: u32 = 10;
const MAX_CONCURRENCY: usize = 256;
const MIN_CYCLE_INTERVAL: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(3_600);
const MIN_QUERY_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_QUERY_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_WARMUP: Duration = Duration::from_secs(600);
const MAX_STORE_WRITE_ATTEMPTS: u32 = 20;
/// Headroom past `warmup + query_timeout` so the engine's own deadline fires first.
const MIN_ATTEMPT_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionPolicy {
    All,
    RandomSubset { size: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SamplerSettings {
    pub database_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub cycle_interval: Duration,
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub warmup: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub concurrency: usize,
    pub selection_policy: SelectionPolicy,
    pub history_depth: usize,
    pub store_write_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub store_retry_delay: Duration,
    pub store_failure_threshold: u32,
    pub targets: Vec<TargetRecord>,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("dht_health.sqlite"),
            log_dir: None,
            cycle_interval: Duration::from_secs(300),
            max_attempts: 3,
            backoff: Duration::from_secs(60),
            query_timeout: Duration::from_secs(10),
            warmup: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            concurrency: 4,
            selection_policy: SelectionPolicy::All,
            history_depth: 10,
            store_write_attempts: 3,
            store_retry_delay: Duration::from_millis(250),
            store_failure_threshold: 5,
            targets: Vec::new(),
        }
    }
}

impl SamplerSettings {
    /// Reads YAML, or JSON when the file extension says so.
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| {
                AppError::Config(format!("cannot read {}: {}", path.display(), error))
            })?;
        let is_json = path
            .extension()
            .and_then(|value| value.to_str())
            .map(|value| value.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let settings: Self = if is_json {
            serde_json::from_str(&raw)?
        } else {
            serde_yaml::from_str(&raw)?
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.cycle_interval < MIN_CYCLE_INTERVAL {
            return Err(AppError::Config(format!(
                "cycle_interval {:?} is below the minimum {:?}",
                self.cycle_interval, MIN_CYCLE_INTERVAL
            )));
        }
        if !(1..=MAX_ATTEMPTS_ALLOWED).contains(&self.max_attempts) {
            return Err(AppError::Config(format!(
                "max_attempts {} is out of allowed range (1..={})",
                self.max_attempts, MAX_ATTEMPTS_ALLOWED
            )));
        }
        if self.backoff > MAX_BACKOFF {
            return Err(AppError::Config(format!(
                "backoff {:?} exceeds {:?}",
                self.backoff, MAX_BACKOFF
            )));
        }
        if !(MIN_QUERY_TIMEOUT..=MAX_QUERY_TIMEOUT).contains(&self.query_timeout) {
            return Err(AppError::Config(format!(
                "query_timeout {:?} is out of allowed range ({:?}..={:?})",
                self.query_timeout, MIN_QUERY_TIMEOUT, MAX_QUERY_TIMEOUT
            )));
        }
        if self.warmup > MAX_WARMUP {
            return Err(AppError::Config(format!(
                "warmup {:?} exceeds {:?}",
                self.warmup, MAX_WARMUP
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(AppError::Config("poll_interval must be positive".to_string()));
        }
        if !(1..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(AppError::Config(format!(
                "concurrency {} is out of allowed range (1..={})",
                self.concurrency, MAX_CONCURRENCY
            )));
        }
        if let SelectionPolicy::RandomSubset { size } = self.selection_policy {
            if size == 0 {
                return Err(AppError::Config("random_subset size must be at least 1".to_string()));
            }
        }
        if self.history_depth < 2 {
            return Err(AppError::Config(format!(
                "history_depth {} is too small to derive growth",
                self.history_depth
            )));
        }
        if !(1..=MAX_STORE_WRITE_ATTEMPTS).contains(&self.store_write_attempts) {
            return Err(AppError::Config(format!(
                "store_write_attempts {} is out of allowed range (1..={})",
                self.store_write_attempts, MAX_STORE_WRITE_ATTEMPTS
            )));
        }
        if self.store_failure_threshold == 0 {
            return Err(AppError::Config("store_failure_threshold must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            query_timeout: self.query_timeout,
            attempt_deadline: self.warmup
                + self.query_timeout
                + self.poll_interval.max(MIN_ATTEMPT_SLACK),
        }
    }
}
