use super::{QueryError, SwarmQueryClient};
use crate::models::PeerCounts;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

pub type ScriptedResult = Result<PeerCounts, QueryError>;

#[derive(Debug, Clone)]
pub struct QueryInvocation {
    pub magnet: String,
    pub at: Instant,
}

#[derive(Default)]
struct ScriptState {
    per_magnet: HashMap<String, VecDeque<ScriptedResult>>,
    invocations: Vec<QueryInvocation>,
}

/// Deterministic client that replays queued results per magnet. Once a magnet's
/// script runs dry the fallback result is returned.
pub struct ScriptedSwarmClient {
    state: Mutex<ScriptState>,
    fallback: ScriptedResult,
    latency: Duration,
}

impl Default for ScriptedSwarmClient {
    fn default() -> Self {
        Self::new(Ok(PeerCounts::default()))
    }
}

impl ScriptedSwarmClient {
    pub fn new(fallback: ScriptedResult) -> Self {
        Self {
            state: Mutex::new(ScriptState::default()),
            fallback,
            latency: Duration::ZERO,
        }
    }

    /// Every query suspends for `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push(&self, magnet: &str, result: ScriptedResult) {
        if let Ok(mut state) = self.state.lock() {
            state
                .per_magnet
                .entry(magnet.to_string())
                .or_default()
                .push_back(result);
        }
    }

    pub fn push_counts(&self, magnet: &str, seeders: u32, leechers: u32) {
        self.push(magnet, Ok(PeerCounts::new(seeders, leechers)));
    }

    pub fn invocations(&self) -> Vec<QueryInvocation> {
        self.state
            .lock()
            .map(|state| state.invocations.clone())
            .unwrap_or_default()
    }

    pub fn invocations_for(&self, magnet: &str) -> Vec<QueryInvocation> {
        self.invocations()
            .into_iter()
            .filter(|invocation| invocation.magnet == magnet)
            .collect()
    }
}

#[async_trait]
impl SwarmQueryClient for ScriptedSwarmClient {
    async fn query(&self, magnet: &str, _timeout: Duration) -> Result<PeerCounts, QueryError> {
        let next = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| QueryError::Unreachable("script state poisoned".to_string()))?;
            state.invocations.push(QueryInvocation {
                magnet: magnet.to_string(),
                at: Instant::now(),
            });
            state
                .per_magnet
                .get_mut(magnet)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| self.fallback.clone())
        };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        next
    }
}
