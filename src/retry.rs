use crate::models::{PeerCounts, SampleOutcome};
use crate::swarm::{QueryError, SwarmQueryClient};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const CANCELLED_REASON: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub query_timeout: Duration,
    /// Outer bound on a single attempt, warm-up included.
    pub attempt_deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(60),
            query_timeout: Duration::from_secs(10),
            attempt_deadline: Duration::from_secs(16),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckState {
    Init,
    Querying { attempt: u32 },
    Empty { attempt: u32, error: Option<QueryError> },
    Success { attempt: u32, counts: PeerCounts },
    Failed { attempt: u32, reason: String, outcome: SampleOutcome },
}

impl CheckState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: Instant,
    pub result: Result<PeerCounts, QueryError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub outcome: SampleOutcome,
    pub counts: PeerCounts,
    pub attempts: u32,
    pub reason: Option<String>,
    pub log: Vec<AttemptRecord>,
}

/// Pure transition out of `Querying` once an attempt has produced a result.
pub fn after_attempt(attempt: u32, result: &Result<PeerCounts, QueryError>) -> CheckState {
    match result {
        Ok(counts) if counts.total() > 0 => CheckState::Success {
            attempt,
            counts: *counts,
        },
        Ok(_) => CheckState::Empty { attempt, error: None },
        Err(QueryError::InvalidMagnet(detail)) => CheckState::Failed {
            attempt,
            reason: format!("invalid magnet: {}", detail),
            outcome: SampleOutcome::Error,
        },
        Err(error) => CheckState::Empty {
            attempt,
            error: Some(error.clone()),
        },
    }
}

/// Transition out of `Empty`: either schedule another attempt or settle.
/// `error` is the most recent error seen in this check cycle; `no_peers` is
/// only settled when every attempt came back empty.
pub fn after_empty(attempt: u32, error: Option<&QueryError>, policy: &RetryPolicy) -> CheckState {
    if attempt < policy.max_attempts {
        return CheckState::Querying { attempt: attempt + 1 };
    }
    match error {
        None => CheckState::Failed {
            attempt,
            reason: format!("no peers after {} attempts", attempt),
            outcome: SampleOutcome::NoPeers,
        },
        Some(error) => CheckState::Failed {
            attempt,
            reason: error.to_string(),
            outcome: SampleOutcome::Error,
        },
    }
}

/// Drives one check cycle for one magnet. All retry state lives on this stack
/// frame, so nothing leaks between targets or cycles.
pub async fn run_check(
    client: &dyn SwarmQueryClient,
    magnet: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> CheckOutcome {
    let mut log: Vec<AttemptRecord> = Vec::new();
    let mut state = CheckState::Init;

    loop {
        state = match state {
            CheckState::Init => CheckState::Querying { attempt: 1 },
            CheckState::Querying { attempt } => {
                let started_at = Instant::now();
                let deadline = policy.attempt_deadline;
                let query =
                    tokio::time::timeout(deadline, client.query(magnet, policy.query_timeout));
                let result = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    result = query => Some(result.unwrap_or(Err(QueryError::Timeout(deadline)))),
                };
                let Some(result) = result else {
                    return aborted(attempt, log);
                };
                tracing::debug!(attempt, result = ?result, "swarm query attempt finished");
                let next = match after_attempt(attempt, &result) {
                    CheckState::Empty { attempt, error: None } => CheckState::Empty {
                        attempt,
                        error: last_error(&log),
                    },
                    next => next,
                };
                log.push(AttemptRecord {
                    attempt,
                    started_at,
                    result,
                });
                next
            }
            CheckState::Empty { attempt, error } => {
                let next = after_empty(attempt, error.as_ref(), policy);
                if matches!(next, CheckState::Querying { .. }) {
                    let cancelled = tokio::select! {
                        biased;
                        () = cancel.cancelled() => true,
                        () = tokio::time::sleep(policy.backoff) => false,
                    };
                    if cancelled {
                        return aborted(attempt, log);
                    }
                }
                next
            }
            CheckState::Success { attempt, counts } => {
                return CheckOutcome {
                    outcome: SampleOutcome::Ok,
                    counts,
                    attempts: attempt,
                    reason: None,
                    log,
                };
            }
            CheckState::Failed {
                attempt,
                reason,
                outcome,
            } => {
                return CheckOutcome {
                    outcome,
                    counts: PeerCounts::default(),
                    attempts: attempt,
                    reason: Some(reason),
                    log,
                };
            }
        };
    }
}

fn last_error(log: &[AttemptRecord]) -> Option<QueryError> {
    log.iter().rev().find_map(|record| record.result.as_ref().err().cloned())
}

fn aborted(attempt: u32, log: Vec<AttemptRecord>) -> CheckOutcome {
    CheckOutcome {
        outcome: SampleOutcome::Error,
        counts: PeerCounts::default(),
        attempts: attempt,
        reason: Some(CANCELLED_REASON.to_string()),
        log,
    }
}
