use super::{parse_magnet, InfoHash, QueryError, SwarmQueryClient};
use crate::models::PeerCounts;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Peer table as reported by the underlying engine for one torrent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerTable {
    pub has_metadata: bool,
    pub list_seeds: u32,
    pub list_peers: u32,
}

impl PeerTable {
    pub fn counts(self) -> PeerCounts {
        PeerCounts::new(self.list_seeds, self.list_peers.saturating_sub(self.list_seeds))
    }
}

pub type SessionId = u64;

/// What an embedded DHT/peer-wire engine must offer. Sessions are metadata-only:
/// the engine joins the swarm in upload mode and never downloads payload.
pub trait SwarmEngine: Send + Sync {
    fn open_session(&self, info_hash: &InfoHash, magnet: &str) -> Result<SessionId, QueryError>;
    fn peer_table(&self, session: SessionId) -> Option<PeerTable>;
    fn close_session(&self, session: SessionId);
}

/// Releases the engine session on every exit path, including a dropped future.
struct SessionGuard {
    engine: Arc<dyn SwarmEngine>,
    session: SessionId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.engine.close_session(self.session);
    }
}

#[derive(Clone)]
pub struct EngineSwarmClient {
    engine: Arc<dyn SwarmEngine>,
    warmup: Duration,
    poll_interval: Duration,
}

impl EngineSwarmClient {
    pub fn new(engine: Arc<dyn SwarmEngine>, warmup: Duration, poll_interval: Duration) -> Self {
        Self {
            engine,
            warmup,
            poll_interval: poll_interval.max(Duration::from_millis(10)),
        }
    }
}

#[async_trait]
impl SwarmQueryClient for EngineSwarmClient {
    /// Returns no later than `warmup + timeout` after the call, plus one engine
    /// poll.
    async fn query(&self, magnet: &str, timeout: Duration) -> Result<PeerCounts, QueryError> {
        let deadline = Instant::now() + self.warmup + timeout;
        let info_hash = parse_magnet(magnet)?;
        let session = self.engine.open_session(&info_hash, magnet)?;
        let guard = SessionGuard {
            engine: self.engine.clone(),
            session,
        };

        // DHT announces trickle in; reading right after connect undercounts.
        tokio::time::sleep_until((Instant::now() + self.warmup).min(deadline)).await;

        let mut last_table: Option<PeerTable> = None;
        loop {
            let table = self.engine.peer_table(guard.session).ok_or_else(|| {
                QueryError::Unreachable(format!("session for {} vanished", info_hash))
            })?;
            if table.has_metadata {
                if table.list_peers > 0 {
                    return Ok(table.counts());
                }
                last_table = Some(table);
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }

        match last_table {
            Some(table) => Ok(table.counts()),
            None => {
                tracing::debug!(info_hash = %info_hash, "no metadata before deadline");
                Err(QueryError::Timeout(self.warmup + timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineSwarmClient, PeerTable, SessionId, SwarmEngine};
    use crate::config::SamplerSettings;
    use crate::models::SampleOutcome;
    use crate::retry::run_check;
    use crate::swarm::{InfoHash, QueryError, SwarmQueryClient};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    const MAGNET: &str = "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

    /// Peer table becomes visible `ready_after` past session open.
    struct FakeEngine {
        next_id: AtomicU64,
        opened_at: Mutex<HashMap<SessionId, Instant>>,
        ready_after: Duration,
        table: PeerTable,
        refuse: AtomicBool,
    }

    impl FakeEngine {
        fn new(ready_after: Duration, table: PeerTable) -> Arc<Self> {
            Arc::new(Self {
                next_id: AtomicU64::new(1),
                opened_at: Mutex::new(HashMap::new()),
                ready_after,
                table,
                refuse: AtomicBool::new(false),
            })
        }

        fn open_sessions(&self) -> usize {
            self.opened_at.lock().expect("sessions lock").len()
        }
    }

    impl SwarmEngine for FakeEngine {
        fn open_session(
            &self,
            _info_hash: &InfoHash,
            _magnet: &str,
        ) -> Result<SessionId, QueryError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(QueryError::Unreachable("listen socket closed".to_string()));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.opened_at.lock().expect("sessions lock").insert(id, Instant::now());
            Ok(id)
        }

        fn peer_table(&self, session: SessionId) -> Option<PeerTable> {
            let opened = *self.opened_at.lock().expect("sessions lock").get(&session)?;
            if opened.elapsed() >= self.ready_after {
                Some(self.table)
            } else {
                Some(PeerTable::default())
            }
        }

        fn close_session(&self, session: SessionId) {
            self.opened_at.lock().expect("sessions lock").remove(&session);
        }
    }

    fn swarm(seeds: u32, peers: u32) -> PeerTable {
        PeerTable {
            has_metadata: true,
            list_seeds: seeds,
            list_peers: peers,
        }
    }

    fn client(engine: &Arc<FakeEngine>, warmup_secs: u64) -> EngineSwarmClient {
        EngineSwarmClient::new(
            engine.clone(),
            Duration::from_secs(warmup_secs),
            Duration::from_millis(500),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_warmup_before_reading_peers() {
        let engine = FakeEngine::new(Duration::from_secs(4), swarm(3, 10));
        let client = client(&engine, 5);

        let started = Instant::now();
        let counts = client.query(MAGNET, Duration::from_secs(10)).await.expect("counts");
        assert_eq!(counts.seeders, 3);
        assert_eq!(counts.leechers, 7);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(engine.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_metadata_times_out_and_releases_session() {
        let engine = FakeEngine::new(Duration::from_secs(3600), swarm(1, 1));
        let client = client(&engine, 1);

        let started = Instant::now();
        let result = client.query(MAGNET, Duration::from_secs(10)).await;
        assert!(matches!(result, Err(QueryError::Timeout(_))));
        assert!(started.elapsed() <= Duration::from_secs(11));
        assert_eq!(engine.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_swarm_with_metadata_reports_zero() {
        let engine = FakeEngine::new(Duration::ZERO, swarm(0, 0));
        let counts = client(&engine, 1)
            .query(MAGNET, Duration::from_secs(2))
            .await
            .expect("counts");
        assert_eq!(counts.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_query_still_releases_session() {
        let engine = FakeEngine::new(Duration::from_secs(3600), swarm(1, 1));
        let client = client(&engine, 5);

        let query = client.query(MAGNET, Duration::from_secs(10));
        let pending = tokio::time::timeout(Duration::from_secs(1), query).await;
        assert!(pending.is_err());
        assert_eq!(engine.open_sessions(), 0);
    }

    #[tokio::test]
    async fn bad_magnet_and_refused_sessions_map_to_errors() {
        let engine = FakeEngine::new(Duration::ZERO, swarm(1, 1));
        let client = EngineSwarmClient::new(engine.clone(), Duration::ZERO, Duration::ZERO);
        assert!(matches!(
            client.query("magnet:?dn=nothing", Duration::from_secs(1)).await,
            Err(QueryError::InvalidMagnet(_))
        ));

        engine.refuse.store(true, Ordering::SeqCst);
        assert!(matches!(
            client.query(MAGNET, Duration::from_secs(1)).await,
            Err(QueryError::Unreachable(_))
        ));
    }

    // Real clock: the engine's own deadline has to beat the per-attempt cap.
    #[tokio::test]
    async fn empty_swarm_settles_no_peers_under_configured_policy() {
        let settings = SamplerSettings {
            warmup: Duration::from_millis(200),
            query_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(50),
            backoff: Duration::from_millis(50),
            ..SamplerSettings::default()
        };
        let engine = FakeEngine::new(Duration::ZERO, swarm(0, 0));
        let client =
            EngineSwarmClient::new(engine.clone(), settings.warmup, settings.poll_interval);

        let policy = settings.retry_policy();
        let outcome = run_check(&client, MAGNET, &policy, &CancellationToken::new()).await;
        assert_eq!(outcome.outcome, SampleOutcome::NoPeers);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.log.len(), 3);
        assert!(outcome.log.iter().all(|record| record.result.is_ok()));
        assert_eq!(engine.open_sessions(), 0);
    }
}
