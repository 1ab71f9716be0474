use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CREATIVE_COMMONS_MARKER: &str = "Creative Commons";

/// One record as produced by an ingestion channel (CSV file, peer gossip, config).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRecord {
    pub url: String,
    pub license: String,
    #[serde(alias = "magnet_link")]
    pub magnet: String,
}

impl TargetRecord {
    pub fn is_eligible(&self) -> bool {
        self.license.contains(CREATIVE_COMMONS_MARKER) && !self.magnet.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringTarget {
    pub id: String,
    pub url: String,
    pub license: String,
    pub magnet: String,
    pub eligible: bool,
}

impl MonitoringTarget {
    pub fn from_record(record: &TargetRecord) -> Self {
        let magnet = record.magnet.trim().to_string();
        Self {
            id: crate::swarm::target_id_for_magnet(&magnet),
            url: record.url.trim().to_string(),
            license: record.license.trim().to_string(),
            eligible: record.is_eligible(),
            magnet,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleOutcome {
    Ok,
    NoPeers,
    Error,
}

impl SampleOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NoPeers => "no_peers",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ok" => Some(Self::Ok),
            "no_peers" => Some(Self::NoPeers),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerCounts {
    pub seeders: u32,
    pub leechers: u32,
}

impl PeerCounts {
    pub fn new(seeders: u32, leechers: u32) -> Self {
        Self { seeders, leechers }
    }

    pub fn total(self) -> u32 {
        self.seeders.saturating_add(self.leechers)
    }
}

/// A fully built row for the samples table. `total_peers` is derived, so a
/// sample can never disagree with its own counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSample {
    pub id: String,
    pub target_id: String,
    pub timestamp: DateTime<Utc>,
    pub seeders: u32,
    pub leechers: u32,
    pub total_peers: u32,
    pub outcome: SampleOutcome,
    pub attempts: u32,
    pub reason: Option<String>,
}

impl HealthSample {
    pub fn new(
        target_id: &str,
        timestamp: DateTime<Utc>,
        counts: PeerCounts,
        outcome: SampleOutcome,
        attempts: u32,
        reason: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target_id: target_id.to_string(),
            timestamp,
            seeders: counts.seeders,
            leechers: counts.leechers,
            total_peers: counts.total(),
            outcome,
            attempts,
            reason,
        }
    }

    pub fn counts(&self) -> PeerCounts {
        PeerCounts::new(self.seeders, self.leechers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub growth_pct: f64,
    pub shrink_pct: f64,
    pub exploding_score: f64,
    pub samples_considered: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetricsReading {
    Ready(MetricsSnapshot),
    Insufficient { samples_available: u32 },
}

impl MetricsReading {
    pub fn snapshot(&self) -> Option<&MetricsSnapshot> {
        match self {
            Self::Ready(snapshot) => Some(snapshot),
            Self::Insufficient { .. } => None,
        }
    }

    /// Exploding score with the insufficient case collapsed to zero.
    pub fn exploding_score(&self) -> f64 {
        self.snapshot().map(|snapshot| snapshot.exploding_score).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSummary {
    pub target: MonitoringTarget,
    pub source: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub check_count: u32,
    pub latest_sample: Option<HealthSample>,
    pub latest_metrics: Option<MetricsSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::{HealthSample, PeerCounts, SampleOutcome, TargetRecord};
    use chrono::Utc;

    fn record(license: &str, magnet: &str) -> TargetRecord {
        TargetRecord {
            url: "https://example.org/film".to_string(),
            license: license.to_string(),
            magnet: magnet.to_string(),
        }
    }

    #[test]
    fn eligibility_needs_license_marker_and_magnet() {
        let open = record("Creative Commons Attribution 4.0", "magnet:?xt=urn:btih:abc");
        assert!(open.is_eligible());
        assert!(!record("CC-BY", "magnet:?xt=urn:btih:abc").is_eligible());
        assert!(!record("creative commons", "magnet:?xt=urn:btih:abc").is_eligible());
        assert!(!record("Creative Commons", "   ").is_eligible());
    }

    #[test]
    fn total_peers_is_always_the_sum() {
        let counts = PeerCounts::new(3, 4);
        let sample = HealthSample::new("t", Utc::now(), counts, SampleOutcome::Ok, 1, None);
        assert_eq!(sample.total_peers, 7);
        assert_eq!(sample.counts().total(), sample.total_peers);
    }

    #[test]
    fn outcome_strings_round_trip() {
        for outcome in [SampleOutcome::Ok, SampleOutcome::NoPeers, SampleOutcome::Error] {
            assert_eq!(SampleOutcome::parse(outcome.as_str()), Some(outcome));
        }
        assert_eq!(SampleOutcome::parse("healthy"), None);
    }
}
