//! Trend metrics over a target's ok-sample history.
//!
//! Every function takes totals in ascending time order (most recent last) and
//! is total over its input: empty, single-sample and all-zero histories yield
//! defined, bounded values.

use crate::models::{HealthSample, MetricsReading, MetricsSnapshot, SampleOutcome};

/// Growth reported when a swarm goes from zero peers to some peers.
pub const GROWTH_FROM_ZERO_PCT: f64 = 100.0;
/// Below this many current peers the exploding score is capped.
pub const EXPLODING_PEER_FLOOR: u32 = 5;
pub const EXPLODING_FLOOR_CAP: f64 = 30.0;
/// Sample count at which confidence stops rising.
pub const CONFIDENCE_SAMPLE_CAP: usize = 5;
/// Peer count at which the peer confidence saturates.
pub const CONFIDENCE_PEER_SATURATION: f64 = 100.0;

const GROWTH_WEIGHT: f64 = 60.0;
const ACCELERATION_WEIGHT: f64 = 40.0;

pub fn growth_between(previous: u32, current: u32) -> f64 {
    match (previous, current) {
        (0, 0) => 0.0,
        (0, _) => GROWTH_FROM_ZERO_PCT,
        (previous, current) => {
            (f64::from(current) - f64::from(previous)) / f64::from(previous) * 100.0
        }
    }
}

/// Growth between the two most recent totals, `None` with fewer than two.
pub fn growth_pct(totals: &[u32]) -> Option<f64> {
    match totals {
        [.., previous, current] => Some(growth_between(*previous, *current)),
        _ => None,
    }
}

pub fn shrink_pct(growth_pct: f64) -> f64 {
    (-growth_pct).max(0.0)
}

/// Change between the two most recent growth values; needs three totals.
pub fn acceleration(totals: &[u32]) -> Option<f64> {
    match totals {
        [.., first, second, third] => {
            Some(growth_between(*second, *third) - growth_between(*first, *second))
        }
        _ => None,
    }
}

/// Composite 0..=100 score flagging swarms that grow fast and keep speeding
/// up. Non-decreasing in growth, acceleration, sample count and current peers.
pub fn exploding_score(totals: &[u32]) -> f64 {
    let Some(growth) = growth_pct(totals) else {
        return 0.0;
    };
    let current = totals.last().copied().unwrap_or(0);
    let accel = acceleration(totals).unwrap_or(0.0);

    let base = GROWTH_WEIGHT * unit(growth / 100.0) + ACCELERATION_WEIGHT * unit(accel / 100.0);

    let considered = totals.len().min(CONFIDENCE_SAMPLE_CAP);
    let sample_confidence =
        0.5 + 0.5 * (considered - 2) as f64 / (CONFIDENCE_SAMPLE_CAP - 2) as f64;
    let peer_confidence =
        unit((1.0 + f64::from(current)).log10() / (1.0 + CONFIDENCE_PEER_SATURATION).log10());

    let mut score = (base * sample_confidence * peer_confidence).clamp(0.0, 100.0);
    if current < EXPLODING_PEER_FLOOR {
        score = score.min(EXPLODING_FLOOR_CAP);
    }
    score
}

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

pub fn snapshot_from_totals(totals: &[u32]) -> MetricsReading {
    let Some(growth) = growth_pct(totals) else {
        return MetricsReading::Insufficient {
            samples_available: totals.len() as u32,
        };
    };
    MetricsReading::Ready(MetricsSnapshot {
        growth_pct: growth,
        shrink_pct: shrink_pct(growth),
        exploding_score: exploding_score(totals),
        samples_considered: totals.len() as u32,
    })
}

/// Metrics over ok samples only; other outcomes in `samples` are skipped.
/// Samples must already be in ascending timestamp order.
pub fn compute_snapshot(samples: &[HealthSample]) -> MetricsReading {
    let totals: Vec<u32> = samples
        .iter()
        .filter(|sample| sample.outcome == SampleOutcome::Ok)
        .map(|sample| sample.total_peers)
        .collect();
    snapshot_from_totals(&totals)
}
