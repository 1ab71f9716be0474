use crate::db::{Database, SampleStore};
use crate::errors::{AppError, AppResult};
use crate::metrics::compute_snapshot;
use crate::models::{HealthSample, MetricsReading, TargetSummary};
use std::sync::Arc;

/// Pull-based read side for dashboards and rankers. Every read reflects only
/// committed samples.
#[derive(Clone)]
pub struct MetricsReader {
    db: Arc<Database>,
    history_depth: usize,
}

impl MetricsReader {
    pub fn new(db: Arc<Database>, history_depth: usize) -> Self {
        Self {
            db,
            history_depth: history_depth.max(2),
        }
    }

    pub fn get_latest_metrics(&self, target_id: &str) -> AppResult<MetricsReading> {
        self.require_target(target_id)?;
        let history = self.db.last_ok_samples(target_id, self.history_depth)?;
        Ok(compute_snapshot(&history))
    }

    /// Every registered target with its latest sample and current metrics.
    pub fn list_targets(&self) -> AppResult<Vec<TargetSummary>> {
        let mut summaries = self.db.list_target_summaries()?;
        for summary in &mut summaries {
            let history = self.db.last_ok_samples(&summary.target.id, self.history_depth)?;
            summary.latest_metrics = compute_snapshot(&history).snapshot().copied();
        }
        Ok(summaries)
    }

    /// Newest first, all outcomes.
    pub fn recent_samples(&self, target_id: &str, n: usize) -> AppResult<Vec<HealthSample>> {
        self.require_target(target_id)?;
        self.db.recent_samples(target_id, n)
    }

    fn require_target(&self, target_id: &str) -> AppResult<()> {
        match self.db.get_target(target_id)? {
            Some(_) => Ok(()),
            None => Err(AppError::NotFound(format!("target {}", target_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MetricsReader;
    use crate::db::{Database, SampleStore};
    use crate::errors::AppError;
    use crate::models::{
        HealthSample, MetricsReading, MonitoringTarget, PeerCounts, SampleOutcome, TargetRecord,
    };
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn seeded() -> (tempfile::TempDir, Arc<Database>, MonitoringTarget) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("reader.sqlite")).expect("db"));
        let target = MonitoringTarget::from_record(&TargetRecord {
            url: "https://example.org/film".to_string(),
            license: "Creative Commons BY-SA".to_string(),
            magnet: "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a".to_string(),
        });
        db.register_targets(std::slice::from_ref(&target), "static").expect("register");
        (dir, db, target)
    }

    fn append(
        db: &Database,
        target: &MonitoringTarget,
        minutes: i64,
        counts: PeerCounts,
        outcome: SampleOutcome,
    ) {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).single().expect("valid time");
        let at = t0 + Duration::minutes(minutes);
        let sample = HealthSample::new(&target.id, at, counts, outcome, 1, None);
        db.append_sample(&sample, None).expect("append");
    }

    #[test]
    fn unknown_target_is_not_found() {
        let (_dir, db, _target) = seeded();
        let reader = MetricsReader::new(db, 10);
        assert!(matches!(reader.get_latest_metrics("missing"), Err(AppError::NotFound(_))));
        assert!(matches!(reader.recent_samples("missing", 3), Err(AppError::NotFound(_))));
    }

    #[test]
    fn metrics_need_two_ok_samples() {
        let (_dir, db, target) = seeded();
        let reader = MetricsReader::new(db.clone(), 10);
        assert_eq!(
            reader.get_latest_metrics(&target.id).expect("reading"),
            MetricsReading::Insufficient { samples_available: 0 }
        );

        append(&db, &target, 0, PeerCounts::new(4, 6), SampleOutcome::Ok);
        append(&db, &target, 5, PeerCounts::default(), SampleOutcome::Error);
        assert_eq!(
            reader.get_latest_metrics(&target.id).expect("reading"),
            MetricsReading::Insufficient { samples_available: 1 }
        );

        append(&db, &target, 10, PeerCounts::new(5, 10), SampleOutcome::Ok);
        let snapshot = reader
            .get_latest_metrics(&target.id)
            .expect("reading")
            .snapshot()
            .copied()
            .expect("ready");
        assert_eq!(snapshot.growth_pct, 50.0);
        assert_eq!(snapshot.samples_considered, 2);
    }

    #[test]
    fn list_and_recent_samples_reflect_committed_rows() {
        let (_dir, db, target) = seeded();
        let reader = MetricsReader::new(db.clone(), 10);
        append(&db, &target, 0, PeerCounts::new(10, 0), SampleOutcome::Ok);
        append(&db, &target, 5, PeerCounts::new(15, 0), SampleOutcome::Ok);
        append(&db, &target, 10, PeerCounts::default(), SampleOutcome::NoPeers);

        let summaries = reader.list_targets().expect("summaries");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].check_count, 3);
        let latest = summaries[0].latest_sample.as_ref().expect("latest");
        assert_eq!(latest.outcome, SampleOutcome::NoPeers);
        assert_eq!(summaries[0].latest_metrics.map(|metrics| metrics.growth_pct), Some(50.0));

        let recent = reader.recent_samples(&target.id, 2).expect("recent");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].outcome, SampleOutcome::NoPeers);
        assert!(recent[0].timestamp > recent[1].timestamp);
    }
}
