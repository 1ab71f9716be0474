use crate::db::Database;
use crate::errors::AppResult;
use crate::models::{MonitoringTarget, TargetRecord};
use std::sync::{Arc, RwLock};

/// Source of monitoring targets. Implementations may return ineligible
/// targets; the scheduler filters them.
pub trait TargetCatalog: Send + Sync {
    fn source_name(&self) -> &str;
    fn targets(&self) -> AppResult<Vec<MonitoringTarget>>;
}

/// Fixed or externally refreshed list held in memory (config file, CSV loader).
#[derive(Default)]
pub struct StaticCatalog {
    targets: RwLock<Vec<MonitoringTarget>>,
}

impl StaticCatalog {
    pub fn from_records(records: &[TargetRecord]) -> Self {
        Self {
            targets: RwLock::new(records.iter().map(MonitoringTarget::from_record).collect()),
        }
    }

    /// Replaces the whole list; the next cycle picks it up.
    pub fn replace(&self, records: &[TargetRecord]) {
        if let Ok(mut targets) = self.targets.write() {
            *targets = records.iter().map(MonitoringTarget::from_record).collect();
        }
    }
}

impl TargetCatalog for StaticCatalog {
    fn source_name(&self) -> &str {
        "static"
    }

    fn targets(&self) -> AppResult<Vec<MonitoringTarget>> {
        let targets = self
            .targets
            .read()
            .map_err(|_| crate::errors::AppError::Internal("catalog lock poisoned".to_string()))?;
        Ok(targets.clone())
    }
}

/// Targets pushed into the store by an ingestion channel, served
/// least-recently-checked first and capped at `batch_size`.
pub struct StoredCatalog {
    db: Arc<Database>,
    batch_size: Option<usize>,
}

impl StoredCatalog {
    pub fn new(db: Arc<Database>, batch_size: Option<usize>) -> Self {
        Self { db, batch_size }
    }
}

impl TargetCatalog for StoredCatalog {
    fn source_name(&self) -> &str {
        "store"
    }

    fn targets(&self) -> AppResult<Vec<MonitoringTarget>> {
        self.db.eligible_targets(self.batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::{StaticCatalog, StoredCatalog, TargetCatalog};
    use crate::db::Database;
    use crate::models::TargetRecord;
    use std::sync::Arc;

    const MAGNET: &str = "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

    fn record(license: &str, magnet: &str) -> TargetRecord {
        TargetRecord {
            url: "https://example.org/x".to_string(),
            license: license.to_string(),
            magnet: magnet.to_string(),
        }
    }

    #[test]
    fn static_catalog_keeps_eligibility_flags() {
        let catalog = StaticCatalog::from_records(&[
            record("Creative Commons BY", MAGNET),
            record("proprietary", "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88b"),
        ]);
        let targets = catalog.targets().expect("targets");
        assert_eq!(targets.len(), 2);
        assert!(targets[0].eligible);
        assert!(!targets[1].eligible);

        catalog.replace(&[]);
        assert!(catalog.targets().expect("targets").is_empty());
    }

    #[test]
    fn stored_catalog_serves_ingested_targets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("c.sqlite")).expect("db"));
        db.ingest_targets(
            &[record("Creative Commons BY", MAGNET)],
            "gossip",
        )
        .expect("ingest");

        let catalog = StoredCatalog::new(db, Some(10));
        let targets = catalog.targets().expect("targets");
        assert_eq!(targets.len(), 1);
        assert!(targets[0].eligible);
    }
}
