use crate::errors::{AppError, AppResult};
use crate::models::{
    HealthSample, MetricsSnapshot, MonitoringTarget, SampleOutcome, TargetRecord, TargetSummary,
};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const SAMPLE_COLUMNS: &str =
    "id, target_id, ts_ms, seeders, leechers, total_peers, outcome, attempts, reason";

/// Storage seam used by the scheduler and the serialized writer.
pub trait SampleStore: Send + Sync {
    fn register_targets(&self, targets: &[MonitoringTarget], source: &str) -> AppResult<usize>;

    /// Appends one complete row. Returns the sample as stored, with the
    /// effective timestamp the store assigned.
    fn append_sample(
        &self,
        sample: &HealthSample,
        metrics: Option<&MetricsSnapshot>,
    ) -> AppResult<HealthSample>;

    /// The `n` most recent ok samples of a target, oldest first.
    fn last_ok_samples(&self, target_id: &str, n: usize) -> AppResult<Vec<HealthSample>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub accepted: usize,
    pub skipped: usize,
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "sample store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    /// Push-style ingestion: eligible records are upserted, the rest skipped.
    pub fn ingest_targets(
        &self,
        records: &[TargetRecord],
        source: &str,
    ) -> AppResult<IngestSummary> {
        let mut summary = IngestSummary::default();
        let mut eligible = Vec::new();
        for record in records {
            let target = MonitoringTarget::from_record(record);
            if target.eligible {
                eligible.push(target);
            } else {
                tracing::debug!(
                    url = %record.url,
                    license = %record.license,
                    "skipping ineligible record"
                );
                summary.skipped += 1;
            }
        }
        summary.accepted = self.register_targets(&eligible, source)?;
        Ok(summary)
    }

    /// Eligible targets, never-checked first, then least recently checked.
    pub fn eligible_targets(&self, limit: Option<usize>) -> AppResult<Vec<MonitoringTarget>> {
        let conn = self.lock()?;
        let limit = limit.map(|value| value as i64).unwrap_or(-1);
        let mut statement = conn.prepare(
            "SELECT id, url, license, magnet, eligible
             FROM targets
             WHERE eligible = 1
             ORDER BY last_checked_at ASC NULLS FIRST, first_seen_at DESC
             LIMIT ?1",
        )?;
        let rows = statement.query_map([limit], parse_target_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn get_target(&self, target_id: &str) -> AppResult<Option<MonitoringTarget>> {
        let conn = self.lock()?;
        let target = conn
            .query_row(
                "SELECT id, url, license, magnet, eligible FROM targets WHERE id = ?1",
                [target_id],
                parse_target_row,
            )
            .optional()?;
        Ok(target)
    }

    /// Newest first, every outcome.
    pub fn recent_samples(&self, target_id: &str, n: usize) -> AppResult<Vec<HealthSample>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {} FROM samples WHERE target_id = ?1 ORDER BY ts_ms DESC LIMIT ?2",
            SAMPLE_COLUMNS
        ))?;
        let rows = statement.query_map(params![target_id, n as i64], parse_sample_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn count_samples(&self, target_id: &str) -> AppResult<u32> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM samples WHERE target_id = ?1",
            [target_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    pub fn list_target_summaries(&self) -> AppResult<Vec<TargetSummary>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT t.id, t.url, t.license, t.magnet, t.eligible, t.source, t.first_seen_at,
                    t.last_checked_at, t.check_count,
                    s.id, s.target_id, s.ts_ms, s.seeders, s.leechers, s.total_peers,
                    s.outcome, s.attempts, s.reason,
                    s.growth_pct, s.shrink_pct, s.exploding_score, s.samples_considered
             FROM targets t
             LEFT JOIN samples s ON s.id = (
               SELECT latest.id FROM samples latest
               WHERE latest.target_id = t.id
               ORDER BY latest.ts_ms DESC
               LIMIT 1
             )
             ORDER BY t.first_seen_at ASC, t.id ASC",
        )?;
        let rows = statement.query_map([], |row| {
            let target = parse_target_row(row)?;
            let latest_sample = match row.get::<_, Option<String>>(9)? {
                Some(_) => Some(parse_sample_columns(row, 9)?),
                None => None,
            };
            Ok(TargetSummary {
                target,
                source: row.get(5)?,
                first_seen_at: parse_time(&row.get::<_, String>(6)?)?,
                last_checked_at: row
                    .get::<_, Option<String>>(7)?
                    .map(|raw| parse_time(&raw))
                    .transpose()?,
                check_count: row.get(8)?,
                latest_sample,
                latest_metrics: parse_metrics_columns(row, 18)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Metrics persisted with the target's most recent ok sample, if any.
    pub fn latest_persisted_metrics(&self, target_id: &str) -> AppResult<Option<MetricsSnapshot>> {
        let conn = self.lock()?;
        let metrics = conn
            .query_row(
                "SELECT growth_pct, shrink_pct, exploding_score, samples_considered
                 FROM samples
                 WHERE target_id = ?1 AND outcome = 'ok'
                 ORDER BY ts_ms DESC
                 LIMIT 1",
                [target_id],
                |row| parse_metrics_columns(row, 0),
            )
            .optional()?;
        Ok(metrics.flatten())
    }
}

impl SampleStore for Database {
    fn register_targets(&self, targets: &[MonitoringTarget], source: &str) -> AppResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut inserted = 0usize;
        for target in targets {
            inserted += tx.execute(
                "INSERT INTO targets (id, url, license, magnet, eligible, source, first_seen_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    target.id,
                    target.url,
                    target.license,
                    target.magnet,
                    target.eligible,
                    source,
                    now
                ],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn append_sample(
        &self,
        sample: &HealthSample,
        metrics: Option<&MetricsSnapshot>,
    ) -> AppResult<HealthSample> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let last_ts: Option<i64> = tx.query_row(
            "SELECT MAX(ts_ms) FROM samples WHERE target_id = ?1",
            [sample.target_id.as_str()],
            |row| row.get(0),
        )?;
        let requested = sample.timestamp.timestamp_millis();
        let effective = match last_ts {
            Some(last) if requested <= last => last + 1,
            _ => requested,
        };
        let timestamp = millis_to_time(effective)?;

        tx.execute(
            "INSERT INTO samples (
               id, target_id, ts_ms, seeders, leechers, total_peers, outcome, attempts, reason,
               growth_pct, shrink_pct, exploding_score, samples_considered
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                sample.id,
                sample.target_id,
                effective,
                sample.seeders,
                sample.leechers,
                sample.total_peers,
                sample.outcome.as_str(),
                sample.attempts,
                sample.reason,
                metrics.map(|value| value.growth_pct),
                metrics.map(|value| value.shrink_pct),
                metrics.map(|value| value.exploding_score),
                metrics.map(|value| value.samples_considered),
            ],
        )?;

        let touched = tx.execute(
            "UPDATE targets SET last_checked_at = ?1, check_count = check_count + 1 WHERE id = ?2",
            params![timestamp.to_rfc3339(), sample.target_id],
        )?;
        if touched == 0 {
            // dropping `tx` rolls the insert back
            return Err(AppError::NotFound(format!(
                "target {} is not registered",
                sample.target_id
            )));
        }
        tx.commit()?;

        Ok(HealthSample {
            timestamp,
            ..sample.clone()
        })
    }

    fn last_ok_samples(&self, target_id: &str, n: usize) -> AppResult<Vec<HealthSample>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {} FROM samples
             WHERE target_id = ?1 AND outcome = 'ok'
             ORDER BY ts_ms DESC
             LIMIT ?2",
            SAMPLE_COLUMNS
        ))?;
        let rows = statement.query_map(params![target_id, n as i64], parse_sample_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        result.reverse();
        Ok(result)
    }
}

fn parse_target_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MonitoringTarget> {
    Ok(MonitoringTarget {
        id: row.get(0)?,
        url: row.get(1)?,
        license: row.get(2)?,
        magnet: row.get(3)?,
        eligible: row.get(4)?,
    })
}

fn parse_sample_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HealthSample> {
    parse_sample_columns(row, 0)
}

fn parse_sample_columns(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<HealthSample> {
    let ts_ms: i64 = row.get(offset + 2)?;
    let outcome_raw: String = row.get(offset + 6)?;
    let outcome = SampleOutcome::parse(&outcome_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            offset + 6,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown outcome '{}'", outcome_raw),
            )),
        )
    })?;
    Ok(HealthSample {
        id: row.get(offset)?,
        target_id: row.get(offset + 1)?,
        timestamp: millis_to_time(ts_ms).map_err(|_| invalid_time(offset + 2))?,
        seeders: row.get(offset + 3)?,
        leechers: row.get(offset + 4)?,
        total_peers: row.get(offset + 5)?,
        outcome,
        attempts: row.get(offset + 7)?,
        reason: row.get(offset + 8)?,
    })
}

fn parse_metrics_columns(
    row: &rusqlite::Row<'_>,
    offset: usize,
) -> rusqlite::Result<Option<MetricsSnapshot>> {
    let growth_pct: Option<f64> = row.get(offset)?;
    let shrink_pct: Option<f64> = row.get(offset + 1)?;
    let exploding_score: Option<f64> = row.get(offset + 2)?;
    let samples_considered: Option<u32> = row.get(offset + 3)?;
    Ok(match (growth_pct, shrink_pct, exploding_score, samples_considered) {
        (Some(growth_pct), Some(shrink_pct), Some(exploding_score), Some(samples_considered)) => {
            Some(MetricsSnapshot {
                growth_pct,
                shrink_pct,
                exploding_score,
                samples_considered,
            })
        }
        _ => None,
    })
}

fn millis_to_time(ms: i64) -> AppResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| AppError::Internal(format!("timestamp {} out of range", ms)))
}

fn invalid_time(column: usize) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Integer,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, "timestamp out of range")),
    )
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}
