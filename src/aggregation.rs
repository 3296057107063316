//! Rollup aggregation engine
//!
//! One algorithm serves both the periodic scheduler and the operator
//! trigger endpoint: select the unaggregated batch, group it by UTC date in
//! memory, and apply each group atomically (daily upsert, monthly upsert,
//! flag flip in a single transaction). Rollups are incremented rather than
//! replaced, so repeated runs are cumulative-safe and a crash between
//! groups only defers work to the next pass.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache::CacheLayer;
use crate::config::AggregationConfig;
use crate::counts::BucketCounts;
use crate::db::{Database, RollupApplied};
use crate::error::ApiError;

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregationReport {
    pub records_processed: u64,
    pub daily_created: u64,
    pub daily_updated: u64,
    pub monthly_created: u64,
    pub monthly_updated: u64,
    pub dates_touched: Vec<NaiveDate>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(AggregationReport),
    /// Another pass holds the single-flight lock.
    AlreadyRunning,
}

/// A pass that stopped early. The committed groups stay committed; their
/// counts are in `partial` and the failed group's records remain flagged
/// unaggregated for the next pass.
#[derive(Debug, thiserror::Error)]
#[error("aggregation halted after {} records: {source}", partial.records_processed)]
pub struct AggregationHalted {
    pub partial: AggregationReport,
    #[source]
    pub source: sqlx::Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyCheck {
    pub date: NaiveDate,
    pub raw_total: i64,
    pub rollup_total: i64,
    pub pending_total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregationStatus {
    pub detection_records: i64,
    pub unaggregated_records: i64,
    pub daily_rollups: i64,
    pub monthly_rollups: i64,
    pub last_run: Option<AggregationReport>,
}

pub struct AggregationEngine {
    db: Database,
    cache: Arc<CacheLayer>,
    config: AggregationConfig,
    lock: tokio::sync::Mutex<()>,
    last_run: std::sync::Mutex<Option<AggregationReport>>,
}

impl AggregationEngine {
    pub fn new(db: Database, cache: Arc<CacheLayer>, config: AggregationConfig) -> Self {
        Self {
            db,
            cache,
            config,
            lock: tokio::sync::Mutex::new(()),
            last_run: std::sync::Mutex::new(None),
        }
    }

    /// Runs one aggregation pass. Never blocks on a concurrent pass; the
    /// second caller gets `AlreadyRunning` and the counters it would have
    /// folded are picked up by the pass holding the lock or the next one.
    pub async fn run(&self) -> Result<RunOutcome, AggregationHalted> {
        let _guard = match self.lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Ok(RunOutcome::AlreadyRunning),
        };

        let batch = self
            .db
            .unaggregated_batch(self.config.max_batch)
            .await
            .map_err(|source| AggregationHalted {
                partial: AggregationReport::default(),
                source,
            })?;

        // Explicit in-memory grouping: the upsert-by-addition invariant
        // lives here and nowhere else.
        let mut groups: BTreeMap<NaiveDate, (BucketCounts, Vec<i64>)> = BTreeMap::new();
        for record in &batch {
            let entry = groups.entry(record.timestamp.date_naive()).or_default();
            entry.0.add(&record.counts);
            entry.1.push(record.id);
        }

        let mut report = AggregationReport::default();
        let mut months_touched: HashSet<(i32, u32)> = HashSet::new();

        for (date, (sums, ids)) in groups {
            match self.apply_with_retry(date, &sums, &ids).await {
                Ok(applied) => {
                    report.records_processed += ids.len() as u64;
                    if applied.daily_created {
                        report.daily_created += 1;
                    } else {
                        report.daily_updated += 1;
                    }
                    // A month spanning several date groups counts once per
                    // pass, on its first touch.
                    if months_touched.insert((date.year(), date.month())) {
                        if applied.monthly_created {
                            report.monthly_created += 1;
                        } else {
                            report.monthly_updated += 1;
                        }
                    }
                    report.dates_touched.push(date);
                }
                Err(source) => {
                    self.cache.invalidate_dates(&report.dates_touched).await;
                    self.store_last_run(&report);
                    return Err(AggregationHalted {
                        partial: report,
                        source,
                    });
                }
            }
        }

        if !report.dates_touched.is_empty() {
            self.cache.invalidate_dates(&report.dates_touched).await;
            info!(
                records = report.records_processed,
                daily_created = report.daily_created,
                daily_updated = report.daily_updated,
                monthly_created = report.monthly_created,
                monthly_updated = report.monthly_updated,
                "aggregation pass complete"
            );
        }

        self.store_last_run(&report);
        Ok(RunOutcome::Completed(report))
    }

    async fn apply_with_retry(
        &self,
        date: NaiveDate,
        sums: &BucketCounts,
        ids: &[i64],
    ) -> Result<RollupApplied, sqlx::Error> {
        let mut attempt: u32 = 0;
        loop {
            match self.db.apply_rollups(date, sums, ids).await {
                Ok(applied) => return Ok(applied),
                Err(e) if attempt + 1 < self.config.retry_attempts && is_transient(&e) => {
                    let delay = self
                        .config
                        .retry_base_ms
                        .saturating_mul(1u64 << attempt.min(8));
                    let jitter = rand::thread_rng().gen_range(0..=self.config.retry_base_ms.max(1));
                    warn!(
                        %date,
                        attempt,
                        "transient rollup failure, retrying in {}ms: {}",
                        delay + jitter,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(delay + jitter)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Diagnostic pass: the daily rollup plus still-pending raw records
    /// must equal the full raw sum for the date. Divergence is surfaced,
    /// never silently corrected.
    pub async fn verify(&self, date: NaiveDate) -> Result<ConsistencyCheck, ApiError> {
        let raw = self.db.raw_day_sum(date).await?;
        let rollup = self.db.daily_rollup(date).await?.unwrap_or_default();
        let pending = self.db.raw_day_sum_unaggregated(date).await?;

        let mut expected = rollup;
        expected.add(&pending);
        if expected != raw {
            return Err(ApiError::Consistency(format!(
                "rollup drift for {date}: rollup {} + pending {} != raw {}",
                rollup.total(),
                pending.total(),
                raw.total()
            )));
        }

        Ok(ConsistencyCheck {
            date,
            raw_total: raw.total(),
            rollup_total: rollup.total(),
            pending_total: pending.total(),
        })
    }

    pub async fn status(&self) -> Result<AggregationStatus, sqlx::Error> {
        Ok(AggregationStatus {
            detection_records: self.db.detection_count().await?,
            unaggregated_records: self.db.unaggregated_count().await?,
            daily_rollups: self.db.daily_rollup_count().await?,
            monthly_rollups: self.db.monthly_rollup_count().await?,
            last_run: self.last_run.lock().ok().and_then(|g| g.clone()),
        })
    }

    fn store_last_run(&self, report: &AggregationReport) {
        if let Ok(mut guard) = self.last_run.lock() {
            *guard = Some(report.clone());
        }
    }
}

/// Errors worth retrying: connection-level hiccups and SQLite lock
/// contention. Constraint and decode errors are not.
fn is_transient(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            let message = db.message().to_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}

pub type DateTouchedSender = mpsc::UnboundedSender<NaiveDate>;

/// Background scheduler. Ingestion pushes the touched date into the queue;
/// the loop folds pending work on the next interval tick. The first tick
/// fires immediately, draining any backlog a crash left behind.
pub fn start_scheduler(
    engine: Arc<AggregationEngine>,
    mut rx: mpsc::UnboundedReceiver<NaiveDate>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(engine.config.interval_secs);
        let mut tick = tokio::time::interval(interval);
        let mut pending = true;

        info!(interval_secs = engine.config.interval_secs, "aggregation scheduler started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if !pending {
                        continue;
                    }
                    while rx.try_recv().is_ok() {}
                    pending = false;
                    match engine.run().await {
                        Ok(RunOutcome::Completed(report)) => {
                            // A full batch means more is waiting.
                            if report.records_processed >= engine.config.max_batch as u64 {
                                pending = true;
                            }
                        }
                        Ok(RunOutcome::AlreadyRunning) => {
                            debug!("aggregation already in flight, skipping tick");
                        }
                        Err(e) => {
                            error!("aggregation pass failed: {}", e);
                            pending = true;
                        }
                    }
                }
                notice = rx.recv() => {
                    match notice {
                        Some(_) => pending = true,
                        None => {
                            info!("aggregation scheduler shutting down");
                            break;
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StatsKey;
    use crate::config::CacheConfig;
    use chrono::{DateTime, Utc};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(date: NaiveDate, hour: u32) -> DateTime<Utc> {
        date.and_hms_opt(hour, 0, 0).unwrap().and_utc()
    }

    fn counts(total_per_sex: i64) -> BucketCounts {
        BucketCounts {
            male_20_29: total_per_sex,
            female_20_29: total_per_sex,
            ..BucketCounts::default()
        }
    }

    async fn engine_with(config: AggregationConfig) -> (Arc<AggregationEngine>, Database, Arc<CacheLayer>) {
        let db = Database::connect_memory().await.unwrap();
        let cache = Arc::new(CacheLayer::local_only(&CacheConfig::default()));
        let engine = Arc::new(AggregationEngine::new(db.clone(), cache.clone(), config));
        (engine, db, cache)
    }

    async fn engine() -> (Arc<AggregationEngine>, Database, Arc<CacheLayer>) {
        engine_with(AggregationConfig::default()).await
    }

    fn completed(outcome: RunOutcome) -> AggregationReport {
        match outcome {
            RunOutcome::Completed(report) => report,
            RunOutcome::AlreadyRunning => panic!("expected a completed pass"),
        }
    }

    #[tokio::test]
    async fn second_run_with_no_new_records_is_a_noop() {
        let (engine, db, _) = engine().await;
        let d = date(2026, 8, 20);
        for hour in [9, 10, 11] {
            db.insert_detection(at(d, hour), &counts(2)).await.unwrap();
        }

        let first = completed(engine.run().await.unwrap());
        assert_eq!(first.records_processed, 3);
        assert_eq!(first.daily_created, 1);
        assert_eq!(first.monthly_created, 1);

        let rollup_after_first = db.daily_rollup(d).await.unwrap().unwrap();

        let second = completed(engine.run().await.unwrap());
        assert_eq!(second.records_processed, 0);
        assert_eq!(second.daily_created, 0);
        assert_eq!(second.daily_updated, 0);
        assert!(second.dates_touched.is_empty());

        let rollup_after_second = db.daily_rollup(d).await.unwrap().unwrap();
        assert_eq!(rollup_after_first, rollup_after_second);
    }

    #[tokio::test]
    async fn rollup_equals_raw_sum_across_interleaved_passes() {
        let (engine, db, _) = engine().await;
        let d = date(2026, 8, 20);

        db.insert_detection(at(d, 9), &counts(3)).await.unwrap();
        db.insert_detection(at(d, 10), &counts(4)).await.unwrap();
        completed(engine.run().await.unwrap());

        // Late data for the same date arrives after the first pass.
        db.insert_detection(at(d, 11), &counts(5)).await.unwrap();
        let second = completed(engine.run().await.unwrap());
        assert_eq!(second.records_processed, 1);
        assert_eq!(second.daily_updated, 1);
        assert_eq!(second.monthly_updated, 1);

        let rollup = db.daily_rollup(d).await.unwrap().unwrap();
        let raw = db.raw_day_sum(d).await.unwrap();
        assert_eq!(rollup, raw);
        assert_eq!(rollup.total(), 24);
    }

    #[tokio::test]
    async fn monthly_rollup_equals_sum_of_daily_rollups() {
        let (engine, db, _) = engine().await;
        db.insert_detection(at(date(2026, 7, 30), 9), &counts(1))
            .await
            .unwrap();
        db.insert_detection(at(date(2026, 7, 31), 9), &counts(2))
            .await
            .unwrap();
        db.insert_detection(at(date(2026, 8, 1), 9), &counts(3))
            .await
            .unwrap();

        let report = completed(engine.run().await.unwrap());
        assert_eq!(report.daily_created, 3);
        assert_eq!(report.monthly_created, 2);

        for (year, month) in [(2026, 7), (2026, 8)] {
            let monthly = db
                .monthly_rollups_range(year, month, year, month)
                .await
                .unwrap();
            let month_start = date(year, month, 1);
            let month_end = date(year, month, 31);
            let dailies = db.daily_rollups_range(month_start, month_end).await.unwrap();
            let mut daily_sum = BucketCounts::default();
            for row in &dailies {
                daily_sum.add(&row.counts);
            }
            assert_eq!(monthly[0].counts, daily_sum);
        }
    }

    #[tokio::test]
    async fn batch_cap_defers_remaining_groups_to_next_pass() {
        let config = AggregationConfig {
            max_batch: 1,
            ..AggregationConfig::default()
        };
        let (engine, db, _) = engine_with(config).await;
        db.insert_detection(at(date(2026, 8, 19), 9), &counts(1))
            .await
            .unwrap();
        db.insert_detection(at(date(2026, 8, 20), 9), &counts(2))
            .await
            .unwrap();

        let first = completed(engine.run().await.unwrap());
        assert_eq!(first.records_processed, 1);
        assert_eq!(first.dates_touched, vec![date(2026, 8, 19)]);
        assert_eq!(db.unaggregated_count().await.unwrap(), 1);

        let second = completed(engine.run().await.unwrap());
        assert_eq!(second.records_processed, 1);
        assert_eq!(second.dates_touched, vec![date(2026, 8, 20)]);
        assert_eq!(db.unaggregated_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_run_reports_already_running() {
        let (engine, _, _) = engine().await;
        let _held = engine.lock.try_lock().unwrap();
        assert!(matches!(
            engine.run().await.unwrap(),
            RunOutcome::AlreadyRunning
        ));
    }

    #[tokio::test]
    async fn run_invalidates_cache_for_touched_dates() {
        let (engine, db, cache) = engine().await;
        let d = date(2026, 8, 20);
        let key = StatsKey::range(date(2026, 8, 18), date(2026, 8, 22), false);
        cache
            .put(&key, "stale".into(), Duration::from_secs(300))
            .await;

        db.insert_detection(at(d, 9), &counts(1)).await.unwrap();
        completed(engine.run().await.unwrap());

        assert_eq!(cache.get(&key).await, None);
    }

    #[tokio::test]
    async fn verify_accepts_consistent_dates_and_flags_drift() {
        let (engine, db, _) = engine().await;
        let d = date(2026, 8, 20);
        db.insert_detection(at(d, 9), &counts(3)).await.unwrap();

        // Consistent while pending and after folding.
        engine.verify(d).await.unwrap();
        completed(engine.run().await.unwrap());
        let check = engine.verify(d).await.unwrap();
        assert_eq!(check.rollup_total, 6);
        assert_eq!(check.pending_total, 0);

        // Manufacture drift by double-applying a group out of band.
        db.apply_rollups(d, &counts(1), &[]).await.unwrap();
        let err = engine.verify(d).await.unwrap_err();
        assert_eq!(err.code(), "CONSISTENCY_ERROR");
    }

    #[tokio::test]
    async fn status_tracks_backlog_and_last_run() {
        let (engine, db, _) = engine().await;
        let d = date(2026, 8, 20);
        db.insert_detection(at(d, 9), &counts(1)).await.unwrap();

        let before = engine.status().await.unwrap();
        assert_eq!(before.detection_records, 1);
        assert_eq!(before.unaggregated_records, 1);
        assert_eq!(before.daily_rollups, 0);
        assert!(before.last_run.is_none());

        completed(engine.run().await.unwrap());

        let after = engine.status().await.unwrap();
        assert_eq!(after.unaggregated_records, 0);
        assert_eq!(after.daily_rollups, 1);
        assert_eq!(after.monthly_rollups, 1);
        let last = after.last_run.unwrap();
        assert_eq!(last.records_processed, 1);
    }
}
