//! Database module

mod schema;

use anyhow::Result;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteArguments, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

use crate::config::DatabaseConfig;
use crate::counts::BucketCounts;

/// One raw detection event as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDetection {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub counts: BucketCounts,
    pub aggregated: bool,
}

#[derive(sqlx::FromRow)]
struct DetectionRow {
    id: i64,
    timestamp: i64,
    #[sqlx(flatten)]
    counts: BucketCounts,
    aggregated: bool,
}

impl From<DetectionRow> for StoredDetection {
    fn from(row: DetectionRow) -> Self {
        StoredDetection {
            id: row.id,
            timestamp: DateTime::from_timestamp_millis(row.timestamp).unwrap_or_else(Utc::now),
            counts: row.counts,
            aggregated: row.aggregated,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DailyRollupRow {
    pub date: NaiveDate,
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub counts: BucketCounts,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MonthlyRollupRow {
    pub year: i32,
    pub month: u32,
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub counts: BucketCounts,
}

#[derive(sqlx::FromRow)]
struct HourlyRow {
    hour: i64,
    #[sqlx(flatten)]
    counts: BucketCounts,
}

/// Whether the per-date transaction created or incremented each rollup row.
#[derive(Debug, Clone, Copy)]
pub struct RollupApplied {
    pub daily_created: bool,
    pub monthly_created: bool,
}

/// Millisecond bounds [start, end) of a UTC calendar date.
fn day_bounds_millis(date: NaiveDate) -> (i64, i64) {
    let start = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
    let end = date
        .checked_add_days(Days::new(1))
        .map(|d| d.and_time(NaiveTime::MIN).and_utc().timestamp_millis())
        .unwrap_or(i64::MAX);
    (start, end)
}

fn bind_counts<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    counts: &BucketCounts,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    query
        .bind(counts.male_0_9)
        .bind(counts.male_10_19)
        .bind(counts.male_20_29)
        .bind(counts.male_30_39)
        .bind(counts.male_40_49)
        .bind(counts.male_50_plus)
        .bind(counts.female_0_9)
        .bind(counts.female_10_19)
        .bind(counts.female_20_29)
        .bind(counts.female_30_39)
        .bind(counts.female_40_49)
        .bind(counts.female_50_plus)
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&format!("sqlite:{}?mode=rwc", config.url))
            .await?;
        Ok(Self { pool })
    }

    /// Private in-memory database for tests. Single connection so every
    /// query sees the same memory store.
    #[cfg(test)]
    pub async fn connect_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        // Enable WAL mode for better concurrency
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        sqlx::query(schema::CREATE_DETECTIONS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_DAILY_ROLLUPS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_MONTHLY_ROLLUPS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_TIMESTAMP)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_UNAGGREGATED)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_detection(
        &self,
        timestamp: DateTime<Utc>,
        counts: &BucketCounts,
    ) -> Result<i64, sqlx::Error> {
        let sql = format!(
            "INSERT INTO detections (timestamp, {}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            schema::bucket_column_list()
        );
        let query = sqlx::query(&sql).bind(timestamp.timestamp_millis());
        let result = bind_counts(query, counts).execute(&self.pool).await?;
        Ok(result.last_insert_rowid())
    }

    /// Most recent detections within the trailing window, newest first.
    pub async fn recent_detections(
        &self,
        since_hours: i64,
        limit: i64,
    ) -> Result<Vec<StoredDetection>, sqlx::Error> {
        let since = Utc::now().timestamp_millis() - since_hours * 3600 * 1000;
        let sql = format!(
            "SELECT id, timestamp, {}, aggregated FROM detections \
             WHERE timestamp > ? ORDER BY timestamp DESC, id DESC LIMIT ?",
            schema::bucket_column_list()
        );
        let rows: Vec<DetectionRow> = sqlx::query_as(&sql)
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(StoredDetection::from).collect())
    }

    /// The aggregation batch: oldest not-yet-aggregated records first.
    pub async fn unaggregated_batch(&self, limit: u32) -> Result<Vec<StoredDetection>, sqlx::Error> {
        let sql = format!(
            "SELECT id, timestamp, {}, aggregated FROM detections \
             WHERE aggregated = 0 ORDER BY timestamp, id LIMIT ?",
            schema::bucket_column_list()
        );
        let rows: Vec<DetectionRow> = sqlx::query_as(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(StoredDetection::from).collect())
    }

    pub async fn unaggregated_count(&self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM detections WHERE aggregated = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn detection_count(&self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM detections")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Applies one date group atomically: add `sums` to the daily and
    /// monthly rollups, then flip the aggregated flag for exactly `ids`.
    /// All-or-nothing, so a retry after a crash can never double-add.
    pub async fn apply_rollups(
        &self,
        date: NaiveDate,
        sums: &BucketCounts,
        ids: &[i64],
    ) -> Result<RollupApplied, sqlx::Error> {
        use chrono::Datelike;

        let year = date.year();
        let month = date.month();
        let mut tx = self.pool.begin().await?;

        let daily_exists: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM daily_rollups WHERE date = ?")
                .bind(date)
                .fetch_optional(&mut *tx)
                .await?;

        let daily_sql = format!(
            "INSERT INTO daily_rollups (date, {}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(date) DO UPDATE SET {}",
            schema::bucket_column_list(),
            schema::bucket_additive_update_list()
        );
        bind_counts(sqlx::query(&daily_sql).bind(date), sums)
            .execute(&mut *tx)
            .await?;

        let monthly_exists: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM monthly_rollups WHERE year = ? AND month = ?")
                .bind(year)
                .bind(month)
                .fetch_optional(&mut *tx)
                .await?;

        let monthly_sql = format!(
            "INSERT INTO monthly_rollups (year, month, {}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(year, month) DO UPDATE SET {}",
            schema::bucket_column_list(),
            schema::bucket_additive_update_list()
        );
        bind_counts(sqlx::query(&monthly_sql).bind(year).bind(month), sums)
            .execute(&mut *tx)
            .await?;

        if !ids.is_empty() {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let mark_sql =
                format!("UPDATE detections SET aggregated = 1 WHERE id IN ({placeholders})");
            let mut mark = sqlx::query(&mark_sql);
            for id in ids {
                mark = mark.bind(id);
            }
            mark.execute(&mut *tx).await?;
        }

        tx.commit().await?;

        Ok(RollupApplied {
            daily_created: daily_exists.is_none(),
            monthly_created: monthly_exists.is_none(),
        })
    }

    /// Per-bucket sums over every raw record of a date, aggregated or not.
    pub async fn raw_day_sum(&self, date: NaiveDate) -> Result<BucketCounts, sqlx::Error> {
        let (start, end) = day_bounds_millis(date);
        let sql = format!(
            "SELECT {} FROM detections WHERE timestamp >= ? AND timestamp < ?",
            schema::bucket_sum_list()
        );
        sqlx::query_as(&sql)
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await
    }

    /// Same sum restricted to records not yet folded into rollups.
    pub async fn raw_day_sum_unaggregated(
        &self,
        date: NaiveDate,
    ) -> Result<BucketCounts, sqlx::Error> {
        let (start, end) = day_bounds_millis(date);
        let sql = format!(
            "SELECT {} FROM detections \
             WHERE timestamp >= ? AND timestamp < ? AND aggregated = 0",
            schema::bucket_sum_list()
        );
        sqlx::query_as(&sql)
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await
    }

    /// Raw per-hour sums for one date. Hours with no records are absent.
    pub async fn hourly_breakdown(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<(u32, BucketCounts)>, sqlx::Error> {
        let (start, end) = day_bounds_millis(date);
        let sql = format!(
            "SELECT CAST(strftime('%H', timestamp / 1000, 'unixepoch') AS INTEGER) AS hour, {} \
             FROM detections WHERE timestamp >= ? AND timestamp < ? \
             GROUP BY hour ORDER BY hour",
            schema::bucket_sum_list()
        );
        let rows: Vec<HourlyRow> = sqlx::query_as(&sql)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.hour.clamp(0, 23) as u32, r.counts))
            .collect())
    }

    pub async fn last_detection_at(
        &self,
        date: NaiveDate,
    ) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        let (start, end) = day_bounds_millis(date);
        let row: (Option<i64>,) = sqlx::query_as(
            "SELECT MAX(timestamp) FROM detections WHERE timestamp >= ? AND timestamp < ?",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.and_then(DateTime::from_timestamp_millis))
    }

    pub async fn daily_rollup(&self, date: NaiveDate) -> Result<Option<BucketCounts>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM daily_rollups WHERE date = ?",
            schema::bucket_column_list()
        );
        sqlx::query_as(&sql)
            .bind(date)
            .fetch_optional(&self.pool)
            .await
    }

    /// Daily rollup rows with `start <= date <= end`, ascending.
    pub async fn daily_rollups_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyRollupRow>, sqlx::Error> {
        let sql = format!(
            "SELECT date, {} FROM daily_rollups WHERE date >= ? AND date <= ? ORDER BY date",
            schema::bucket_column_list()
        );
        sqlx::query_as(&sql)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
    }

    /// Monthly rollup rows between (start_year, start_month) and
    /// (end_year, end_month) inclusive, ascending.
    pub async fn monthly_rollups_range(
        &self,
        start_year: i32,
        start_month: u32,
        end_year: i32,
        end_month: u32,
    ) -> Result<Vec<MonthlyRollupRow>, sqlx::Error> {
        let sql = format!(
            "SELECT year, month, {} FROM monthly_rollups \
             WHERE (year > ? OR (year = ? AND month >= ?)) \
             AND (year < ? OR (year = ? AND month <= ?)) \
             ORDER BY year, month",
            schema::bucket_column_list()
        );
        sqlx::query_as(&sql)
            .bind(start_year)
            .bind(start_year)
            .bind(start_month)
            .bind(end_year)
            .bind(end_year)
            .bind(end_month)
            .fetch_all(&self.pool)
            .await
    }

    /// Newest daily rollups for the listing endpoint.
    pub async fn daily_rollups_page(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        limit: i64,
    ) -> Result<Vec<DailyRollupRow>, sqlx::Error> {
        let sql = format!(
            "SELECT date, {} FROM daily_rollups \
             WHERE date >= ? AND date <= ? ORDER BY date DESC LIMIT ?",
            schema::bucket_column_list()
        );
        // Dates are TEXT YYYY-MM-DD; string sentinels sort outside any real
        // value, sparing a second SQL shape for the unbounded case.
        let lo = start.map(|d| d.to_string()).unwrap_or_else(|| "0000-00-00".into());
        let hi = end.map(|d| d.to_string()).unwrap_or_else(|| "9999-99-99".into());
        sqlx::query_as(&sql)
            .bind(lo)
            .bind(hi)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    /// Newest monthly rollups for the listing endpoint.
    pub async fn monthly_rollups_page(&self, limit: i64) -> Result<Vec<MonthlyRollupRow>, sqlx::Error> {
        let sql = format!(
            "SELECT year, month, {} FROM monthly_rollups ORDER BY year DESC, month DESC LIMIT ?",
            schema::bucket_column_list()
        );
        sqlx::query_as(&sql).bind(limit).fetch_all(&self.pool).await
    }

    pub async fn daily_rollup_count(&self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM daily_rollups")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn monthly_rollup_count(&self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM monthly_rollups")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_counts(scale: i64) -> BucketCounts {
        BucketCounts {
            male_0_9: scale,
            male_10_19: 2 * scale,
            male_20_29: 3 * scale,
            female_30_39: scale,
            female_50_plus: scale,
            ..BucketCounts::default()
        }
    }

    fn at(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
        date.and_hms_opt(hour, minute, 0).unwrap().and_utc()
    }

    #[tokio::test]
    async fn insert_and_fetch_roundtrip() {
        let db = Database::connect_memory().await.unwrap();
        // Millisecond-precision "now" so the stored value compares equal and
        // the trailing-window fetch always covers it.
        let ts = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        let counts = sample_counts(1);

        let id = db.insert_detection(ts, &counts).await.unwrap();
        assert!(id > 0);

        let recent = db.recent_detections(24, 50).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, id);
        assert_eq!(recent[0].counts, counts);
        assert_eq!(recent[0].timestamp, ts);
        assert!(!recent[0].aggregated);
    }

    #[tokio::test]
    async fn unaggregated_batch_is_ordered_and_gated() {
        let db = Database::connect_memory().await.unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 8, 20).unwrap();

        let late = db
            .insert_detection(at(date, 12, 0), &sample_counts(1))
            .await
            .unwrap();
        let early = db
            .insert_detection(at(date, 9, 0), &sample_counts(1))
            .await
            .unwrap();

        let batch = db.unaggregated_batch(10).await.unwrap();
        assert_eq!(
            batch.iter().map(|d| d.id).collect::<Vec<_>>(),
            vec![early, late]
        );

        let sums = db.raw_day_sum(date).await.unwrap();
        db.apply_rollups(date, &sums, &[early, late]).await.unwrap();
        assert!(db.unaggregated_batch(10).await.unwrap().is_empty());
        assert_eq!(db.unaggregated_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn apply_rollups_is_cumulative() {
        let db = Database::connect_memory().await.unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 8, 20).unwrap();

        let first = db
            .apply_rollups(date, &sample_counts(1), &[])
            .await
            .unwrap();
        assert!(first.daily_created);
        assert!(first.monthly_created);

        let second = db
            .apply_rollups(date, &sample_counts(2), &[])
            .await
            .unwrap();
        assert!(!second.daily_created);
        assert!(!second.monthly_created);

        let rollup = db.daily_rollup(date).await.unwrap().unwrap();
        assert_eq!(rollup.male_0_9, 3);
        assert_eq!(rollup.male_20_29, 9);
        assert_eq!(rollup.total(), sample_counts(1).total() + sample_counts(2).total());

        let months = db.monthly_rollups_range(2026, 8, 2026, 8).await.unwrap();
        assert_eq!(months.len(), 1);
        assert_eq!(months[0].counts.total(), rollup.total());
    }

    #[tokio::test]
    async fn raw_day_sum_respects_date_bounds() {
        let db = Database::connect_memory().await.unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 8, 20).unwrap();
        let next = NaiveDate::from_ymd_opt(2026, 8, 21).unwrap();

        db.insert_detection(at(date, 0, 0), &sample_counts(1))
            .await
            .unwrap();
        db.insert_detection(
            date.and_hms_milli_opt(23, 59, 59, 999).unwrap().and_utc(),
            &sample_counts(1),
        )
        .await
        .unwrap();
        db.insert_detection(at(next, 0, 0), &sample_counts(5))
            .await
            .unwrap();

        let sums = db.raw_day_sum(date).await.unwrap();
        assert_eq!(sums.total(), 2 * sample_counts(1).total());

        let next_sums = db.raw_day_sum(next).await.unwrap();
        assert_eq!(next_sums.total(), sample_counts(5).total());
    }

    #[tokio::test]
    async fn hourly_breakdown_groups_by_hour() {
        let db = Database::connect_memory().await.unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 8, 20).unwrap();

        db.insert_detection(at(date, 9, 5), &sample_counts(1))
            .await
            .unwrap();
        db.insert_detection(at(date, 9, 45), &sample_counts(1))
            .await
            .unwrap();
        db.insert_detection(at(date, 14, 0), &sample_counts(2))
            .await
            .unwrap();

        let hours = db.hourly_breakdown(date).await.unwrap();
        assert_eq!(hours.len(), 2);
        assert_eq!(hours[0].0, 9);
        assert_eq!(hours[0].1.total(), 2 * sample_counts(1).total());
        assert_eq!(hours[1].0, 14);
        assert_eq!(hours[1].1.total(), sample_counts(2).total());
    }

    #[tokio::test]
    async fn empty_day_sums_to_zero() {
        let db = Database::connect_memory().await.unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 8, 20).unwrap();
        let sums = db.raw_day_sum(date).await.unwrap();
        assert_eq!(sums, BucketCounts::default());
        assert!(db.last_detection_at(date).await.unwrap().is_none());
    }
}
