//! Consolidated stats queries
//!
//! Closed dates are answered from rollup tables, the open day from raw
//! records regardless of their aggregation flag, so visible totals never
//! depend on whether a pass has run yet. Results go through the cache
//! layer keyed by the canonical range descriptor.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheLayer, StatsKey};
use crate::config::StatsConfig;
use crate::counts::{BucketCounts, Demographics, Percentages, Totals};
use crate::db::Database;
use crate::error::ApiError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodayStats {
    pub date: NaiveDate,
    pub totals: Totals,
    pub percentages: Percentages,
    /// Hour of day (0..=23) to per-hour totals; empty hours are omitted.
    pub hourly: BTreeMap<u32, Totals>,
    pub last_detection: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demographics: Option<Demographics>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeStats {
    pub period: Period,
    pub granularity: Granularity,
    pub totals: Totals,
    pub percentages: Percentages,
    pub breakdown: Breakdown,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demographics: Option<Demographics>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub days: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hourly,
    Daily,
    Monthly,
}

/// Bucket values keyed by hour, date, or "YYYY-MM" month. The key formats
/// are disjoint, so the untagged decode is unambiguous.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Breakdown {
    Hourly(BTreeMap<u32, Totals>),
    Daily(BTreeMap<NaiveDate, Totals>),
    Monthly(BTreeMap<String, Totals>),
}

pub struct StatsService {
    db: Database,
    cache: Arc<CacheLayer>,
    config: StatsConfig,
}

impl StatsService {
    pub fn new(db: Database, cache: Arc<CacheLayer>, config: StatsConfig) -> Self {
        Self { db, cache, config }
    }

    pub async fn today(&self, demographics: bool) -> Result<TodayStats, ApiError> {
        self.today_at(Utc::now().date_naive(), demographics).await
    }

    pub async fn range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        demographics: bool,
    ) -> Result<RangeStats, ApiError> {
        self.range_at(start, end, Utc::now().date_naive(), demographics)
            .await
    }

    pub(crate) async fn today_at(
        &self,
        today: NaiveDate,
        demographics: bool,
    ) -> Result<TodayStats, ApiError> {
        let key = StatsKey::today(today, demographics);
        if let Some(cached) = self.cache.get(&key).await {
            if let Ok(stats) = serde_json::from_str::<TodayStats>(&cached) {
                return Ok(stats);
            }
        }

        let sum = self.db.raw_day_sum(today).await?;
        let hourly = self
            .db
            .hourly_breakdown(today)
            .await?
            .into_iter()
            .map(|(hour, counts)| (hour, counts.totals()))
            .collect();
        let stats = TodayStats {
            date: today,
            totals: sum.totals(),
            percentages: sum.percentages(),
            hourly,
            last_detection: self.db.last_detection_at(today).await?,
            demographics: demographics.then(|| sum.demographics()),
        };

        self.fill(&key, &stats).await;
        Ok(stats)
    }

    pub(crate) async fn range_at(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        today: NaiveDate,
        demographics: bool,
    ) -> Result<RangeStats, ApiError> {
        if start > end {
            return Err(ApiError::validation(
                "INVALID_RANGE",
                "start date must not be after end date",
            ));
        }
        let days = (end - start).num_days() + 1;
        if days > i64::from(self.config.max_range_days) {
            return Err(ApiError::validation(
                "RANGE_TOO_LARGE",
                format!(
                    "range spans {days} days, maximum is {}",
                    self.config.max_range_days
                ),
            ));
        }

        let key = StatsKey::range(start, end, demographics);
        if let Some(cached) = self.cache.get(&key).await {
            if let Ok(stats) = serde_json::from_str::<RangeStats>(&cached) {
                return Ok(stats);
            }
        }

        let mut sum = BucketCounts::default();
        let (granularity, breakdown) = if days == 1 {
            (
                Granularity::Hourly,
                self.hourly_buckets(start, &mut sum).await?,
            )
        } else if days <= i64::from(self.config.daily_granularity_max_days) {
            (
                Granularity::Daily,
                self.daily_buckets(start, end, today, &mut sum).await?,
            )
        } else {
            (
                Granularity::Monthly,
                self.monthly_buckets(start, end, today, &mut sum).await?,
            )
        };

        let stats = RangeStats {
            period: Period { start, end, days },
            granularity,
            totals: sum.totals(),
            percentages: sum.percentages(),
            breakdown,
            demographics: demographics.then(|| sum.demographics()),
        };

        self.fill(&key, &stats).await;
        Ok(stats)
    }

    /// Single-day ranges are served entirely from raw records. Hours are
    /// the only sub-day resolution we have, and rollups cannot provide it.
    async fn hourly_buckets(
        &self,
        date: NaiveDate,
        sum: &mut BucketCounts,
    ) -> Result<Breakdown, ApiError> {
        sum.add(&self.db.raw_day_sum(date).await?);
        let buckets = self
            .db
            .hourly_breakdown(date)
            .await?
            .into_iter()
            .map(|(hour, counts)| (hour, counts.totals()))
            .collect();
        Ok(Breakdown::Hourly(buckets))
    }

    async fn daily_buckets(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        today: NaiveDate,
        sum: &mut BucketCounts,
    ) -> Result<Breakdown, ApiError> {
        let mut by_date: HashMap<NaiveDate, BucketCounts> = HashMap::new();
        if start < today {
            let closed_end = end.min(today.pred_opt().unwrap_or(end));
            for row in self.db.daily_rollups_range(start, closed_end).await? {
                by_date.insert(row.date, row.counts);
            }
        }

        let mut buckets = BTreeMap::new();
        let mut cursor = start;
        loop {
            let counts = if cursor == today {
                self.db.raw_day_sum(today).await?
            } else if cursor < today {
                by_date.get(&cursor).copied().unwrap_or_default()
            } else {
                BucketCounts::default()
            };
            sum.add(&counts);
            buckets.insert(cursor, counts.totals());
            if cursor >= end {
                break;
            }
            match cursor.succ_opt() {
                Some(next) => cursor = next,
                None => break,
            }
        }
        Ok(Breakdown::Daily(buckets))
    }

    /// Month buckets are calendar-aligned: a boundary mid-month still
    /// reports the whole month. Closed months come from monthly rollups;
    /// the current month is rebuilt from its closed dates' daily rollups
    /// plus today's raw records, so nothing is counted twice.
    async fn monthly_buckets(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        today: NaiveDate,
        sum: &mut BucketCounts,
    ) -> Result<Breakdown, ApiError> {
        let mut by_month: HashMap<(i32, u32), BucketCounts> = HashMap::new();
        for row in self
            .db
            .monthly_rollups_range(start.year(), start.month(), end.year(), end.month())
            .await?
        {
            by_month.insert((row.year, row.month), row.counts);
        }
        let current = (today.year(), today.month());

        let mut buckets = BTreeMap::new();
        let (mut year, mut month) = (start.year(), start.month());
        loop {
            let counts = if (year, month) == current {
                self.open_month_sum(year, month, today).await?
            } else if (year, month) < current {
                by_month.get(&(year, month)).copied().unwrap_or_default()
            } else {
                BucketCounts::default()
            };
            sum.add(&counts);
            buckets.insert(format!("{year:04}-{month:02}"), counts.totals());
            if (year, month) == (end.year(), end.month()) {
                break;
            }
            month += 1;
            if month > 12 {
                month = 1;
                year += 1;
            }
        }
        Ok(Breakdown::Monthly(buckets))
    }

    async fn open_month_sum(
        &self,
        year: i32,
        month: u32,
        today: NaiveDate,
    ) -> Result<BucketCounts, ApiError> {
        let mut counts = BucketCounts::default();
        let month_start = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(today);
        if let Some(yesterday) = today.pred_opt() {
            if yesterday >= month_start {
                for row in self.db.daily_rollups_range(month_start, yesterday).await? {
                    counts.add(&row.counts);
                }
            }
        }
        counts.add(&self.db.raw_day_sum(today).await?);
        Ok(counts)
    }

    async fn fill<T: Serialize>(&self, key: &StatsKey, stats: &T) {
        if let Ok(body) = serde_json::to_string(stats) {
            self.cache.put(key, body, self.cache.ttl_for(key)).await;
        }
    }
}
