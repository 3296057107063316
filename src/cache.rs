//! Stats result cache: Redis primary with a process-local TTL fallback
//!
//! The cache is an optimization over the query service, never a source of
//! truth. If Redis is unreachable the layer degrades to an unshared local
//! map; correctness is unaffected, only cross-instance coherency.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use redis::aio::ConnectionManager;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;

/// Canonical descriptor for a cached stats result. The range and
/// demographics flag are embedded in the rendered key so invalidation can
/// recover them by parsing alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsKey {
    pub shape: KeyShape,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub demographics: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyShape {
    Today,
    Range,
}

impl StatsKey {
    pub fn today(date: NaiveDate, demographics: bool) -> Self {
        Self {
            shape: KeyShape::Today,
            start: date,
            end: date,
            demographics,
        }
    }

    pub fn range(start: NaiveDate, end: NaiveDate, demographics: bool) -> Self {
        Self {
            shape: KeyShape::Range,
            start,
            end,
            demographics,
        }
    }

    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn render(&self) -> String {
        let demo = if self.demographics { "demo" } else { "base" };
        match self.shape {
            KeyShape::Today => format!("stats:today:{}:{}", self.start, demo),
            KeyShape::Range => format!("stats:range:{}:{}:{}", self.start, self.end, demo),
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        let mut parts = key.split(':');
        if parts.next()? != "stats" {
            return None;
        }
        match parts.next()? {
            "today" => {
                let date: NaiveDate = parts.next()?.parse().ok()?;
                let demographics = parts.next()? == "demo";
                Some(Self::today(date, demographics))
            }
            "range" => {
                let start: NaiveDate = parts.next()?.parse().ok()?;
                let end: NaiveDate = parts.next()?.parse().ok()?;
                let demographics = parts.next()? == "demo";
                Some(Self::range(start, end, demographics))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Redis,
    LocalFallback,
    Degraded,
}

struct LocalEntry {
    value: String,
    expires_at: Instant,
    key: StatsKey,
}

pub struct CacheLayer {
    redis: Option<ConnectionManager>,
    local: Mutex<HashMap<String, LocalEntry>>,
    today_ttl: Duration,
    range_ttl: Duration,
}

impl CacheLayer {
    /// Connects the Redis primary if configured; on failure the layer runs
    /// local-only for the life of the process.
    pub async fn connect(config: &CacheConfig) -> Self {
        let redis = if config.url.is_empty() {
            None
        } else {
            match redis::Client::open(config.url.as_str()) {
                Ok(client) => match ConnectionManager::new(client).await {
                    Ok(conn) => Some(conn),
                    Err(e) => {
                        warn!("Redis unreachable, stats cache degraded to local: {}", e);
                        None
                    }
                },
                Err(e) => {
                    warn!("Invalid Redis URL, stats cache degraded to local: {}", e);
                    None
                }
            }
        };

        Self {
            redis,
            local: Mutex::new(HashMap::new()),
            today_ttl: Duration::from_secs(config.today_ttl_secs),
            range_ttl: Duration::from_secs(config.range_ttl_secs),
        }
    }

    pub fn local_only(config: &CacheConfig) -> Self {
        Self {
            redis: None,
            local: Mutex::new(HashMap::new()),
            today_ttl: Duration::from_secs(config.today_ttl_secs),
            range_ttl: Duration::from_secs(config.range_ttl_secs),
        }
    }

    /// Clone of the Redis handle for components sharing the connection
    /// (the rate limiter); `None` when running local-only.
    pub fn redis_handle(&self) -> Option<ConnectionManager> {
        self.redis.clone()
    }

    /// Ranges touching the open day expire on the short TTL since their
    /// totals move with every ingested record.
    pub fn ttl_for(&self, key: &StatsKey) -> Duration {
        if key.end >= Utc::now().date_naive() {
            self.today_ttl
        } else {
            self.range_ttl
        }
    }

    pub async fn get(&self, key: &StatsKey) -> Option<String> {
        let rendered = key.render();

        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            match redis::cmd("GET")
                .arg(&rendered)
                .query_async::<_, Option<String>>(&mut conn)
                .await
            {
                Ok(Some(value)) => {
                    debug!(key = %rendered, "cache hit (redis)");
                    return Some(value);
                }
                Ok(None) => {}
                Err(e) => warn!("Redis GET failed, falling back to local cache: {}", e),
            }
        }

        let mut local = self.local.lock().ok()?;
        match local.get(&rendered) {
            Some(entry) if entry.expires_at > Instant::now() => {
                debug!(key = %rendered, "cache hit (local)");
                Some(entry.value.clone())
            }
            Some(_) => {
                local.remove(&rendered);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, key: &StatsKey, value: String, ttl: Duration) {
        let rendered = key.render();
        let ttl_secs = ttl.as_secs().max(1);

        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            match redis::cmd("SETEX")
                .arg(&rendered)
                .arg(ttl_secs)
                .arg(&value)
                .query_async::<_, ()>(&mut conn)
                .await
            {
                Ok(()) => return,
                Err(e) => warn!("Redis SETEX failed, caching locally: {}", e),
            }
        }

        if let Ok(mut local) = self.local.lock() {
            if local.len() > 256 {
                let now = Instant::now();
                local.retain(|_, entry| entry.expires_at > now);
            }
            local.insert(
                rendered,
                LocalEntry {
                    value,
                    expires_at: Instant::now() + ttl,
                    key: *key,
                },
            );
        }
    }

    /// Evicts every entry whose range covers any of the given dates. Called
    /// by the aggregation engine after each pass and by ingestion for the
    /// new record's date.
    pub async fn invalidate_dates(&self, dates: &[NaiveDate]) {
        if dates.is_empty() {
            return;
        }

        if let Ok(mut local) = self.local.lock() {
            local.retain(|_, entry| !dates.iter().any(|d| entry.key.covers(*d)));
        }

        let Some(conn) = &self.redis else { return };
        let mut conn = conn.clone();

        let mut stale: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let scanned: Result<(u64, Vec<String>), redis::RedisError> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("stats:*")
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await;
            let (next, keys) = match scanned {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Redis SCAN failed during invalidation: {}", e);
                    return;
                }
            };
            stale.extend(keys.into_iter().filter(|k| {
                StatsKey::parse(k)
                    .map(|parsed| dates.iter().any(|d| parsed.covers(*d)))
                    .unwrap_or(false)
            }));
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        if stale.is_empty() {
            return;
        }
        debug!(count = stale.len(), "invalidating cached stats");
        if let Err(e) = redis::cmd("DEL")
            .arg(&stale)
            .query_async::<_, ()>(&mut conn)
            .await
        {
            warn!("Redis DEL failed during invalidation: {}", e);
        }
    }

    pub async fn status(&self) -> CacheStatus {
        match &self.redis {
            Some(conn) => {
                let mut conn = conn.clone();
                match redis::cmd("PING").query_async::<_, String>(&mut conn).await {
                    Ok(_) => CacheStatus::Redis,
                    Err(_) => CacheStatus::Degraded,
                }
            }
            None => CacheStatus::LocalFallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn key_render_parse_roundtrip() {
        let keys = [
            StatsKey::today(date(2026, 8, 25), true),
            StatsKey::today(date(2026, 8, 25), false),
            StatsKey::range(date(2026, 8, 1), date(2026, 8, 25), false),
        ];
        for key in keys {
            assert_eq!(StatsKey::parse(&key.render()), Some(key));
        }
        assert_eq!(StatsKey::parse("rl:ip:1.2.3.4"), None);
        assert_eq!(StatsKey::parse("stats:range:bogus:2026-08-25:base"), None);
    }

    #[tokio::test]
    async fn local_put_get_roundtrip() {
        let cache = CacheLayer::local_only(&CacheConfig::default());
        let key = StatsKey::range(date(2026, 8, 1), date(2026, 8, 5), false);

        assert_eq!(cache.get(&key).await, None);
        cache
            .put(&key, "{\"total\":21}".into(), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get(&key).await.as_deref(), Some("{\"total\":21}"));

        // Demographics variant is a distinct entry.
        let demo = StatsKey::range(date(2026, 8, 1), date(2026, 8, 5), true);
        assert_eq!(cache.get(&demo).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn local_entries_expire() {
        let cache = CacheLayer::local_only(&CacheConfig::default());
        let key = StatsKey::today(date(2026, 8, 25), false);

        cache.put(&key, "v".into(), Duration::from_secs(30)).await;
        assert!(cache.get(&key).await.is_some());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.get(&key).await, None);
    }

    #[tokio::test]
    async fn invalidation_is_scoped_to_covering_ranges() {
        let cache = CacheLayer::local_only(&CacheConfig::default());
        let touched = StatsKey::range(date(2026, 8, 1), date(2026, 8, 10), false);
        let untouched = StatsKey::range(date(2026, 8, 11), date(2026, 8, 20), false);
        let single = StatsKey::today(date(2026, 8, 5), true);

        cache.put(&touched, "a".into(), Duration::from_secs(60)).await;
        cache
            .put(&untouched, "b".into(), Duration::from_secs(60))
            .await;
        cache.put(&single, "c".into(), Duration::from_secs(60)).await;

        cache.invalidate_dates(&[date(2026, 8, 5)]).await;

        assert_eq!(cache.get(&touched).await, None);
        assert_eq!(cache.get(&single).await, None);
        assert_eq!(cache.get(&untouched).await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn ttl_tiers_follow_the_open_day() {
        let config = CacheConfig::default();
        let cache = CacheLayer::local_only(&config);
        let today = Utc::now().date_naive();

        let open = StatsKey::today(today, false);
        let closed = StatsKey::range(
            today - chrono::Days::new(10),
            today - chrono::Days::new(1),
            false,
        );
        let spanning = StatsKey::range(today - chrono::Days::new(10), today, false);

        assert_eq!(
            cache.ttl_for(&open),
            Duration::from_secs(config.today_ttl_secs)
        );
        assert_eq!(
            cache.ttl_for(&closed),
            Duration::from_secs(config.range_ttl_secs)
        );
        assert_eq!(
            cache.ttl_for(&spanning),
            Duration::from_secs(config.today_ttl_secs)
        );
    }

    #[tokio::test]
    async fn status_reports_local_when_no_redis() {
        let cache = CacheLayer::local_only(&CacheConfig::default());
        assert_eq!(cache.status().await, CacheStatus::LocalFallback);
    }
}
