//! Sliding-window rate limiting over the shared Redis counter store
//!
//! Counters are transient: losing them only forgets recent request counts,
//! so the policy on store failure is fail-open. Availability of the stats
//! API outranks strict abuse protection for a single-tenant deployment.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Caller tier, resolved by the middleware from the request credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Unauthenticated,
    Authenticated,
    Operator,
}

/// Which limit table column applies. Ingest is its own class because
/// detector scripts post far more often than any human caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Read,
    Write,
    Ingest,
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointClass::Read => "read",
            EndpointClass::Write => "write",
            EndpointClass::Ingest => "ingest",
        };
        f.write_str(name)
    }
}

/// Outcome of one limiter check, echoed into the X-RateLimit-* headers.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub permitted: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds when the current window rolls over.
    pub reset_at: i64,
}

pub struct RateLimiter {
    redis: Option<ConnectionManager>,
    local: Mutex<HashMap<String, (u64, i64)>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// `redis` is the connection shared with the cache layer; `None` keeps
    /// all counters process-local.
    pub fn new(redis: Option<ConnectionManager>, config: RateLimitConfig) -> Self {
        Self {
            redis,
            local: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn limit_for(&self, tier: Tier, class: EndpointClass) -> u64 {
        if class == EndpointClass::Ingest {
            return self.config.ingest_post;
        }
        match (tier, class) {
            (Tier::Unauthenticated, EndpointClass::Read) => self.config.unauthenticated_get,
            (Tier::Unauthenticated, _) => self.config.unauthenticated_post,
            (Tier::Authenticated, EndpointClass::Read) => self.config.authenticated_get,
            (Tier::Authenticated, _) => self.config.authenticated_post,
            (Tier::Operator, EndpointClass::Read) => self.config.operator_get,
            (Tier::Operator, _) => self.config.operator_post,
        }
    }

    pub async fn check(&self, identity: &str, tier: Tier, class: EndpointClass) -> Decision {
        self.check_at(identity, tier, class, Utc::now().timestamp())
            .await
    }

    /// Clock-explicit variant; `now_secs` is unix seconds.
    pub async fn check_at(
        &self,
        identity: &str,
        tier: Tier,
        class: EndpointClass,
        now_secs: i64,
    ) -> Decision {
        let limit = self.limit_for(tier, class);
        let window = self.config.window_secs as i64;
        let window_id = now_secs.div_euclid(window);
        let reset_at = (window_id + 1) * window;

        let count = match self.increment(identity, class, window_id).await {
            Some(count) => count,
            None => {
                // Store failure: fail open, assume this is the first hit.
                return Decision {
                    permitted: true,
                    limit,
                    remaining: limit.saturating_sub(1),
                    reset_at,
                };
            }
        };

        let permitted = count <= limit;
        if !permitted {
            debug!(identity, %class, count, limit, "rate limit exceeded");
        }
        Decision {
            permitted,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at,
        }
    }

    /// Post-increment counter value for this window, or None when the
    /// configured store failed.
    async fn increment(&self, identity: &str, class: EndpointClass, window_id: i64) -> Option<u64> {
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            let key = format!("rl:{identity}:{class}:{window_id}");
            let result: Result<(u64,), redis::RedisError> = redis::pipe()
                .atomic()
                .cmd("INCR")
                .arg(&key)
                .cmd("EXPIRE")
                .arg(&key)
                .arg(self.config.window_secs)
                .ignore()
                .query_async(&mut conn)
                .await;
            return match result {
                Ok((count,)) => Some(count),
                Err(e) => {
                    warn!("Rate limit store unavailable, failing open: {}", e);
                    None
                }
            };
        }

        let mut local = self.local.lock().ok()?;
        if local.len() > 10_000 {
            local.retain(|_, (_, w)| *w == window_id);
        }
        let entry = local.entry(format!("{identity}:{class}")).or_insert((0, window_id));
        if entry.1 != window_id {
            *entry = (0, window_id);
        }
        entry.0 += 1;
        Some(entry.0)
    }
}
