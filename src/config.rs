//! Configuration management

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Redis URL. Empty means no distributed cache; the process-local
    /// fallback map serves alone.
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_today_ttl")]
    pub today_ttl_secs: u64,
    #[serde(default = "default_range_ttl")]
    pub range_ttl_secs: u64,
}

fn default_today_ttl() -> u64 {
    60
}

fn default_range_ttl() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            today_ttl_secs: default_today_ttl(),
            range_ttl_secs: default_range_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Scheduler period between rollup passes.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Max unaggregated records folded per pass.
    #[serde(default = "default_max_batch")]
    pub max_batch: u32,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

fn default_interval_secs() -> u64 {
    300
}

fn default_max_batch() -> u32 {
    5000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    100
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_batch: default_max_batch(),
            retry_attempts: default_retry_attempts(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Hard cap on [start, end] span to keep query work bounded.
    #[serde(default = "default_max_range_days")]
    pub max_range_days: u32,
    /// Ranges longer than this switch from daily to monthly buckets.
    #[serde(default = "default_daily_granularity_max_days")]
    pub daily_granularity_max_days: u32,
}

fn default_max_range_days() -> u32 {
    731
}

fn default_daily_granularity_max_days() -> u32 {
    31
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            max_range_days: default_max_range_days(),
            daily_granularity_max_days: default_daily_granularity_max_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_unauthenticated_get")]
    pub unauthenticated_get: u64,
    #[serde(default = "default_unauthenticated_post")]
    pub unauthenticated_post: u64,
    #[serde(default = "default_authenticated_get")]
    pub authenticated_get: u64,
    #[serde(default = "default_authenticated_post")]
    pub authenticated_post: u64,
    #[serde(default = "default_operator_get")]
    pub operator_get: u64,
    #[serde(default = "default_operator_post")]
    pub operator_post: u64,
    /// Detector scripts post once a minute per camera; this tier sits well
    /// above the general POST tiers.
    #[serde(default = "default_ingest_post")]
    pub ingest_post: u64,
}

fn default_true() -> bool {
    true
}

fn default_window_secs() -> u64 {
    60
}

fn default_unauthenticated_get() -> u64 {
    60
}

fn default_unauthenticated_post() -> u64 {
    10
}

fn default_authenticated_get() -> u64 {
    120
}

fn default_authenticated_post() -> u64 {
    30
}

fn default_operator_get() -> u64 {
    300
}

fn default_operator_post() -> u64 {
    60
}

fn default_ingest_post() -> u64 {
    600
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: default_window_secs(),
            unauthenticated_get: default_unauthenticated_get(),
            unauthenticated_post: default_unauthenticated_post(),
            authenticated_get: default_authenticated_get(),
            authenticated_post: default_authenticated_post(),
            operator_get: default_operator_get(),
            operator_post: default_operator_post(),
            ingest_post: default_ingest_post(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Static bearer token for operator endpoints.
    pub operator_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Pass-through settings served to detector scripts; not interpreted here.
    #[serde(default = "default_confidence")]
    pub confidence_threshold_person: f64,
    #[serde(default = "default_confidence")]
    pub confidence_threshold_face: f64,
    #[serde(default = "default_log_interval")]
    pub log_interval_secs: u64,
}

fn default_confidence() -> f64 {
    0.5
}

fn default_log_interval() -> u64 {
    60
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold_person: default_confidence(),
            confidence_threshold_face: default_confidence(),
            log_interval_secs: default_log_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";

        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .add_source(config::Environment::with_prefix("FOOTFALL"));

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be at least 1");
        }

        if self.auth.operator_token.is_empty() {
            anyhow::bail!("auth.operator_token cannot be empty");
        }

        if self.cache.today_ttl_secs == 0 || self.cache.range_ttl_secs == 0 {
            anyhow::bail!("Cache TTLs must be greater than zero");
        }

        if self.aggregation.max_batch == 0 {
            anyhow::bail!("aggregation.max_batch must be at least 1");
        }
        if self.aggregation.interval_secs == 0 {
            anyhow::bail!("aggregation.interval_secs must be greater than zero");
        }

        if self.stats.max_range_days == 0 {
            anyhow::bail!("stats.max_range_days must be at least 1");
        }
        if self.stats.daily_granularity_max_days == 0 {
            anyhow::bail!("stats.daily_granularity_max_days must be at least 1");
        }

        if self.rate_limit.window_secs == 0 {
            anyhow::bail!("rate_limit.window_secs must be greater than zero");
        }

        // Validate logging level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        Ok(())
    }
}
