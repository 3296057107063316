//! Footfall analytics backend
//!
//! Ingests per-minute demographic detection records, folds them into
//! daily and monthly rollups in the background, and serves consolidated
//! stats through a cached HTTP API.

mod aggregation;
mod cache;
mod config;
mod counts;
mod db;
mod error;
mod events;
mod ratelimit;
mod stats;
mod web;

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    // Initialize logging based on LOG_FORMAT env var
    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(tracing_subscriber::filter::LevelFilter::INFO)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .init();
    }

    info!("Starting footfall analytics backend...");

    // Load configuration
    let config = config::Config::load()?;
    info!("Configuration loaded");

    // Initialize database
    let db = db::Database::new(&config.database).await?;
    db.run_migrations().await?;
    info!("Database initialized");

    // One Redis connection manager shared by the cache and the limiter
    let cache = Arc::new(cache::CacheLayer::connect(&config.cache).await);
    let limiter = Arc::new(ratelimit::RateLimiter::new(
        cache.redis_handle(),
        config.rate_limit.clone(),
    ));
    match cache.status().await {
        cache::CacheStatus::Redis => info!("Redis cache connected"),
        status => warn!(?status, "running without a distributed cache"),
    }

    // Create event bus for broadcasting accepted detections
    let (event_tx, _) = tokio::sync::broadcast::channel(1000);
    let event_bus = events::EventBus::new(event_tx);

    // Aggregation engine plus its background scheduler
    let engine = Arc::new(aggregation::AggregationEngine::new(
        db.clone(),
        cache.clone(),
        config.aggregation.clone(),
    ));
    let (date_tx, date_rx) = tokio::sync::mpsc::unbounded_channel();
    aggregation::start_scheduler(engine.clone(), date_rx);
    info!(
        interval_secs = config.aggregation.interval_secs,
        "Aggregation scheduler running"
    );

    let stats = stats::StatsService::new(db.clone(), cache.clone(), config.stats.clone());

    let state = Arc::new(web::AppState {
        db,
        cache,
        stats,
        engine,
        limiter,
        event_bus,
        date_tx,
        config,
    });

    // Start web server (blocking)
    web::start_server(state).await?;

    Ok(())
}
