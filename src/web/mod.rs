//! Web server module

mod middleware;
mod routes;
mod sse;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::aggregation::{AggregationEngine, DateTouchedSender};
use crate::cache::CacheLayer;
use crate::config::Config;
use crate::db::Database;
use crate::events::EventBus;
use crate::ratelimit::RateLimiter;
use crate::stats::StatsService;

pub struct AppState {
    pub db: Database,
    pub cache: Arc<CacheLayer>,
    pub stats: StatsService,
    pub engine: Arc<AggregationEngine>,
    pub limiter: Arc<RateLimiter>,
    pub event_bus: EventBus,
    pub date_tx: DateTouchedSender,
    pub config: Config,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/", get(routes::api_index))
        .route(
            "/api/detections",
            post(routes::ingest_detection).get(routes::list_detections),
        )
        .route("/api/stats/today", get(routes::stats_today))
        .route("/api/stats/range/:start/:end", get(routes::stats_range))
        .route("/api/daily", get(routes::list_daily))
        .route("/api/monthly", get(routes::list_monthly))
        .route(
            "/api/trigger-aggregation",
            post(routes::trigger_aggregation),
        )
        .route("/api/aggregation/status", get(routes::aggregation_status))
        .route("/api/settings", get(routes::detector_settings))
        .route("/api/health", get(routes::health))
        .route("/api/events", get(sse::events_handler))
        .layer(middleware::RateLimitLayer::new(state.clone()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(state: Arc<AppState>) -> Result<()> {
    let addr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    );
    let app = build_router(state);

    info!("API server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
