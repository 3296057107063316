//! Rate limiting middleware
//!
//! Resolves the caller's identity and tier, classifies the endpoint, and
//! asks the limiter for a decision before the request reaches a handler.
//! Every limited response carries the X-RateLimit-* headers; rejections
//! are 429 with a machine-readable code and Retry-After.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::json;
use std::{
    net::SocketAddr,
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::warn;

use crate::ratelimit::{Decision, EndpointClass, Tier};

use super::AppState;

/// Paths exempt from rate limiting (probes must never be throttled).
const BYPASS_PATHS: &[&str] = &["/api/health"];

/// Get the real client IP address, checking proxy headers first.
/// Priority: X-Real-IP > X-Forwarded-For (first IP) > ConnectInfo
fn get_real_ip(headers: &HeaderMap, fallback_ip: &str) -> String {
    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(ip) = real_ip.to_str() {
            let ip = ip.trim();
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }

    // X-Forwarded-For may carry a chain; the first entry is the client.
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(ips) = forwarded.to_str() {
            if let Some(first_ip) = ips.split(',').next() {
                let ip = first_ip.trim();
                if !ip.is_empty() {
                    return ip.to_string();
                }
            }
        }
    }

    fallback_ip.to_string()
}

/// Identity and tier for limiter bookkeeping. The operator token wins,
/// then an X-User-Id header, then the client IP.
fn resolve_identity(headers: &HeaderMap, fallback_ip: &str, operator_token: &str) -> (String, Tier) {
    if !operator_token.is_empty() {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented == Some(operator_token) {
            return ("operator".to_string(), Tier::Operator);
        }
    }

    if let Some(user) = headers.get("x-user-id").and_then(|v| v.to_str().ok()) {
        let user = user.trim();
        if !user.is_empty() {
            return (format!("user:{user}"), Tier::Authenticated);
        }
    }

    (
        format!("ip:{}", get_real_ip(headers, fallback_ip)),
        Tier::Unauthenticated,
    )
}

fn classify(method: &Method, path: &str) -> EndpointClass {
    if method == Method::POST && path == "/api/detections" {
        EndpointClass::Ingest
    } else if method == Method::GET {
        EndpointClass::Read
    } else {
        EndpointClass::Write
    }
}

fn apply_rate_headers(response: &mut Response, decision: &Decision) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.reset_at.to_string()) {
        headers.insert("x-ratelimit-reset", v);
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    state: Arc<AppState>,
}

impl RateLimitLayer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            state: self.state.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    state: Arc<AppState>,
}

impl<S> Service<Request<Body>> for RateLimitMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let state = self.state.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let path = request.uri().path().to_string();
            if !state.limiter.enabled() || BYPASS_PATHS.contains(&path.as_str()) {
                return inner.call(request).await;
            }

            let fallback_ip = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let (identity, tier) = resolve_identity(
                request.headers(),
                &fallback_ip,
                &state.config.auth.operator_token,
            );
            let class = classify(request.method(), &path);

            let decision = state.limiter.check(&identity, tier, class).await;
            if !decision.permitted {
                warn!(%identity, %class, %path, "rate limit exceeded");
                let retry_after = (decision.reset_at - Utc::now().timestamp()).max(0);
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "status": "error",
                        "code": "RATE_LIMIT_EXCEEDED",
                        "message": format!("rate limit exceeded for {class} requests"),
                        "retry_after": retry_after,
                    })),
                )
                    .into_response();
                apply_rate_headers(&mut response, &decision);
                if let Ok(v) = HeaderValue::from_str(&retry_after.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, v);
                }
                return Ok(response);
            }

            let mut response = inner.call(request).await?;
            apply_rate_headers(&mut response, &decision);
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn real_ip_prefers_proxy_headers_in_order() {
        let both = headers(&[
            ("x-real-ip", "203.0.113.9"),
            ("x-forwarded-for", "198.51.100.1, 10.0.0.1"),
        ]);
        assert_eq!(get_real_ip(&both, "127.0.0.1"), "203.0.113.9");

        let forwarded = headers(&[("x-forwarded-for", "198.51.100.1, 10.0.0.1")]);
        assert_eq!(get_real_ip(&forwarded, "127.0.0.1"), "198.51.100.1");

        assert_eq!(get_real_ip(&HeaderMap::new(), "127.0.0.1"), "127.0.0.1");
    }

    #[test]
    fn identity_prefers_operator_then_user_then_ip() {
        let operator = headers(&[("authorization", "Bearer s3cr3t")]);
        assert_eq!(
            resolve_identity(&operator, "127.0.0.1", "s3cr3t"),
            ("operator".to_string(), Tier::Operator)
        );

        // Wrong token falls through to the anonymous path.
        let wrong = resolve_identity(&operator, "127.0.0.1", "other");
        assert_eq!(wrong.1, Tier::Unauthenticated);

        let user = headers(&[("x-user-id", "42")]);
        assert_eq!(
            resolve_identity(&user, "127.0.0.1", "s3cr3t"),
            ("user:42".to_string(), Tier::Authenticated)
        );

        let anonymous = resolve_identity(&HeaderMap::new(), "198.51.100.7", "s3cr3t");
        assert_eq!(
            anonymous,
            ("ip:198.51.100.7".to_string(), Tier::Unauthenticated)
        );
    }

    #[test]
    fn ingestion_post_gets_its_own_class() {
        assert_eq!(
            classify(&Method::POST, "/api/detections"),
            EndpointClass::Ingest
        );
        assert_eq!(
            classify(&Method::GET, "/api/detections"),
            EndpointClass::Read
        );
        assert_eq!(
            classify(&Method::POST, "/api/trigger-aggregation"),
            EndpointClass::Write
        );
    }
}
