use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

use crate::app::EngineContext;
use crate::metrics::EngineMetrics;

#[derive(Clone)]
struct HttpState {
    ctx: EngineContext,
    metrics: Arc<EngineMetrics>,
}

/// Read-only surface over the repository: `/health`, `/ready` and
/// `/metrics`. The listener is bound by the caller so a bad address is
/// a startup error, not a background failure.
pub fn router(ctx: EngineContext, metrics: Arc<EngineMetrics>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics_endpoint))
        .with_state(HttpState { ctx, metrics })
}

pub async fn serve(listener: TcpListener, ctx: EngineContext, metrics: Arc<EngineMetrics>) {
    let cancel = ctx.cancel.clone();
    let app = router(ctx, metrics);
    info!(addr = ?listener.local_addr().ok(), "metrics/health surface listening");
    let _ = axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await;
}

/// Live iff the engine recorded at least one sample within 2×INTERVAL.
async fn health(State(state): State<HttpState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(denied) = authorize(&state.ctx, &headers) {
        return denied;
    }
    let snap = state.ctx.repo.snapshot();
    let window = chrono::Duration::from_std(state.ctx.config.interval * 2)
        .unwrap_or_else(|_| chrono::Duration::seconds(2));
    let live = snap.is_live(Utc::now(), window);
    let status = if live { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let body = json!({
        "status": if live { "ok" } else { "stale" },
        "target": snap.target,
        "last_sample_at": snap.last_sample_at,
        "connection_lost": snap.connection_lost,
    });
    (status, Json(body)).into_response()
}

/// Ready iff live and the ping worker finished its first tick.
async fn ready(State(state): State<HttpState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(denied) = authorize(&state.ctx, &headers) {
        return denied;
    }
    let snap = state.ctx.repo.snapshot();
    let window = chrono::Duration::from_std(state.ctx.config.interval * 2)
        .unwrap_or_else(|_| chrono::Duration::seconds(2));
    let ready = snap.first_tick_done && snap.is_live(Utc::now(), window);
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({ "ready": ready }))).into_response()
}

async fn metrics_endpoint(State(state): State<HttpState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(denied) = authorize(&state.ctx, &headers) {
        return denied;
    }
    let snap = state.ctx.repo.snapshot();
    state.metrics.update_from(&snap);
    (StatusCode::OK, state.metrics.render()).into_response()
}

/// Loopback binds are open; non-loopback binds require the configured
/// token or basic credentials on every request (startup already
/// refused insecure non-loopback binds without credentials).
fn authorize(ctx: &EngineContext, headers: &HeaderMap) -> Result<(), axum::response::Response> {
    let config = &ctx.config;
    if config.metrics_addr.ip().is_loopback() {
        return Ok(());
    }
    if config.allow_unauthenticated_bind && config.health_token.is_none() && config.health_auth.is_none()
    {
        return Ok(());
    }

    if let Some(expected) = &config.health_token {
        let token_header = headers.get("x-health-token").and_then(|v| v.to_str().ok());
        let bearer = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if token_header == Some(expected.as_str()) || bearer == Some(expected.as_str()) {
            return Ok(());
        }
    }
    if let Some((user, pass)) = &config.health_auth {
        let expected = format!("Basic {}", BASE64.encode(format!("{user}:{pass}")));
        if headers.get("authorization").and_then(|v| v.to_str().ok()) == Some(expected.as_str()) {
            return Ok(());
        }
    }
    Err((StatusCode::UNAUTHORIZED, "unauthorized").into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::Sample;

    #[test]
    fn test_authorize_loopback_is_open() {
        let ctx = EngineContext::new(Config::default());
        assert!(authorize(&ctx, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn test_authorize_token_on_public_bind() {
        let mut config = Config::default();
        config.metrics_addr = "0.0.0.0:8000".parse().unwrap();
        config.health_token = Some("secret".into());
        let ctx = EngineContext::new(config);

        assert!(authorize(&ctx, &HeaderMap::new()).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("x-health-token", "secret".parse().unwrap());
        assert!(authorize(&ctx, &headers).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer secret".parse().unwrap());
        assert!(authorize(&ctx, &headers).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("x-health-token", "wrong".parse().unwrap());
        assert!(authorize(&ctx, &headers).is_err());
    }

    #[test]
    fn test_authorize_basic_on_public_bind() {
        let mut config = Config::default();
        config.metrics_addr = "0.0.0.0:8000".parse().unwrap();
        config.health_auth = Some(("user".into(), "pass".into()));
        let ctx = EngineContext::new(config);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic dXNlcjpwYXNz".parse().unwrap());
        assert!(authorize(&ctx, &headers).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic d3Jvbmc=".parse().unwrap());
        assert!(authorize(&ctx, &headers).is_err());
    }

    #[tokio::test]
    async fn test_health_reflects_liveness() {
        let ctx = EngineContext::new(Config::default());
        let metrics = Arc::new(EngineMetrics::new("1.1.1.1").unwrap());

        // no samples yet: stale
        let response = health(
            State(HttpState { ctx: ctx.clone(), metrics: metrics.clone() }),
            HeaderMap::new(),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        // a fresh sample makes it live
        ctx.repo.record_ping_result(Sample::ok(Utc::now(), 20.0));
        let response = health(State(HttpState { ctx, metrics }), HeaderMap::new())
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
