use std::sync::atomic::Ordering;

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse},
};
use serde::Serialize;
use serde_json::json;

use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

// =============================================================================
// Content (served through the response cache)
// =============================================================================

pub async fn index(State(state): State<AppState>) -> impl IntoResponse {
    let render = state.renders.fetch_add(1, Ordering::Relaxed) + 1;
    Html(format!(
        "<!doctype html><html><body><h1>Strata</h1><p>render #{render}</p></body></html>"
    ))
}

pub async fn greet(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
    let render = state.renders.fetch_add(1, Ordering::Relaxed) + 1;
    let mut headers = HeaderMap::new();
    headers.insert(header::SERVER, HeaderValue::from_static("strata"));
    // Request specific; must not be replayed from the cache.
    headers.insert(
        header::SET_COOKIE,
        HeaderValue::from_static("visited=1; Path=/"),
    );
    (
        StatusCode::OK,
        headers,
        Json(json!({
            "greeting": format!("Hello, {name}!"),
            "render": render,
        })),
    )
}

pub async fn report(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let render = state.renders.fetch_add(1, Ordering::Relaxed) + 1;
    format!("report {id}, render #{render}\n")
}

pub async fn unstable(State(state): State<AppState>) -> impl IntoResponse {
    let render = state.renders.fetch_add(1, Ordering::Relaxed) + 1;
    (
        StatusCode::SERVICE_UNAVAILABLE,
        format!("upstream unavailable, render #{render}"),
    )
}

// =============================================================================
// Operations
// =============================================================================

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

pub async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.cache.stats();
    crate::metrics::set_cache_entries(stats.entries);
    Json(json!({
        "enabled": state.cache.enabled(),
        "workers": state.pool.size(),
        "stats": stats,
    }))
}

pub async fn evict_cache_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    let evicted = state.cache.evict(&key);
    crate::metrics::record_cache_evictions(evicted);
    crate::metrics::set_cache_entries(state.cache.entry_count());
    tracing::info!(key = %key, evicted, "cache key invalidated via admin API");
    Json(json!({ "key": key, "evicted": evicted }))
}

pub async fn metrics() -> impl IntoResponse {
    match crate::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}
