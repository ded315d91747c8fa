//! Prometheus metrics for the Strata server.
//!
//! This module provides:
//! - HTTP request metrics (count, latency)
//! - Response cache metrics (hits, misses, 304s, evictions, entries)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;
use strata_core::CacheOutcome;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "strata_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "strata_http_request_duration_seconds";

    // Cache metrics
    pub const CACHE_HITS_TOTAL: &str = "strata_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "strata_cache_misses_total";
    pub const CACHE_NOT_MODIFIED_TOTAL: &str = "strata_cache_not_modified_total";
    pub const CACHE_BYPASSED_TOTAL: &str = "strata_cache_bypassed_total";
    pub const CACHE_EVICTIONS_TOTAL: &str = "strata_cache_evictions_total";
    pub const CACHE_ERRORS_TOTAL: &str = "strata_cache_errors_total";
    pub const CACHE_ENTRIES: &str = "strata_cache_entries";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics renders from the handle
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// =============================================================================
// HTTP Metrics
// =============================================================================

/// Record an HTTP request under its route template (e.g. `/greet/{name}`).
pub fn record_http_request(method: &str, route: &str, status: u16, duration: Duration) {
    let status_class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    };

    counter!(
        names::HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "path" => route.to_string(),
        "status_class" => status_class.to_string()
    )
    .increment(1);

    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "path" => route.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Cache Metrics
// =============================================================================

/// Count how the cache answered one request.
pub fn record_cache_outcome(outcome: CacheOutcome) {
    let name = match outcome {
        CacheOutcome::Hit => names::CACHE_HITS_TOTAL,
        CacheOutcome::Miss => names::CACHE_MISSES_TOTAL,
        CacheOutcome::NotModified => names::CACHE_NOT_MODIFIED_TOTAL,
        CacheOutcome::Bypassed => names::CACHE_BYPASSED_TOTAL,
    };
    counter!(name).increment(1);
}

/// Record entries evicted by an explicit invalidation.
pub fn record_cache_evictions(count: usize) {
    counter!(names::CACHE_EVICTIONS_TOTAL).increment(count as u64);
}

/// Record a request the cache could not answer.
pub fn record_cache_error(category: &str) {
    counter!(names::CACHE_ERRORS_TOTAL, "category" => category.to_string()).increment(1);
}

/// Set the number of global cache entries.
pub fn set_cache_entries(count: usize) {
    gauge!(names::CACHE_ENTRIES).set(count as f64);
}

// =============================================================================
// Helpers
// =============================================================================

/// Label for requests that matched no route; the raw path is unbounded.
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// The `path` label: the matched route template, never the concrete path.
pub fn route_label(matched: Option<&str>) -> &str {
    matched.unwrap_or(UNMATCHED_ROUTE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_label() {
        assert_eq!(route_label(Some("/greet/{name}")), "/greet/{name}");
        assert_eq!(route_label(None), "unmatched");
    }
}
