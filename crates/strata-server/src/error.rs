use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use strata_core::CacheError;
use thiserror::Error;

/// Errors surfaced to HTTP clients by the cache layer.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Cache worker pool is shut down")]
    PoolClosed,

    #[error("Cache worker job panicked")]
    JobPanicked,
}

impl AppError {
    /// Downstream failures are 502; other errors a retry may clear are 503.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Cache(CacheError::Downstream(_) | CacheError::IncompleteResponse) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Cache(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            Self::PoolClosed => StatusCode::SERVICE_UNAVAILABLE,
            Self::Cache(_) | Self::JobPanicked => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::Cache(e) => match e.category() {
                strata_core::ErrorCategory::Storage => "storage",
                strata_core::ErrorCategory::Downstream => "downstream",
                strata_core::ErrorCategory::Contention => "contention",
                strata_core::ErrorCategory::Configuration => "configuration",
            },
            Self::PoolClosed => "shutdown",
            Self::JobPanicked => "worker",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::error!(error = %self, category = self.category(), "cache request failed");
        crate::metrics::record_cache_error(self.category());
        let body = json!({
            "error": self.to_string(),
            "category": self.category(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let contended = AppError::from(CacheError::Contended {
            path: "/a".into(),
            attempts: 8,
        });
        assert_eq!(contended.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(contended.category(), "contention");

        let downstream = AppError::from(CacheError::downstream("boom"));
        assert_eq!(downstream.status_code(), StatusCode::BAD_GATEWAY);

        let io = AppError::from(CacheError::Io(std::io::Error::other("disk full")));
        assert_eq!(io.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(io.category(), "storage");

        let misconfigured = AppError::from(CacheError::InvalidCapacity(1000));
        assert_eq!(misconfigured.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(misconfigured.category(), "configuration");

        assert_eq!(AppError::PoolClosed.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(AppError::JobPanicked.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(AppError::JobPanicked.category(), "worker");
    }
}
