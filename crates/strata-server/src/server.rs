use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use axum::{
    Router, middleware,
    routing::{delete, get},
};
use strata_core::{CacheError, ResponseCache};
use tower_http::trace::TraceLayer;

use crate::{
    config::AppConfig,
    handlers,
    middleware::{self as app_middleware, CacheLayer, CachePolicy},
    pool::WorkerPool,
};

/// Shared state for handlers and the cache middleware.
#[derive(Clone)]
pub struct AppState {
    pub cache: ResponseCache,
    pub pool: Arc<WorkerPool>,
    /// Number of times a content handler actually rendered.
    pub renders: Arc<AtomicU64>,
}

impl AppState {
    /// Create the response cache and start its worker threads.
    pub fn new(cfg: &AppConfig) -> Result<Self, CacheError> {
        let cache = ResponseCache::new(cfg.cache.settings())?;
        let pool = WorkerPool::new(cache.clone(), cfg.worker_count())?;
        Ok(Self {
            cache,
            pool: Arc::new(pool),
            renders: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Stop the workers, then delete every cached body.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        self.cache.stop();
    }

    fn cache_layer(&self, policy: CachePolicy) -> CacheLayer {
        CacheLayer {
            pool: self.pool.clone(),
            policy,
        }
    }
}

pub struct StrataServer {
    addr: SocketAddr,
    app: Router,
    state: AppState,
}

pub fn build_app(state: AppState) -> Router {
    // Content routes sit behind the cache; `/reports` share one invalidation key.
    let pages = Router::new()
        .route("/", get(handlers::index))
        .route("/greet/{name}", get(handlers::greet))
        .route("/unstable", get(handlers::unstable))
        .route_layer(middleware::from_fn_with_state(
            state.cache_layer(CachePolicy::default()),
            app_middleware::cache_middleware,
        ));
    let reports = Router::new()
        .route("/reports/{id}", get(handlers::report))
        .route_layer(middleware::from_fn_with_state(
            state.cache_layer(CachePolicy::keyed("reports")),
            app_middleware::cache_middleware,
        ));

    Router::new()
        .merge(pages)
        .merge(reports)
        // Operational endpoints bypass the cache
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/admin/cache/stats", get(handlers::cache_stats))
        .route("/admin/cache/{key}", delete(handlers::evict_cache_key))
        .layer(middleware::from_fn(app_middleware::track_metrics))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = tracing::field::Empty,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .with_state(state)
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    pub fn build(self) -> Result<StrataServer, CacheError> {
        crate::metrics::init_metrics();
        let state = AppState::new(&self.config)?;
        let app = build_app(state.clone());

        Ok(StrataServer {
            addr: self.addr,
            app,
            state,
        })
    }
}

impl StrataServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        let served = axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        // Worker threads block on join; keep that off the async workers.
        let state = self.state;
        tokio::task::spawn_blocking(move || state.shutdown()).await?;
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
