pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod pool;
pub mod server;

pub use config::{AppConfig, CacheConfig, LoggingConfig, ServerConfig};
pub use error::AppError;
pub use middleware::{CacheLayer, CachePolicy, cache_middleware};
pub use observability::init_tracing;
pub use pool::WorkerPool;
pub use server::{AppState, ServerBuilder, StrataServer, build_app};
