use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use strata_core::CacheSettings;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Response cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        // Cache validations
        if !self.cache.local_capacity.is_power_of_two() {
            return Err("cache.local_capacity must be a power of two".into());
        }
        if !(self.cache.load_factor > 0.0 && self.cache.load_factor <= 1.0) {
            return Err("cache.load_factor must be in (0, 1]".into());
        }
        if self.cache.await_timeout_ms == 0 {
            return Err("cache.await_timeout_ms must be > 0".into());
        }
        if self.cache.max_miss_attempts == 0 {
            return Err("cache.max_miss_attempts must be > 0".into());
        }
        if self.cache.enabled && self.cache.directory.as_os_str().is_empty() {
            return Err("cache.directory must not be empty".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }

    /// Number of cache worker threads, resolving `0` to the CPU count.
    pub fn worker_count(&self) -> usize {
        match self.server.workers {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Cache worker threads; 0 means one per CPU
    #[serde(default)]
    pub workers: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// Where rendered bodies are stored
    #[serde(default = "default_cache_directory")]
    pub directory: PathBuf,
    /// Buckets in each worker's handle table (power of two)
    #[serde(default = "default_local_capacity")]
    pub local_capacity: usize,
    #[serde(default = "default_load_factor")]
    pub load_factor: f32,
    /// How long a request waits for another worker to populate an entry
    #[serde(default = "default_await_timeout_ms")]
    pub await_timeout_ms: u64,
    #[serde(default = "default_max_miss_attempts")]
    pub max_miss_attempts: u32,
    /// Advertised in Cache-Control on cached responses
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

fn default_cache_enabled() -> bool {
    true
}
fn default_cache_directory() -> PathBuf {
    std::env::temp_dir().join("strata-cache")
}
fn default_local_capacity() -> usize {
    strata_core::response_cache::DEFAULT_LOCAL_CAPACITY
}
fn default_load_factor() -> f32 {
    strata_core::DEFAULT_LOAD_FACTOR
}
fn default_await_timeout_ms() -> u64 {
    60_000
}
fn default_max_miss_attempts() -> u32 {
    strata_core::response_cache::DEFAULT_MAX_MISS_ATTEMPTS
}
fn default_max_age_secs() -> u64 {
    86_400
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            directory: default_cache_directory(),
            local_capacity: default_local_capacity(),
            load_factor: default_load_factor(),
            await_timeout_ms: default_await_timeout_ms(),
            max_miss_attempts: default_max_miss_attempts(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

impl CacheConfig {
    pub fn settings(&self) -> CacheSettings {
        CacheSettings {
            enabled: self.enabled,
            directory: self.directory.clone(),
            local_capacity: self.local_capacity,
            load_factor: self.load_factor,
            await_timeout: Duration::from_millis(self.await_timeout_ms),
            max_miss_attempts: self.max_miss_attempts,
            max_age: Duration::from_secs(self.max_age_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_FILE: &str = "strata.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., STRATA__CACHE__ENABLED=false
        builder = builder.add_source(
            Environment::with_prefix("STRATA")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
