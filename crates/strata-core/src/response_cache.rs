//! Two-tier response cache.
//!
//! ## Tiers
//!
//! - **Global**: one [`GlobalCacheEntry`] per cache path, shared by every
//!   worker through a `DashMap`. A secondary index groups entries by cache
//!   key for explicit invalidation.
//! - **Local**: each [`CacheWorker`] owns a [`BoundedHandleMap`] of
//!   [`LocalCacheEntry`] values with their own open body handles, so the hot
//!   path touches no shared lock.
//!
//! ## Population
//!
//! The first request for a path inserts a `Loading` global entry and renders
//! the downstream response into a [`RecordingSink`]. Concurrent requests for
//! the same path wait on that entry instead of rendering again.

use std::any::Any;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use http::header::ETAG;
use http::{HeaderValue, StatusCode};
use serde::Serialize;
use uuid::Uuid;

use crate::bounded_map::{BoundedHandleMap, DEFAULT_LOAD_FACTOR};
use crate::entry::{DEFAULT_AWAIT_TIMEOUT, DEFAULT_MAX_AGE, GlobalCacheEntry, LocalCacheEntry};
use crate::error::{CacheError, Result};
use crate::headers::strip_private_headers;
use crate::sink::{Downstream, RecordingSink, ResponseSink};

/// Default bucket count of a worker's local table.
pub const DEFAULT_LOCAL_CAPACITY: usize = 1024;

/// Default number of lookup rounds a miss may take before giving up.
pub const DEFAULT_MAX_MISS_ATTEMPTS: u32 = 8;

/// Runtime settings for a [`ResponseCache`].
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// When false every request goes straight downstream.
    pub enabled: bool,
    /// Directory holding body files. Created if absent.
    pub directory: PathBuf,
    /// Bucket count of each worker's local table (power of two).
    pub local_capacity: usize,
    pub load_factor: f32,
    /// How long a request waits for another worker's population.
    pub await_timeout: Duration,
    pub max_miss_attempts: u32,
    /// Advertised in `Cache-Control: public, max-age=N`.
    pub max_age: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: std::env::temp_dir().join("strata-cache"),
            local_capacity: DEFAULT_LOCAL_CAPACITY,
            load_factor: DEFAULT_LOAD_FACTOR,
            await_timeout: DEFAULT_AWAIT_TIMEOUT,
            max_miss_attempts: DEFAULT_MAX_MISS_ATTEMPTS,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

/// Counters shared by all workers.
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    populations: AtomicU64,
    not_modified: AtomicU64,
    population_failures: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub populations: u64,
    pub not_modified: u64,
    pub population_failures: u64,
    pub evictions: u64,
}

/// How a request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The cache is disabled; downstream answered directly.
    Bypassed,
    /// Served from the worker's local table.
    Hit,
    /// Served after populating or waiting for a global entry.
    Miss,
    /// The client's etag matched; 304 without a body.
    NotModified,
}

/// One request as seen by the cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheRequest<'a> {
    /// Logical cache path; one global entry per path.
    pub path: &'a str,
    /// Invalidation group. Defaults to the path.
    pub cache_key: Option<&'a str>,
    /// Raw `If-None-Match` value sent by the client.
    pub if_none_match: Option<&'a str>,
    /// Skip the conditional check and always send the full response.
    pub bypass: bool,
}

impl<'a> CacheRequest<'a> {
    pub fn new(path: &'a str) -> Self {
        Self {
            path,
            cache_key: None,
            if_none_match: None,
            bypass: false,
        }
    }

    pub fn with_cache_key(mut self, cache_key: Option<&'a str>) -> Self {
        self.cache_key = cache_key;
        self
    }

    pub fn with_if_none_match(mut self, etag: Option<&'a str>) -> Self {
        self.if_none_match = etag;
        self
    }

    pub fn bypass_cache(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn cache_key(&self) -> &'a str {
        self.cache_key.unwrap_or(self.path)
    }
}

struct Shared {
    settings: CacheSettings,
    by_path: DashMap<String, Arc<GlobalCacheEntry>>,
    by_key: DashMap<String, Vec<Arc<GlobalCacheEntry>>>,
    stats: CacheStats,
}

/// Process-wide cache state. Cheap to clone; every clone shares the maps.
#[derive(Clone)]
pub struct ResponseCache {
    shared: Arc<Shared>,
}

impl ResponseCache {
    /// Create the cache and its body directory.
    pub fn new(settings: CacheSettings) -> Result<Self> {
        if !settings.local_capacity.is_power_of_two() {
            return Err(CacheError::InvalidCapacity(settings.local_capacity));
        }
        if !(settings.load_factor > 0.0 && settings.load_factor <= 1.0) {
            return Err(CacheError::InvalidLoadFactor(settings.load_factor));
        }
        if settings.max_miss_attempts == 0 {
            return Err(CacheError::configuration("max_miss_attempts must be at least 1"));
        }
        if settings.await_timeout.is_zero() {
            return Err(CacheError::configuration("await_timeout must be greater than zero"));
        }
        if settings.enabled {
            fs::create_dir_all(&settings.directory)?;
        }
        tracing::info!(
            enabled = settings.enabled,
            directory = %settings.directory.display(),
            local_capacity = settings.local_capacity,
            "response cache initialized"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                settings,
                by_path: DashMap::new(),
                by_key: DashMap::new(),
                stats: CacheStats::default(),
            }),
        })
    }

    pub fn enabled(&self) -> bool {
        self.shared.settings.enabled
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.shared.settings
    }

    /// Mint a worker with its own local table.
    pub fn worker(&self) -> Result<CacheWorker> {
        let settings = &self.shared.settings;
        let local = BoundedHandleMap::with_eviction(
            settings.local_capacity,
            settings.load_factor,
            |_path: String, entry: Arc<LocalCacheEntry>| entry.evict(),
        )?;
        Ok(CacheWorker {
            cache: self.clone(),
            local,
        })
    }

    /// Number of global entries currently indexed by path.
    pub fn entry_count(&self) -> usize {
        self.shared.by_path.len()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.shared.by_path.contains_key(path)
    }

    /// Body file of the entry currently cached for `path`.
    pub fn body_path(&self, path: &str) -> Option<PathBuf> {
        self.shared.by_path.get(path).and_then(|e| e.body_path())
    }

    /// Invalidate every entry populated under `cache_key`.
    ///
    /// Entries are dropped from both maps at once; holders are only flagged
    /// and release their handles on their next lookup. Returns the number of
    /// entries evicted.
    pub fn evict(&self, cache_key: &str) -> usize {
        let Some((_, group)) = self.shared.by_key.remove(cache_key) else {
            tracing::debug!(key = %cache_key, "no cache entries to evict");
            return 0;
        };

        for entry in &group {
            self.shared
                .by_path
                .remove_if(entry.path(), |_, current| Arc::ptr_eq(current, entry));
            entry.request_eviction();
        }

        self.shared
            .stats
            .evictions
            .fetch_add(group.len() as u64, Ordering::Relaxed);
        tracing::info!(key = %cache_key, count = group.len(), "cache key evicted");
        group.len()
    }

    /// Evict every entry synchronously and delete all body files.
    ///
    /// Workers should be shut down first so their handles are already
    /// released; any handle still open is closed here.
    pub fn stop(&self) {
        let mut entries = Vec::new();
        self.shared.by_path.retain(|_, entry| {
            entries.push(Arc::clone(entry));
            false
        });
        self.shared.by_key.retain(|_, group| {
            entries.append(group);
            false
        });
        entries.sort_by_key(|e| Arc::as_ptr(e) as usize);
        entries.dedup_by(|a, b| Arc::ptr_eq(a, b));

        for entry in &entries {
            if let Err(e) = entry.evict() {
                tracing::warn!(path = %entry.path(), error = %e, "failed to remove cached body");
            }
        }
        tracing::info!(count = entries.len(), "response cache stopped");
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let stats = &self.shared.stats;
        CacheStatsSnapshot {
            entries: self.shared.by_path.len(),
            hits: stats.hits.load(Ordering::Relaxed),
            misses: stats.misses.load(Ordering::Relaxed),
            populations: stats.populations.load(Ordering::Relaxed),
            not_modified: stats.not_modified.load(Ordering::Relaxed),
            population_failures: stats.population_failures.load(Ordering::Relaxed),
            evictions: stats.evictions.load(Ordering::Relaxed),
        }
    }

    /// Fetch the global entry for `path`, creating it if absent. The flag is
    /// true for the caller that created it and must therefore populate it.
    fn global_entry(&self, path: &str, cache_key: &str) -> (Arc<GlobalCacheEntry>, bool) {
        let (entry, created) = match self.shared.by_path.entry(path.to_string()) {
            Entry::Occupied(occupied) => (Arc::clone(occupied.get()), false),
            Entry::Vacant(vacant) => {
                let entry = Arc::new(GlobalCacheEntry::new(path, cache_key));
                vacant.insert(Arc::clone(&entry));
                (entry, true)
            }
        };

        if created {
            self.shared
                .by_key
                .entry(cache_key.to_string())
                .or_default()
                .push(Arc::clone(&entry));
        }
        (entry, created)
    }

    /// Drop `entry` from both maps if they still point at it.
    fn forget(&self, entry: &Arc<GlobalCacheEntry>) {
        self.shared
            .by_path
            .remove_if(entry.path(), |_, current| Arc::ptr_eq(current, entry));
        if let Some(mut group) = self.shared.by_key.get_mut(entry.cache_key()) {
            group.retain(|e| !Arc::ptr_eq(e, entry));
        }
        self.shared
            .by_key
            .remove_if(entry.cache_key(), |_, group| group.is_empty());
    }

    /// Render the downstream response into `entry` and publish it. On
    /// failure, including a panicking downstream, the entry is forgotten and
    /// then evicted so woken waiters start over with a fresh entry.
    fn populate(&self, entry: &Arc<GlobalCacheEntry>, downstream: &mut dyn Downstream) -> Result<()> {
        let recorded = panic::catch_unwind(AssertUnwindSafe(|| {
            self.record_downstream(entry, downstream)
        }))
        .unwrap_or_else(|payload| Err(CacheError::downstream(panic_message(payload.as_ref()))));

        match recorded {
            Ok(()) => {
                entry.mark_loaded();
                self.shared.stats.populations.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(path = %entry.path(), key = %entry.cache_key(), "cache entry populated");
                Ok(())
            }
            Err(e) => {
                self.shared
                    .stats
                    .population_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    path = %entry.path(),
                    error = %e,
                    category = %e.category(),
                    "cache population failed"
                );
                self.forget(entry);
                entry.request_eviction();
                Err(e)
            }
        }
    }

    fn record_downstream(
        &self,
        entry: &GlobalCacheEntry,
        downstream: &mut dyn Downstream,
    ) -> Result<()> {
        let mut recorder = RecordingSink::new();
        downstream.invoke(&mut recorder)?;
        let recording = recorder.finish()?;

        let body_path = match recording.body.filter(|body| !body.is_empty()) {
            Some(body) => Some(self.write_body(&body)?),
            None => None,
        };
        entry.populate(
            recording.status,
            strip_private_headers(recording.headers),
            body_path,
        )
    }

    /// Write a body to a fresh file and flush it to disk.
    fn write_body(&self, body: &[u8]) -> Result<PathBuf> {
        let path = self
            .shared
            .settings
            .directory
            .join(Uuid::new_v4().simple().to_string());

        let written = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .and_then(|mut file| {
                file.write_all(body)?;
                file.sync_all()
            });

        match written {
            Ok(()) => Ok(path),
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&path)
                    && cleanup.kind() != io::ErrorKind::NotFound
                {
                    tracing::warn!(file = %path.display(), error = %cleanup, "failed to remove partial body");
                }
                Err(e.into())
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    format!("downstream panicked: {detail}")
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("settings", &self.shared.settings)
            .field("entries", &self.shared.by_path.len())
            .finish()
    }
}

/// A worker's view of the cache. Not shared between threads.
#[derive(Debug)]
pub struct CacheWorker {
    cache: ResponseCache,
    local: BoundedHandleMap<String, Arc<LocalCacheEntry>>,
}

impl CacheWorker {
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Number of entries in this worker's local table.
    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    /// Answer `request`, from the cache if possible.
    ///
    /// `downstream` is invoked at most once, and only when this worker wins
    /// the population race for the path (or the cache is disabled).
    pub fn respond(
        &mut self,
        request: &CacheRequest<'_>,
        downstream: &mut dyn Downstream,
        sink: &mut dyn ResponseSink,
    ) -> Result<CacheOutcome> {
        if !self.cache.enabled() {
            downstream.invoke(sink)?;
            return Ok(CacheOutcome::Bypassed);
        }

        let (local, outcome) = match self.local_hit(request.path) {
            Some(local) => {
                self.cache.shared.stats.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(path = %request.path, "local cache hit");
                (local, CacheOutcome::Hit)
            }
            None => {
                self.cache.shared.stats.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(path = %request.path, "local cache miss");
                (self.cache_miss(request, downstream)?, CacheOutcome::Miss)
            }
        };

        if !request.bypass
            && request
                .if_none_match
                .is_some_and(|candidate| local.etag_equals(candidate))
        {
            if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", local.etag())) {
                sink.add_header(ETAG, value);
            }
            sink.respond(StatusCode::NOT_MODIFIED, None)?;
            self.cache
                .shared
                .stats
                .not_modified
                .fetch_add(1, Ordering::Relaxed);
            return Ok(CacheOutcome::NotModified);
        }

        local.respond_to(sink, self.cache.settings().max_age)?;
        Ok(outcome)
    }

    /// Release every local entry. Call before the worker goes away.
    pub fn shutdown(&mut self) {
        let released = self.local.len();
        self.local.clear();
        tracing::debug!(released, "cache worker shut down");
    }

    /// A live local entry for `path`; evicted entries are released here.
    fn local_hit(&mut self, path: &str) -> Option<Arc<LocalCacheEntry>> {
        let cached = self.local.get(path).cloned()?;
        if !cached.is_evicted() {
            return Some(cached);
        }
        if let Some(stale) = self.local.remove(path) {
            stale.evict();
        }
        None
    }

    fn cache_miss(
        &mut self,
        request: &CacheRequest<'_>,
        downstream: &mut dyn Downstream,
    ) -> Result<Arc<LocalCacheEntry>> {
        let settings = self.cache.settings();
        let attempts = settings.max_miss_attempts;
        let await_timeout = settings.await_timeout;

        for attempt in 1..=attempts {
            let (global, created) = self.cache.global_entry(request.path, request.cache_key());
            if created {
                self.cache.populate(&global, downstream)?;
            } else if !global.await_loaded(await_timeout) {
                tracing::debug!(path = %request.path, attempt, "cache entry not loaded, retrying");
                continue;
            }

            match LocalCacheEntry::open(&global)? {
                Some(local) => {
                    if let Some(previous) = self
                        .local
                        .put(request.path.to_string(), Arc::clone(&local))
                    {
                        previous.evict();
                    }
                    return Ok(local);
                }
                None => {
                    tracing::debug!(path = %request.path, attempt, "cache entry evicted before registration, retrying");
                }
            }
        }

        Err(CacheError::Contended {
            path: request.path.to_string(),
            attempts,
        })
    }
}
