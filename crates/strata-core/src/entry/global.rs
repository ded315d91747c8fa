//! Process-wide cache entry shared by every worker.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::StatusCode;
use parking_lot::{Condvar, Mutex};

use super::local::LocalCacheEntry;
use crate::digest;
use crate::error::Result;
use crate::sink::HeaderList;

/// Default upper bound on waiting for another worker's population.
pub const DEFAULT_AWAIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Loading,
    Loaded,
    Evicted,
}

/// Outcome of [`GlobalCacheEntry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Registered; the record can be read now.
    Loaded,
    /// Registered; population has not finished.
    Loading,
    /// Not registered, the entry is evicted.
    Rejected,
}

/// Immutable response record, shared by reference with every local entry.
#[derive(Debug)]
pub struct CachedRecord {
    pub status: StatusCode,
    pub headers: HeaderList,
    pub body_path: Option<PathBuf>,
    pub etag: String,
}

#[derive(Debug)]
struct GlobalState {
    lifecycle: Lifecycle,
    record: Option<Arc<CachedRecord>>,
    holders: HashMap<u64, Arc<LocalCacheEntry>>,
    /// Holders flagged by a lazy eviction that have not released yet.
    draining: HashSet<u64>,
    body_removed: bool,
}

/// The single process-wide record for one cache path.
///
/// All transitions happen under one entry-scoped mutex; waiters for
/// population sleep on a condition variable notified on every transition out
/// of [`Lifecycle::Loading`].
#[derive(Debug)]
pub struct GlobalCacheEntry {
    path: String,
    cache_key: String,
    state: Mutex<GlobalState>,
    transition: Condvar,
}

impl GlobalCacheEntry {
    pub fn new(path: impl Into<String>, cache_key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cache_key: cache_key.into(),
            state: Mutex::new(GlobalState {
                lifecycle: Lifecycle::Loading,
                record: None,
                holders: HashMap::new(),
                draining: HashSet::new(),
                body_removed: false,
            }),
            transition: Condvar::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    /// The populated record, once available.
    pub fn record(&self) -> Option<Arc<CachedRecord>> {
        self.state.lock().record.clone()
    }

    /// Location of the body file, if the response had one.
    pub fn body_path(&self) -> Option<PathBuf> {
        self.record().and_then(|r| r.body_path.clone())
    }

    /// Number of local entries currently registered.
    pub fn holder_count(&self) -> usize {
        self.state.lock().holders.len()
    }

    /// Record the downstream response. Only the winning populator calls this,
    /// once, before [`mark_loaded`](Self::mark_loaded).
    ///
    /// The etag is the digest of the body file, or of the empty string when
    /// there is no body. If the entry was evicted while the populator was
    /// rendering, the fresh body file is removed and nothing is recorded.
    pub fn populate(
        &self,
        status: StatusCode,
        headers: HeaderList,
        body_path: Option<PathBuf>,
    ) -> Result<()> {
        let etag = match &body_path {
            Some(path) => match digest::digest_file(path) {
                Ok(etag) => etag,
                Err(e) => {
                    remove_body(path);
                    return Err(e.into());
                }
            },
            None => digest::empty_digest(),
        };

        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Loading || state.record.is_some() {
            drop(state);
            if let Some(path) = &body_path {
                remove_body(path);
            }
            tracing::debug!(path = %self.path, "population finished after eviction, discarding body");
            return Ok(());
        }
        state.record = Some(Arc::new(CachedRecord {
            status,
            headers,
            body_path,
            etag,
        }));
        Ok(())
    }

    /// Publish the record. No-op unless the entry is still loading.
    pub fn mark_loaded(&self) {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Loading && state.record.is_some() {
            state.lifecycle = Lifecycle::Loaded;
            self.transition.notify_all();
        }
    }

    /// Block until the entry leaves `Loading`. Returns `true` only if it is
    /// loaded; timeout and eviction both report `false`.
    pub fn await_loaded(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.lifecycle == Lifecycle::Loading {
            if self
                .transition
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        state.lifecycle == Lifecycle::Loaded
    }

    pub fn register(&self, local: Arc<LocalCacheEntry>) -> Registration {
        let mut state = self.state.lock();
        match state.lifecycle {
            Lifecycle::Evicted => Registration::Rejected,
            lifecycle => {
                state.holders.insert(local.id(), local);
                if lifecycle == Lifecycle::Loaded {
                    Registration::Loaded
                } else {
                    Registration::Loading
                }
            }
        }
    }

    /// Drop a back-reference. When the last holder of an evicted entry
    /// leaves, the body file is deleted. Unknown ids are ignored.
    pub fn unregister(&self, local_id: u64) {
        let mut state = self.state.lock();
        let before = state.holders.len() + state.draining.len();
        state.holders.remove(&local_id);
        state.draining.remove(&local_id);
        let after = state.holders.len() + state.draining.len();

        if before > 0 && after == 0 && state.lifecycle == Lifecycle::Evicted {
            let body = take_body(&mut state);
            drop(state);
            if let Some(path) = body {
                remove_body(&path);
            }
        }
    }

    /// Lazy invalidation: flag every holder as evicted and stop forwarding to
    /// them. Each holder deletes nothing itself; its eventual release drives
    /// the body cleanup.
    pub fn request_eviction(&self) {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Evicted {
            return;
        }
        state.lifecycle = Lifecycle::Evicted;
        self.transition.notify_all();

        let holders = std::mem::take(&mut state.holders);
        for (id, holder) in holders {
            holder.mark_evicted();
            state.draining.insert(id);
        }

        if state.draining.is_empty() {
            let body = take_body(&mut state);
            drop(state);
            if let Some(path) = body {
                remove_body(&path);
            }
        }
        tracing::debug!(path = %self.path, key = %self.cache_key, "global entry evicted");
    }

    /// Synchronous eviction used at shutdown: closes every holder's read
    /// handle and deletes the body file now.
    pub fn evict(&self) -> io::Result<()> {
        let (holders, body) = {
            let mut state = self.state.lock();
            state.lifecycle = Lifecycle::Evicted;
            self.transition.notify_all();
            state.draining.clear();
            let holders = std::mem::take(&mut state.holders);
            (holders, take_body(&mut state))
        };

        for holder in holders.into_values() {
            holder.detach();
        }

        match body {
            Some(path) => match fs::remove_file(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }
}

/// Claim the body path for deletion, at most once per entry.
fn take_body(state: &mut GlobalState) -> Option<PathBuf> {
    if state.body_removed {
        return None;
    }
    let path = state.record.as_ref().and_then(|r| r.body_path.clone());
    if path.is_some() {
        state.body_removed = true;
    }
    path
}

fn remove_body(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(file = %path.display(), "removed cached body"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(file = %path.display(), error = %e, "failed to remove cached body"),
    }
}
