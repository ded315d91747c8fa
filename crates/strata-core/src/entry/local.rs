//! Per-worker view of a global entry with a private body handle.

use std::fmt;
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use http::header::{CACHE_CONTROL, ETAG};
use http::{HeaderValue, StatusCode};
use parking_lot::Mutex;

use super::global::{CachedRecord, GlobalCacheEntry, Registration};
use crate::error::{CacheError, Result};
use crate::sink::ResponseSink;

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

/// Default client-side freshness advertised on cached responses.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(86_400);

/// A worker's handle onto a loaded [`GlobalCacheEntry`].
///
/// Owned by one worker's local table. Other threads only ever flag it
/// (lazy eviction) or detach it (shutdown), both through atomics and the
/// handle mutex.
pub struct LocalCacheEntry {
    id: u64,
    global: Arc<GlobalCacheEntry>,
    record: Arc<CachedRecord>,
    body: Mutex<Option<File>>,
    evicted: AtomicBool,
    released: AtomicBool,
}

impl LocalCacheEntry {
    /// Register a new local entry with `global` and open its own read handle.
    ///
    /// Returns `Ok(None)` when the entry is not loaded or was evicted in the
    /// meantime; the caller retries its miss. Registration happens before the
    /// file is opened so the body cannot be deleted in between.
    pub fn open(global: &Arc<GlobalCacheEntry>) -> Result<Option<Arc<Self>>> {
        let Some(record) = global.record() else {
            return Ok(None);
        };

        let local = Arc::new(Self {
            id: NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed),
            global: Arc::clone(global),
            record,
            body: Mutex::new(None),
            evicted: AtomicBool::new(false),
            released: AtomicBool::new(false),
        });

        match global.register(Arc::clone(&local)) {
            Registration::Loaded => {}
            Registration::Loading => {
                local.evict();
                return Ok(None);
            }
            Registration::Rejected => return Ok(None),
        }

        if let Some(path) = &local.record.body_path {
            match File::open(path) {
                Ok(file) => *local.body.lock() = Some(file),
                Err(e) => {
                    local.evict();
                    return Err(e.into());
                }
            }
        }
        Ok(Some(local))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        self.global.path()
    }

    pub fn status(&self) -> StatusCode {
        self.record.status
    }

    pub fn etag(&self) -> &str {
        &self.record.etag
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Whether an `If-None-Match` value names this entry's etag.
    ///
    /// Accepts quoted, weak (`W/`) and comma-separated forms as well as `*`;
    /// comparison ignores ASCII case.
    pub fn etag_equals(&self, candidate: &str) -> bool {
        candidate.split(',').any(|tag| {
            let tag = tag.trim();
            let tag = tag.strip_prefix("W/").unwrap_or(tag);
            let tag = tag.trim_matches('"');
            tag == "*" || tag.eq_ignore_ascii_case(&self.record.etag)
        })
    }

    /// Replay the cached response into `sink`.
    ///
    /// The body is streamed from this entry's own handle, rewound first
    /// because the handle is reused for every response.
    pub fn respond_to(&self, sink: &mut dyn ResponseSink, max_age: Duration) -> Result<()> {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", self.record.etag)) {
            sink.add_header(ETAG, value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("public, max-age={}", max_age.as_secs()))
        {
            sink.add_header(CACHE_CONTROL, value);
        }
        for (name, value) in &self.record.headers {
            sink.add_header(name.clone(), value.clone());
        }

        if self.record.body_path.is_none() {
            return sink.respond(self.record.status, None);
        }

        let mut body = self.body.lock();
        let Some(file) = body.as_mut() else {
            return Err(CacheError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("body handle for {} already closed", self.path()),
            )));
        };
        file.seek(SeekFrom::Start(0))?;
        let len = file.metadata().ok().map(|m| m.len());
        sink.stream(self.record.status, file, len)
    }

    /// Release this entry: close the handle and unregister from the global
    /// entry. Idempotent.
    pub fn evict(&self) {
        self.evicted.store(true, Ordering::Release);
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.body.lock().take();
        self.global.unregister(self.id);
    }

    /// Flag only; the owning worker releases on its next lookup.
    pub(crate) fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
    }

    /// Close the handle without unregistering, for a global entry that has
    /// already dropped all of its back-references.
    pub(crate) fn detach(&self) {
        self.evicted.store(true, Ordering::Release);
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.body.lock().take();
    }
}

impl fmt::Debug for LocalCacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCacheEntry")
            .field("id", &self.id)
            .field("path", &self.global.path())
            .field("etag", &self.record.etag)
            .field("evicted", &self.is_evicted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{BufferedResponse, HeaderList};
    use bytes::Bytes;
    use http::header::CONTENT_TYPE;
    use std::io::Write;
    use std::path::Path;

    fn loaded(dir: &Path, body: Option<&[u8]>) -> Arc<GlobalCacheEntry> {
        let body_path = body.map(|bytes| {
            let path = dir.join(uuid::Uuid::new_v4().to_string());
            File::create(&path).unwrap().write_all(bytes).unwrap();
            path
        });
        let mut headers = HeaderList::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let entry = Arc::new(GlobalCacheEntry::new("/hello", "/hello"));
        entry.populate(StatusCode::OK, headers, body_path).unwrap();
        entry.mark_loaded();
        entry
    }

    #[test]
    fn test_respond_to_replays_headers_and_body_repeatedly() {
        let dir = tempfile::tempdir().unwrap();
        let global = loaded(dir.path(), Some(b"hello world"));
        let local = LocalCacheEntry::open(&global).unwrap().unwrap();

        for _ in 0..3 {
            let mut out = BufferedResponse::new();
            local.respond_to(&mut out, DEFAULT_MAX_AGE).unwrap();
            assert_eq!(out.status, Some(StatusCode::OK));
            assert_eq!(out.body, Bytes::from_static(b"hello world"));
            assert_eq!(
                out.header(&CACHE_CONTROL).unwrap(),
                "public, max-age=86400"
            );
            assert_eq!(
                out.header(&ETAG).unwrap().to_str().unwrap(),
                format!("\"{}\"", local.etag())
            );
            assert_eq!(out.header(&CONTENT_TYPE).unwrap(), "text/plain");
        }
    }

    #[test]
    fn test_bodyless_response() {
        let dir = tempfile::tempdir().unwrap();
        let global = loaded(dir.path(), None);
        let local = LocalCacheEntry::open(&global).unwrap().unwrap();

        let mut out = BufferedResponse::new();
        local.respond_to(&mut out, DEFAULT_MAX_AGE).unwrap();
        assert_eq!(out.status, Some(StatusCode::OK));
        assert!(out.body.is_empty());
    }

    #[test]
    fn test_etag_equals_variants() {
        let dir = tempfile::tempdir().unwrap();
        let global = loaded(dir.path(), Some(b"x"));
        let local = LocalCacheEntry::open(&global).unwrap().unwrap();
        let etag = local.etag().to_string();

        assert!(local.etag_equals(&etag));
        assert!(local.etag_equals(&etag.to_ascii_uppercase()));
        assert!(local.etag_equals(&format!("\"{etag}\"")));
        assert!(local.etag_equals(&format!("W/\"{etag}\"")));
        assert!(local.etag_equals(&format!("\"other\", \"{etag}\"")));
        assert!(local.etag_equals("*"));
        assert!(!local.etag_equals("\"other\""));
        assert!(!local.etag_equals(""));
    }

    #[test]
    fn test_evict_is_idempotent_and_closes_handle() {
        let dir = tempfile::tempdir().unwrap();
        let global = loaded(dir.path(), Some(b"x"));
        let local = LocalCacheEntry::open(&global).unwrap().unwrap();
        assert_eq!(global.holder_count(), 1);

        local.evict();
        local.evict();
        assert!(local.is_evicted());
        assert_eq!(global.holder_count(), 0);

        let mut out = BufferedResponse::new();
        assert!(local.respond_to(&mut out, DEFAULT_MAX_AGE).is_err());
    }

    #[test]
    fn test_open_fails_when_body_missing() {
        let dir = tempfile::tempdir().unwrap();
        let global = loaded(dir.path(), Some(b"x"));
        std::fs::remove_file(global.body_path().unwrap()).unwrap();

        assert!(LocalCacheEntry::open(&global).is_err());
        assert_eq!(global.holder_count(), 0);
    }

    #[test]
    fn test_open_on_loading_entry_returns_none() {
        let global = Arc::new(GlobalCacheEntry::new("/pending", "/pending"));
        assert!(LocalCacheEntry::open(&global).unwrap().is_none());
        assert_eq!(global.holder_count(), 0);
    }

    #[test]
    fn test_debug_does_not_recurse() {
        let dir = tempfile::tempdir().unwrap();
        let global = loaded(dir.path(), None);
        let local = LocalCacheEntry::open(&global).unwrap().unwrap();
        let rendered = format!("{local:?}");
        assert!(rendered.contains("/hello"));
    }
}
