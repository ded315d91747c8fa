pub mod bounded_map;
pub mod digest;
pub mod entry;
pub mod error;
pub mod headers;
pub mod response_cache;
pub mod sink;

pub use bounded_map::{BoundedHandleMap, DEFAULT_LOAD_FACTOR};
pub use entry::{GlobalCacheEntry, Lifecycle, LocalCacheEntry};
pub use error::{CacheError, ErrorCategory, Result};
pub use response_cache::{
    CacheOutcome, CacheRequest, CacheSettings, CacheStatsSnapshot, CacheWorker, ResponseCache,
};
pub use sink::{
    BinaryContent, BufferedResponse, Content, Downstream, HeaderList, JsonContent, RecordingSink,
    ResponseSink, TextContent,
};
