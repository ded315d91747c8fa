//! Which recorded response headers are safe to replay to other clients.

use crate::sink::HeaderList;

/// Header names kept in a cached record. Everything else (cookies, request
/// ids, tracing headers) is specific to the request that populated the entry.
pub const CACHEABLE_HEADERS: &[&str] = &[
    "content-base",
    "content-encoding",
    "content-language",
    "content-length",
    "content-location",
    "content-transfer-encoding",
    "content-md5",
    "content-range",
    "content-type",
    "location",
    "server",
    "transfer-encoding",
];

pub fn is_cacheable(name: &str) -> bool {
    CACHEABLE_HEADERS
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(name))
}

/// Drop every header outside [`CACHEABLE_HEADERS`], preserving order.
pub fn strip_private_headers(mut headers: HeaderList) -> HeaderList {
    headers.retain(|name, _| is_cacheable(name.as_str()));
    headers
}
