use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, to_bytes};
use axum::extract::{MatchedPath, Request, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, IF_NONE_MATCH, PRAGMA};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use strata_core::{
    BinaryContent, BufferedResponse, CacheError, CacheOutcome, CacheRequest, Downstream,
    ResponseSink,
};
use tokio::runtime::Handle;

use crate::error::AppError;
use crate::pool::WorkerPool;

/// Per-route cache settings.
#[derive(Debug, Clone, Default)]
pub struct CachePolicy {
    /// Invalidation group; the request path when unset.
    pub cache_key: Option<String>,
}

impl CachePolicy {
    pub fn keyed(cache_key: impl Into<String>) -> Self {
        Self {
            cache_key: Some(cache_key.into()),
        }
    }
}

/// State for [`cache_middleware`].
#[derive(Clone)]
pub struct CacheLayer {
    pub pool: Arc<WorkerPool>,
    pub policy: CachePolicy,
}

/// Serve GET requests through the response cache.
///
/// The rest of the stack only runs when this request wins the population
/// race for its path. Other methods pass straight through.
pub async fn cache_middleware(
    State(layer): State<CacheLayer>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() != Method::GET {
        return next.run(req).await;
    }

    let path = req.uri().path().to_string();
    let if_none_match = req
        .headers()
        .get(IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let bypass = wants_fresh_response(req.headers());
    let cache_key = layer.policy.cache_key.clone();
    let runtime = Handle::current();

    let served = layer
        .pool
        .run(move |worker| {
            let request = CacheRequest::new(&path)
                .with_cache_key(cache_key.as_deref())
                .with_if_none_match(if_none_match.as_deref())
                .bypass_cache(bypass);
            let mut downstream = NextDownstream::new(runtime, next, req);
            let mut out = BufferedResponse::new();
            match worker.respond(&request, &mut downstream, &mut out) {
                Ok(outcome) => Ok(Served::Cache(outcome, out)),
                Err(e) => match downstream.take_uncacheable() {
                    Some(response) => Ok(Served::Uncacheable(response)),
                    None => Err(e),
                },
            }
        })
        .await;

    match served {
        Ok(Ok(Served::Cache(outcome, out))) => {
            crate::metrics::record_cache_outcome(outcome);
            into_response(out)
        }
        Ok(Ok(Served::Uncacheable(out))) => into_response(out),
        Ok(Err(e)) => AppError::from(e).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Record method, matched route, status and latency for every request.
pub async fn track_metrics(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned());
    let started = Instant::now();
    let response = next.run(req).await;
    crate::metrics::record_http_request(
        &method,
        crate::metrics::route_label(route.as_deref()),
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

enum Served {
    Cache(CacheOutcome, BufferedResponse),
    /// Server errors are passed through to the client but never cached.
    Uncacheable(BufferedResponse),
}

/// `Cache-Control: no-cache` or `Pragma: no-cache` from the client.
fn wants_fresh_response(headers: &HeaderMap) -> bool {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .chain(headers.get_all(PRAGMA).iter())
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|directive| directive.trim().eq_ignore_ascii_case("no-cache"))
}

fn into_response(out: BufferedResponse) -> Response {
    let mut response = Response::new(Body::from(out.body));
    *response.status_mut() = out.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let headers = response.headers_mut();
    for (name, value) in out.headers {
        headers.append(name, value);
    }
    response
}

/// Drives the remaining axum stack from a cache worker thread.
///
/// The worker thread is outside the runtime, so the handler future and body
/// collection are driven with [`Handle::block_on`]. The stack runs at most
/// once; a repeated population attempt replays the first rendering.
pub struct NextDownstream {
    runtime: Handle,
    pending: Option<(Next, Request)>,
    rendered: Option<BufferedResponse>,
    uncacheable: Option<BufferedResponse>,
}

impl NextDownstream {
    pub fn new(runtime: Handle, next: Next, req: Request) -> Self {
        Self {
            runtime,
            pending: Some((next, req)),
            rendered: None,
            uncacheable: None,
        }
    }

    /// The downstream response when it was a server error.
    pub fn take_uncacheable(&mut self) -> Option<BufferedResponse> {
        self.uncacheable.take()
    }

    fn render(&mut self) -> strata_core::Result<BufferedResponse> {
        let (next, req) = self
            .pending
            .take()
            .ok_or_else(|| CacheError::downstream("downstream already invoked"))?;

        let response = self.runtime.block_on(next.run(req));
        let (parts, body) = response.into_parts();
        let bytes = self
            .runtime
            .block_on(to_bytes(body, usize::MAX))
            .map_err(|e| CacheError::downstream(format!("failed to read response body: {e}")))?;

        let rendered = BufferedResponse {
            status: Some(parts.status),
            headers: parts
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            body: bytes,
        };
        if parts.status.is_server_error() {
            self.uncacheable = Some(rendered);
            return Err(CacheError::downstream(format!(
                "downstream answered {}",
                parts.status
            )));
        }
        Ok(rendered)
    }
}

impl Downstream for NextDownstream {
    fn invoke(&mut self, sink: &mut dyn ResponseSink) -> strata_core::Result<()> {
        if self.rendered.is_none() {
            let rendered = self.render()?;
            self.rendered = Some(rendered);
        }
        let rendered = self
            .rendered
            .as_ref()
            .ok_or_else(|| CacheError::downstream("downstream produced no response"))?;
        let status = rendered.status.unwrap_or(StatusCode::OK);

        for (name, value) in &rendered.headers {
            sink.add_header(name.clone(), value.clone());
        }
        if rendered.body.is_empty() {
            return sink.respond(status, None);
        }
        let content_type = rendered
            .header(&CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream");
        sink.respond(
            status,
            Some(&BinaryContent::new(rendered.body.clone(), content_type)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_no_cache_detection() {
        let mut headers = HeaderMap::new();
        assert!(!wants_fresh_response(&headers));

        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0, No-Cache"));
        assert!(wants_fresh_response(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        assert!(wants_fresh_response(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        assert!(!wants_fresh_response(&headers));
    }

    #[test]
    fn test_buffered_response_conversion_keeps_repeated_headers() {
        let out = BufferedResponse {
            status: Some(StatusCode::CREATED),
            headers: vec![
                (
                    axum::http::header::SET_COOKIE,
                    HeaderValue::from_static("a=1"),
                ),
                (
                    axum::http::header::SET_COOKIE,
                    HeaderValue::from_static("b=2"),
                ),
            ],
            body: axum::body::Bytes::from_static(b"ok"),
        };
        let response = into_response(out);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response
                .headers()
                .get_all(axum::http::header::SET_COOKIE)
                .iter()
                .count(),
            2
        );
    }
}
