//! Boundary traits between the cache and the surrounding HTTP pipeline.
//!
//! The cache never talks to a transport directly. It consumes a
//! [`Downstream`] that writes into a [`ResponseSink`], and it answers clients
//! through another [`ResponseSink`]. [`RecordingSink`] captures a downstream
//! response for population; [`BufferedResponse`] collects a finished response
//! in memory for a transport to send.

use std::io::Read;

use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode, header::CONTENT_TYPE};
use indexmap::IndexMap;

use crate::error::{CacheError, Result};

/// Response headers in the order they were first added.
pub type HeaderList = IndexMap<HeaderName, HeaderValue>;

/// A renderable response body.
pub trait Content: Send {
    fn content_type(&self) -> String;

    fn render(&self) -> Result<Bytes>;
}

/// Where a response goes: the real client or a recorder.
pub trait ResponseSink {
    fn add_header(&mut self, name: HeaderName, value: HeaderValue);

    /// Finish the response with an optional rendered body.
    fn respond(&mut self, status: StatusCode, content: Option<&dyn Content>) -> Result<()>;

    /// Finish the response by copying `body` until EOF.
    fn stream(&mut self, status: StatusCode, body: &mut dyn Read, len: Option<u64>) -> Result<()>;
}

/// The rest of the request pipeline, invoked on a cache miss.
pub trait Downstream {
    fn invoke(&mut self, sink: &mut dyn ResponseSink) -> Result<()>;
}

impl<F> Downstream for F
where
    F: FnMut(&mut dyn ResponseSink) -> Result<()>,
{
    fn invoke(&mut self, sink: &mut dyn ResponseSink) -> Result<()> {
        self(sink)
    }
}

/// UTF-8 text content.
#[derive(Debug, Clone)]
pub struct TextContent {
    body: String,
    content_type: String,
}

impl TextContent {
    pub fn new(body: impl Into<String>) -> Self {
        Self::with_type(body, "text/plain; charset=utf-8")
    }

    pub fn html(body: impl Into<String>) -> Self {
        Self::with_type(body, "text/html; charset=utf-8")
    }

    pub fn with_type(body: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: content_type.into(),
        }
    }
}

impl Content for TextContent {
    fn content_type(&self) -> String {
        self.content_type.clone()
    }

    fn render(&self) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self.body.as_bytes()))
    }
}

/// JSON content rendered from a value.
#[derive(Debug, Clone)]
pub struct JsonContent(pub serde_json::Value);

impl Content for JsonContent {
    fn content_type(&self) -> String {
        "application/json".to_string()
    }

    fn render(&self) -> Result<Bytes> {
        serde_json::to_vec(&self.0)
            .map(Bytes::from)
            .map_err(|e| CacheError::downstream(format!("JSON rendering failed: {e}")))
    }
}

/// Already-rendered bytes, e.g. a body collected from another HTTP stack.
#[derive(Debug, Clone)]
pub struct BinaryContent {
    body: Bytes,
    content_type: String,
}

impl BinaryContent {
    pub fn new(body: Bytes, content_type: impl Into<String>) -> Self {
        Self {
            body,
            content_type: content_type.into(),
        }
    }
}

impl Content for BinaryContent {
    fn content_type(&self) -> String {
        self.content_type.clone()
    }

    fn render(&self) -> Result<Bytes> {
        Ok(self.body.clone())
    }
}

/// What a downstream produced, captured without reaching the client.
#[derive(Debug)]
pub struct Recording {
    pub status: StatusCode,
    pub headers: HeaderList,
    pub body: Option<Bytes>,
}

/// Sink that records status, headers and the rendered body.
#[derive(Debug, Default)]
pub struct RecordingSink {
    status: Option<StatusCode>,
    headers: HeaderList,
    body: Option<Bytes>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_content(&self) -> bool {
        self.body.as_ref().is_some_and(|b| !b.is_empty())
    }

    /// Consume the recorder; fails if the downstream never responded.
    pub fn finish(self) -> Result<Recording> {
        let status = self.status.ok_or(CacheError::IncompleteResponse)?;
        Ok(Recording {
            status,
            headers: self.headers,
            body: self.body,
        })
    }
}

impl ResponseSink for RecordingSink {
    fn add_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    fn respond(&mut self, status: StatusCode, content: Option<&dyn Content>) -> Result<()> {
        self.status = Some(status);
        self.body = None;
        if let Some(content) = content {
            self.body = Some(content.render()?);
            if !self.headers.contains_key(&CONTENT_TYPE)
                && let Ok(value) = HeaderValue::from_str(&content.content_type())
            {
                self.headers.insert(CONTENT_TYPE, value);
            }
        }
        Ok(())
    }

    fn stream(&mut self, status: StatusCode, body: &mut dyn Read, len: Option<u64>) -> Result<()> {
        let mut buf = Vec::with_capacity(len.unwrap_or(0) as usize);
        body.read_to_end(&mut buf)?;
        self.status = Some(status);
        self.body = Some(Bytes::from(buf));
        Ok(())
    }
}

/// In-memory response handed to a transport once complete.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    pub status: Option<StatusCode>,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Bytes,
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self, name: &HeaderName) -> Option<&HeaderValue> {
        self.headers.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

impl ResponseSink for BufferedResponse {
    fn add_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.push((name, value));
    }

    fn respond(&mut self, status: StatusCode, content: Option<&dyn Content>) -> Result<()> {
        self.status = Some(status);
        if let Some(content) = content {
            self.body = content.render()?;
            if self.header(&CONTENT_TYPE).is_none()
                && let Ok(value) = HeaderValue::from_str(&content.content_type())
            {
                self.headers.push((CONTENT_TYPE, value));
            }
        }
        Ok(())
    }

    fn stream(&mut self, status: StatusCode, body: &mut dyn Read, len: Option<u64>) -> Result<()> {
        let mut buf = Vec::with_capacity(len.unwrap_or(0) as usize);
        body.read_to_end(&mut buf)?;
        self.status = Some(status);
        self.body = Bytes::from(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONTENT_LENGTH, SERVER};

    #[test]
    fn test_recording_sets_content_type_from_content() {
        let mut sink = RecordingSink::new();
        sink.respond(StatusCode::OK, Some(&TextContent::html("<p>hi</p>")))
            .unwrap();

        assert!(sink.has_content());
        let recording = sink.finish().unwrap();
        assert_eq!(recording.status, StatusCode::OK);
        assert_eq!(
            recording.headers.get(&CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
        assert_eq!(recording.body.unwrap(), Bytes::from_static(b"<p>hi</p>"));
    }

    #[test]
    fn test_recording_keeps_explicit_content_type_and_order() {
        let mut sink = RecordingSink::new();
        sink.add_header(SERVER, HeaderValue::from_static("strata"));
        sink.add_header(CONTENT_TYPE, HeaderValue::from_static("text/csv"));
        sink.add_header(CONTENT_LENGTH, HeaderValue::from_static("3"));
        sink.respond(StatusCode::OK, Some(&TextContent::new("a,b")))
            .unwrap();

        let recording = sink.finish().unwrap();
        let names: Vec<_> = recording.headers.keys().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["server", "content-type", "content-length"]);
        assert_eq!(recording.headers.get(&CONTENT_TYPE).unwrap(), "text/csv");
    }

    #[test]
    fn test_recording_without_response_is_incomplete() {
        let sink = RecordingSink::new();
        assert!(matches!(sink.finish(), Err(CacheError::IncompleteResponse)));
    }

    #[test]
    fn test_status_only_response_has_no_content() {
        let mut sink = RecordingSink::new();
        sink.respond(StatusCode::NO_CONTENT, None).unwrap();
        assert!(!sink.has_content());
        assert!(sink.finish().unwrap().body.is_none());
    }

    #[test]
    fn test_buffered_response_streams_body() {
        let mut out = BufferedResponse::new();
        let mut body: &[u8] = b"streamed";
        out.stream(StatusCode::OK, &mut body, Some(8)).unwrap();
        assert_eq!(out.status, Some(StatusCode::OK));
        assert_eq!(out.body, Bytes::from_static(b"streamed"));
    }

    #[test]
    fn test_closure_downstream() {
        let mut calls = 0;
        let mut downstream = |sink: &mut dyn ResponseSink| {
            calls += 1;
            sink.respond(StatusCode::OK, Some(&JsonContent(serde_json::json!({"ok": true}))))
        };
        let mut sink = RecordingSink::new();
        downstream.invoke(&mut sink).unwrap();
        drop(downstream);
        assert_eq!(calls, 1);
        let recording = sink.finish().unwrap();
        assert_eq!(recording.headers.get(&CONTENT_TYPE).unwrap(), "application/json");
    }
}
