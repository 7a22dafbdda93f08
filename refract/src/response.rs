//! Buffered response artifact exchanged between storage, the imaging engine
//! and the request processor.
//!
//! A [`Response`] always carries its body as an owned, fully buffered
//! [`Bytes`] value. That makes [`Response::copy`] a cheap, detached clone:
//! the derivative cache, the asynchronous write-back task and the client
//! reply can each consume their own view without coordinating reads.
//! Releasing a response is just dropping it.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};

pub use http::header::HeaderMap;

/// A produced artifact: status, headers and a fully buffered body.
#[derive(Debug)]
pub struct Response {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    error: Option<String>,
}

impl Response {
    /// Creates a response with the given status and body.
    pub fn new(status: u16, body: Bytes) -> Self {
        let mut res = Self {
            status,
            headers: HeaderMap::new(),
            body,
            error: None,
        };
        res.sync_content_length();
        res
    }

    /// Creates a response with no content.
    pub fn empty(status: u16) -> Self {
        Self::new(status, Bytes::new())
    }

    /// Creates a `text/plain` response from a string body.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status, Bytes::from(body.into())).with_content_type("text/plain; charset=utf-8")
    }

    /// Creates an error response. The message becomes the body and is also
    /// retained for logging.
    pub fn error(status: u16, err: impl std::fmt::Display) -> Self {
        let message = err.to_string();
        let mut res = Self::text(status, message.clone());
        res.error = Some(message);
        res
    }

    /// Sets the `Content-Type` header.
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.headers.insert(CONTENT_TYPE, value);
        }
        self
    }

    /// Replaces the header map wholesale, e.g. when relaying a backend reply.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self.sync_content_length();
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns a header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Sets a header, overwriting any previous value. Invalid names or
    /// values are ignored.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> u64 {
        self.body.len() as u64
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consumes the response, yielding its body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// The error message this response was built from, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Produces a detached, independent copy. Cheap: the body is a
    /// reference-counted buffer, headers are cloned.
    pub fn copy(&self) -> Response {
        Response {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            error: self.error.clone(),
        }
    }

    fn sync_content_length(&mut self) {
        if let Ok(value) = HeaderValue::from_str(&self.body.len().to_string()) {
            self.headers.insert(CONTENT_LENGTH, value);
        }
    }
}
