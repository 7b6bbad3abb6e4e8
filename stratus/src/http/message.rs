//! Request and response values.

use super::headers::{names, Headers};
use crate::errors::{ConfigError, StratusError};
use crate::stream::ByteStream;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Transport scheme of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Plain text.
    Http,
    /// TLS.
    Https,
}

impl Scheme {
    /// Default port for the scheme.
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

/// Network destination; connections are pooled per endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Scheme.
    pub scheme: Scheme,
    /// Host name or address.
    pub host: String,
    /// Port.
    pub port: u16,
}

impl Endpoint {
    /// Creates a new endpoint.
    #[must_use]
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Value of the `Host` header for this endpoint.
    #[must_use]
    pub fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Http => "http",
            Scheme::Https => "https",
        };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// GET
    Get,
    /// HEAD
    Head,
    /// PUT
    Put,
    /// POST
    Post,
    /// DELETE
    Delete,
    /// PATCH
    Patch,
}

impl Method {
    /// Wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of a streaming request body.
///
/// `open` is called once per attempt, so a provider that can produce the body
/// again makes the request retryable.
pub trait BodyProvider: Send + Sync {
    /// Opens a fresh stream over the body.
    fn open(&self) -> ByteStream;

    /// Declared length, if known.
    fn content_length(&self) -> Option<u64>;

    /// Returns true if `open` can produce the body again.
    fn is_replayable(&self) -> bool {
        true
    }
}

/// A provider that hands out one pre-built stream.
///
/// Later attempts receive a failing stream.
pub struct OneShotBody {
    stream: Mutex<Option<ByteStream>>,
    content_length: Option<u64>,
}

impl OneShotBody {
    /// Wraps a stream.
    #[must_use]
    pub fn new(stream: ByteStream) -> Self {
        let content_length = stream.content_length();
        Self {
            stream: Mutex::new(Some(stream)),
            content_length,
        }
    }
}

impl BodyProvider for OneShotBody {
    fn open(&self) -> ByteStream {
        self.stream.lock().take().unwrap_or_else(|| {
            ByteStream::failed(StratusError::transmission("request body cannot be replayed"))
        })
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn is_replayable(&self) -> bool {
        self.stream.lock().is_some()
    }
}

/// Request body.
#[derive(Clone, Default)]
pub enum RequestBody {
    /// No body.
    #[default]
    Empty,
    /// In-memory body; re-readable from the start.
    Buffered(Bytes),
    /// Lazily produced body.
    Streaming(Arc<dyn BodyProvider>),
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
            Self::Streaming(provider) => {
                write!(f, "Streaming(content_length={:?})", provider.content_length())
            }
        }
    }
}

impl RequestBody {
    /// Opens a stream over the body, `None` when there is no body.
    #[must_use]
    pub fn open(&self) -> Option<ByteStream> {
        match self {
            Self::Empty => None,
            Self::Buffered(bytes) => Some(ByteStream::from_bytes(bytes.clone())),
            Self::Streaming(provider) => Some(provider.open()),
        }
    }

    /// Returns true if another attempt can send the body again.
    #[must_use]
    pub fn is_replayable(&self) -> bool {
        match self {
            Self::Empty | Self::Buffered(_) => true,
            Self::Streaming(provider) => provider.is_replayable(),
        }
    }

    /// Declared length, if known.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Buffered(bytes) => Some(bytes.len() as u64),
            Self::Streaming(provider) => provider.content_length(),
        }
    }

    /// Returns true if the body is present.
    #[must_use]
    pub fn is_present(&self) -> bool {
        !matches!(self, Self::Empty)
    }

    /// Returns the in-memory bytes of a buffered body.
    #[must_use]
    pub fn as_buffered(&self) -> Option<&Bytes> {
        match self {
            Self::Buffered(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::Buffered(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Buffered(Bytes::from(bytes))
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        Self::Buffered(Bytes::from_static(text.as_bytes()))
    }
}

/// An HTTP request.
///
/// Requests are values: interceptors return modified copies.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    endpoint: Endpoint,
    path: String,
    headers: Headers,
    body: RequestBody,
}

impl Request {
    /// Creates a request for an absolute `http://` or `https://` URI.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unparseable URI.
    pub fn new(method: Method, uri: &str) -> Result<Self, StratusError> {
        let (endpoint, path) = parse_uri(uri)?;
        Ok(Self {
            method,
            endpoint,
            path,
            headers: Headers::new(),
            body: RequestBody::Empty,
        })
    }

    /// Shorthand for a GET request.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unparseable URI.
    pub fn get(uri: &str) -> Result<Self, StratusError> {
        Self::new(Method::Get, uri)
    }

    /// Shorthand for a PUT request.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unparseable URI.
    pub fn put(uri: &str, body: impl Into<RequestBody>) -> Result<Self, StratusError> {
        Ok(Self::new(Method::Put, uri)?.with_body(body))
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a streaming body.
    #[must_use]
    pub fn with_streaming_body(mut self, provider: Arc<dyn BodyProvider>) -> Self {
        self.body = RequestBody::Streaming(provider);
        self
    }

    /// The method.
    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    /// The endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Path and query.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The full target URI.
    #[must_use]
    pub fn uri(&self) -> String {
        format!("{}{}", self.endpoint, self.path)
    }

    /// The headers.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable headers, for interceptors building a modified copy.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// The body.
    #[must_use]
    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// Replaces the body, returning the modified request.
    #[must_use]
    pub fn replace_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Header block written to the wire for this request.
    #[must_use]
    pub fn head(&self) -> RequestHead {
        let mut headers = self.headers.clone();
        if !headers.contains(names::HOST) {
            headers.insert(names::HOST, self.endpoint.authority());
        }
        if self.body.is_present() && !headers.contains(names::CONTENT_LENGTH) {
            if let Some(length) = self.body.content_length() {
                headers.insert(names::CONTENT_LENGTH, length.to_string());
            }
        }
        RequestHead {
            method: self.method,
            path: self.path.clone(),
            headers,
        }
    }
}

/// Method, target and headers of a request as sent on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// Method.
    pub method: Method,
    /// Path and query.
    pub path: String,
    /// Headers, including `Host` and known `Content-Length`.
    pub headers: Headers,
}

/// Status line and headers of a response, available before the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub status_text: String,
    /// Headers.
    pub headers: Headers,
}

impl ResponseHead {
    /// Creates a response head.
    #[must_use]
    pub fn new(status: u16, status_text: impl Into<String>, headers: Headers) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            headers,
        }
    }

    /// Returns true for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A response: head plus lazily consumed body.
#[derive(Debug)]
pub struct Response {
    /// Status line and headers.
    pub head: ResponseHead,
    /// Body.
    pub body: ByteStream,
}

impl Response {
    /// Creates a response.
    #[must_use]
    pub fn new(head: ResponseHead, body: ByteStream) -> Self {
        Self { head, body }
    }
}

fn parse_uri(uri: &str) -> Result<(Endpoint, String), StratusError> {
    let invalid = |message: &str| StratusError::from(ConfigError::new("uri", format!("{message}: {uri}")));

    let (scheme, rest) = if let Some(rest) = uri.strip_prefix("http://") {
        (Scheme::Http, rest)
    } else if let Some(rest) = uri.strip_prefix("https://") {
        (Scheme::Https, rest)
    } else {
        return Err(invalid("unsupported scheme"));
    };

    let split = rest.find(['/', '?']).unwrap_or(rest.len());
    let (authority, path) = rest.split_at(split);
    if authority.is_empty() {
        return Err(invalid("missing host"));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| invalid("invalid port"))?;
            (host, port)
        }
        None => (authority, scheme.default_port()),
    };

    let path = match path {
        "" => "/".to_string(),
        p if p.starts_with('?') => format!("/{p}"),
        p => p.to_string(),
    };

    Ok((Endpoint::new(scheme, host, port), path))
}
