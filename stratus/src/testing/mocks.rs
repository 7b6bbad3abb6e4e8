//! Scripted in-memory transport and recording handlers.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::client::ResponseHandler;
use crate::errors::StratusError;
use crate::http::{names, Endpoint, Headers, Method, RequestHead, ResponseHead};
use crate::stream::ByteStream;
use crate::transport::{Connection, Connector};

/// A canned response served by [`MockConnector`].
#[derive(Debug, Clone)]
pub struct MockResponse {
    status: u16,
    status_text: String,
    headers: Headers,
    chunks: Vec<Bytes>,
    keep_alive: bool,
    fail_after: Option<usize>,
    head_delay: Duration,
    chunk_delay: Duration,
    stall: bool,
}

impl MockResponse {
    /// A response with the given status and no body.
    #[must_use]
    pub fn new(status: u16, status_text: impl Into<String>) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            headers: Headers::new(),
            chunks: Vec::new(),
            keep_alive: true,
            fail_after: None,
            head_delay: Duration::ZERO,
            chunk_delay: Duration::ZERO,
            stall: false,
        }
    }

    /// A 200 response carrying `body` as one chunk.
    #[must_use]
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200, "OK").with_chunks(vec![body.into()])
    }

    /// An error response with the given status.
    #[must_use]
    pub fn status(status: u16) -> Self {
        let text = match status {
            404 => "Not Found",
            429 => "Too Many Requests",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            _ => "Error",
        };
        Self::new(status, text)
    }

    /// Sets a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the body chunks and sets `Content-Length` to their total.
    #[must_use]
    pub fn with_chunks(mut self, chunks: Vec<Bytes>) -> Self {
        let length: usize = chunks.iter().map(Bytes::len).sum();
        self.headers.insert(names::CONTENT_LENGTH, length.to_string());
        self.chunks = chunks;
        self
    }

    /// Sets whether the connection may be reused afterwards.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Fails the body read after `chunks` chunks were delivered.
    #[must_use]
    pub fn fail_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    /// Delays the response head.
    #[must_use]
    pub fn with_head_delay(mut self, delay: Duration) -> Self {
        self.head_delay = delay;
        self
    }

    /// Delays each body chunk.
    #[must_use]
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Never ends the body after the scripted chunks.
    #[must_use]
    pub fn stall(mut self) -> Self {
        self.stall = true;
        self
    }
}

/// A request as the mock connection received it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Method.
    pub method: Method,
    /// Path and query.
    pub path: String,
    /// Headers as written.
    pub headers: Headers,
    /// The full body.
    pub body: Bytes,
}

/// Counters kept by a [`MockConnector`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    /// Connections opened.
    pub connects: usize,
    /// Requests received.
    pub requests: usize,
    /// Connections forcibly disconnected.
    pub aborts: usize,
    /// Connections gracefully closed.
    pub closes: usize,
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<MockResponse>,
    fallback: Option<MockResponse>,
    fail_connects: usize,
    stats: MockStats,
    requests: Vec<RecordedRequest>,
}

/// A connector whose connections answer from a shared script.
///
/// Responses are served in order across all connections; once the script is
/// empty the fallback response, if any, is served.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    /// Creates a connector with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a response to the script.
    #[must_use]
    pub fn respond(self, response: MockResponse) -> Self {
        self.push(response);
        self
    }

    /// Serves `response` whenever the script is exhausted.
    #[must_use]
    pub fn respond_always(self, response: MockResponse) -> Self {
        self.state.lock().fallback = Some(response);
        self
    }

    /// Fails the next `count` connection attempts.
    #[must_use]
    pub fn fail_connects(self, count: usize) -> Self {
        self.state.lock().fail_connects = count;
        self
    }

    /// Appends a response to the script.
    pub fn push(&self, response: MockResponse) {
        self.state.lock().script.push_back(response);
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> MockStats {
        self.state.lock().stats
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, StratusError> {
        let mut state = self.state.lock();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(StratusError::ConnectionAcquisition {
                endpoint: endpoint.to_string(),
                message: "connection refused".to_string(),
            });
        }
        state.stats.connects += 1;
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
            current: None,
            pending: VecDeque::new(),
            delivered: 0,
            finished: false,
            failed: false,
            aborted: false,
        }))
    }
}

struct MockConnection {
    state: Arc<Mutex<MockState>>,
    current: Option<MockResponse>,
    pending: VecDeque<Bytes>,
    delivered: usize,
    finished: bool,
    failed: bool,
    aborted: bool,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send_request(
        &mut self,
        head: &RequestHead,
        body: Option<ByteStream>,
    ) -> Result<(), StratusError> {
        if self.aborted {
            return Err(StratusError::transmission("connection aborted"));
        }
        let body = match body {
            Some(stream) => stream.collect().await?,
            None => Bytes::new(),
        };
        let response = {
            let mut state = self.state.lock();
            state.stats.requests += 1;
            state.requests.push(RecordedRequest {
                method: head.method,
                path: head.path.clone(),
                headers: head.headers.clone(),
                body,
            });
            state.script.pop_front().or_else(|| state.fallback.clone())
        };
        let Some(response) = response else {
            self.failed = true;
            return Err(StratusError::transmission("no scripted response"));
        };
        self.pending = response.chunks.iter().cloned().collect();
        self.delivered = 0;
        self.finished = false;
        self.current = Some(response);
        Ok(())
    }

    async fn read_response_head(&mut self) -> Result<ResponseHead, StratusError> {
        let Some(response) = self.current.as_ref() else {
            return Err(StratusError::decode("no request in flight"));
        };
        let head = ResponseHead::new(
            response.status,
            response.status_text.clone(),
            response.headers.clone(),
        );
        let delay = response.head_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(head)
    }

    async fn read_body_chunk(&mut self) -> Result<Option<Bytes>, StratusError> {
        let Some(response) = self.current.as_ref() else {
            return Ok(None);
        };
        if response.fail_after.is_some_and(|n| self.delivered >= n) {
            self.failed = true;
            return Err(StratusError::transmission("connection reset by peer"));
        }
        let (delay, stall) = (response.chunk_delay, response.stall);
        if let Some(chunk) = self.pending.pop_front() {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.delivered += 1;
            return Ok(Some(chunk));
        }
        if stall {
            std::future::pending::<()>().await;
        }
        self.finished = true;
        Ok(None)
    }

    fn is_reusable(&self) -> bool {
        !self.failed
            && !self.aborted
            && self
                .current
                .as_ref()
                .map_or(true, |r| r.keep_alive && self.finished)
    }

    fn abort(&mut self) {
        if !self.aborted {
            self.aborted = true;
            self.state.lock().stats.aborts += 1;
        }
    }

    async fn close(&mut self) {
        self.state.lock().stats.closes += 1;
    }
}

/// One callback observed by a [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerEvent {
    /// An attempt started.
    Prepare,
    /// Headers arrived with this status.
    Headers(u16),
    /// A body chunk of this many bytes arrived.
    Chunk(usize),
    /// The body ended.
    BodyComplete,
    /// The attempt failed with an error of this kind.
    Exception(crate::errors::ErrorKind),
    /// The execution completed.
    Complete,
}

/// A handler that records every callback and collects the body.
///
/// The event log is shared, so it can be inspected while the execution runs
/// on another task.
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    events: Arc<Mutex<Vec<HandlerEvent>>>,
    body: Vec<u8>,
}

impl RecordingHandler {
    /// Creates a handler with an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events observed so far.
    #[must_use]
    pub fn events(&self) -> Vec<HandlerEvent> {
        self.events.lock().clone()
    }

    /// Shared view of the event log.
    #[must_use]
    pub fn event_log(&self) -> Arc<Mutex<Vec<HandlerEvent>>> {
        self.events.clone()
    }

    fn record(&self, event: HandlerEvent) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl ResponseHandler for RecordingHandler {
    type Output = Bytes;

    fn prepare(&mut self) {
        self.body.clear();
        self.record(HandlerEvent::Prepare);
    }

    fn headers_received(&mut self, head: &ResponseHead) {
        self.record(HandlerEvent::Headers(head.status));
    }

    async fn on_stream(&mut self, mut body: ByteStream) -> Result<(), StratusError> {
        let mut subscription = body.subscribe()?;
        while let Some(chunk) = subscription.pull().await {
            let chunk = chunk?;
            self.record(HandlerEvent::Chunk(chunk.len()));
            self.body.extend_from_slice(&chunk);
        }
        self.record(HandlerEvent::BodyComplete);
        Ok(())
    }

    fn exception_occurred(&mut self, error: &StratusError) {
        self.record(HandlerEvent::Exception(error.kind()));
    }

    async fn complete(&mut self) -> Result<Bytes, StratusError> {
        self.record(HandlerEvent::Complete);
        Ok(Bytes::from(std::mem::take(&mut self.body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Scheme;

    #[tokio::test]
    async fn test_script_served_in_order() {
        let connector = MockConnector::new()
            .respond(MockResponse::ok("first"))
            .respond(MockResponse::status(503));
        let endpoint = Endpoint::new(Scheme::Http, "mock", 80);
        let head = RequestHead {
            method: Method::Get,
            path: "/".to_string(),
            headers: Headers::new(),
        };

        let mut connection = connector.connect(&endpoint).await.unwrap();
        connection.send_request(&head, None).await.unwrap();
        assert_eq!(connection.read_response_head().await.unwrap().status, 200);
        assert_eq!(connection.read_body_chunk().await.unwrap().unwrap(), Bytes::from("first"));
        assert!(connection.read_body_chunk().await.unwrap().is_none());
        assert!(connection.is_reusable());

        connection.send_request(&head, Some(ByteStream::from_bytes("payload"))).await.unwrap();
        assert_eq!(connection.read_response_head().await.unwrap().status, 503);

        assert!(connection.send_request(&head, None).await.is_err());
        assert_eq!(connector.stats().requests, 3);
        assert_eq!(connector.requests()[1].body, Bytes::from("payload"));
    }

    #[tokio::test]
    async fn test_fail_after_breaks_connection() {
        let connector = MockConnector::new().respond(
            MockResponse::new(200, "OK")
                .with_chunks(vec![Bytes::from("a"), Bytes::from("b")])
                .fail_after(1),
        );
        let endpoint = Endpoint::new(Scheme::Http, "mock", 80);
        let head = RequestHead {
            method: Method::Get,
            path: "/".to_string(),
            headers: Headers::new(),
        };
        let mut connection = connector.connect(&endpoint).await.unwrap();
        connection.send_request(&head, None).await.unwrap();
        connection.read_response_head().await.unwrap();
        assert!(connection.read_body_chunk().await.unwrap().is_some());
        assert!(matches!(
            connection.read_body_chunk().await,
            Err(StratusError::Transmission(_))
        ));
        assert!(!connection.is_reusable());
    }
}
