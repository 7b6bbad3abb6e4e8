//! Response handler callbacks.

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::StratusError;
use crate::http::ResponseHead;
use crate::stream::ByteStream;

/// Receives one logical request's response.
///
/// Per attempt the callbacks run in order: [`prepare`](Self::prepare), then
/// [`headers_received`](Self::headers_received) and
/// [`on_stream`](Self::on_stream) once a response arrives, then exactly one of
/// [`complete`](Self::complete) or
/// [`exception_occurred`](Self::exception_occurred). An abort that lands
/// between attempts adds no callback, since the previous attempt already
/// reported its failure. Callbacks run on the event loop and must not block.
#[async_trait]
pub trait ResponseHandler: Send {
    /// The value produced on success.
    type Output: Send;

    /// Called before each attempt. Handlers that buffer should reset here.
    fn prepare(&mut self) {}

    /// Called with the status line and headers before the body is streamed.
    fn headers_received(&mut self, head: &ResponseHead);

    /// Consumes the response body.
    ///
    /// The body is produced concurrently with this call, so the stream must
    /// be subscribed and drained, or dropped, before returning.
    async fn on_stream(&mut self, body: ByteStream) -> Result<(), StratusError>;

    /// Called when an attempt fails.
    fn exception_occurred(&mut self, error: &StratusError);

    /// Produces the result once the response was fully handled.
    async fn complete(&mut self) -> Result<Self::Output, StratusError>;
}

/// A fully read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedResponse {
    /// Status line and headers.
    pub head: ResponseHead,
    /// The whole body.
    pub body: Bytes,
}

impl BufferedResponse {
    /// Returns true for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.head.is_success()
    }
}

/// Handler that reads the whole response into memory.
#[derive(Debug, Default)]
pub struct BufferingHandler {
    head: Option<ResponseHead>,
    body: Bytes,
}

impl BufferingHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResponseHandler for BufferingHandler {
    type Output = BufferedResponse;

    fn prepare(&mut self) {
        self.head = None;
        self.body = Bytes::new();
    }

    fn headers_received(&mut self, head: &ResponseHead) {
        self.head = Some(head.clone());
    }

    async fn on_stream(&mut self, body: ByteStream) -> Result<(), StratusError> {
        self.body = body.collect().await?;
        Ok(())
    }

    fn exception_occurred(&mut self, _error: &StratusError) {
        self.head = None;
    }

    async fn complete(&mut self) -> Result<BufferedResponse, StratusError> {
        let head = self
            .head
            .take()
            .ok_or_else(|| StratusError::decode("response completed without headers"))?;
        Ok(BufferedResponse {
            head,
            body: std::mem::take(&mut self.body),
        })
    }
}
