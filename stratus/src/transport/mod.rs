//! Protocol binding between the pool and the wire.
//!
//! The pool and the execution engine only see [`Connector`] and
//! [`Connection`]; the bundled binding is plain-TCP HTTP/1.1 in [`h1`].

#[cfg(feature = "h1")]
pub mod h1;

use crate::errors::StratusError;
use crate::http::{Endpoint, RequestHead, ResponseHead};
use crate::stream::ByteStream;
use async_trait::async_trait;
use bytes::Bytes;

/// Establishes connections to endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be reached.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, StratusError>;
}

/// A live link to one endpoint carrying one request at a time.
#[async_trait]
pub trait Connection: Send {
    /// Writes the request head and streams the body, if any.
    ///
    /// # Errors
    ///
    /// Returns a transmission error, or the body stream's own failure.
    async fn send_request(
        &mut self,
        head: &RequestHead,
        body: Option<ByteStream>,
    ) -> Result<(), StratusError>;

    /// Reads the status line and headers of the response.
    ///
    /// # Errors
    ///
    /// Returns a transmission or decode error.
    async fn read_response_head(&mut self) -> Result<ResponseHead, StratusError>;

    /// Reads the next body chunk; `None` at end of body.
    ///
    /// # Errors
    ///
    /// Returns a transmission or decode error.
    async fn read_body_chunk(&mut self) -> Result<Option<Bytes>, StratusError>;

    /// Returns true if the response finished cleanly and the peer allows reuse.
    fn is_reusable(&self) -> bool;

    /// Forcibly disconnects. Must not block.
    fn abort(&mut self);

    /// Gracefully closes the connection.
    async fn close(&mut self);
}
