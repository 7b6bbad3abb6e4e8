//! Inline chunk filters layered onto a byte stream.

use crate::errors::StratusError;
use bytes::Bytes;

/// A transformation applied to every chunk of a [`ByteStream`](super::ByteStream).
///
/// Filters run on the consumer's task as chunks are taken from the channel, so
/// the work per call has to stay proportional to the chunk size.
pub trait ChunkFilter: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Processes one chunk.
    ///
    /// Returning `Ok(None)` withholds the chunk from the consumer; the channel
    /// replenishes the demand the chunk consumed. An error terminates the
    /// stream and no further chunks are delivered.
    fn on_chunk(&mut self, chunk: Bytes) -> Result<Option<Bytes>, StratusError>;

    /// Called once when the producer signals completion.
    ///
    /// An error here replaces the completion signal with a failure.
    fn on_complete(&mut self) -> Result<(), StratusError> {
        Ok(())
    }
}
