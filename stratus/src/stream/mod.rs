//! Backpressure-aware byte streams for request and response bodies.

mod channel;
mod filter;

pub use channel::{channel, BodySender, BodySubscription, ByteStream, Terminal};
pub use filter::ChunkFilter;
