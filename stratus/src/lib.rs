//! # Stratus
//!
//! Asynchronous request-execution core for cloud-service clients.
//!
//! Stratus drives HTTP requests from a caller's handler through to the wire:
//!
//! - **Connection pooling**: bounded, fair, per-endpoint pools of persistent connections
//! - **Backpressured bodies**: single-subscriber byte streams with explicit demand
//! - **Content integrity**: MD5 trailing checksums on downloads, digest checks on uploads
//! - **Retries**: composable conditions with jittered exponential backoff
//! - **Abortable executions**: abort in any state tears down the leased connection
//! - **Pagination**: lazy page and item iteration over continuation tokens
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stratus::prelude::*;
//!
//! let client = AsyncHttpClient::builder()
//!     .config(ClientConfig::from_json(r#"{"pool": {"max_connections_per_endpoint": 8}}"#)?)
//!     .build()?;
//!
//! let response = client
//!     .execution(Request::get("http://localhost:9000/bucket/key")?, BufferingHandler::new())
//!     .with_attribute(&OPERATION_KIND, OperationKind::Download)
//!     .run()
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod attributes;
pub mod cancellation;
pub mod client;
pub mod config;
pub mod errors;
pub mod http;
pub mod integrity;
pub mod interceptors;
pub mod observability;
pub mod pagination;
pub mod pool;
pub mod retry;
pub mod stream;
pub mod testing;
pub mod transport;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::attributes::{ExecutionAttributes, INTEGRITY_CONFIG, OPERATION_KIND};
    pub use crate::cancellation::AbortSignal;
    pub use crate::client::{
        AsyncHttpClient, BufferedResponse, BufferingHandler, ExecutionHandle, ExecutionState,
        RequestExecution, ResponseHandler,
    };
    pub use crate::config::{ClientConfig, IntegrityConfig, PoolConfig, RetryConfig};
    pub use crate::errors::{ErrorKind, StratusError};
    pub use crate::http::{Endpoint, Headers, Method, Request, RequestBody, Response, ResponseHead};
    pub use crate::integrity::{OperationKind, TrailingChecksumFilter, TrailingChecksumReader};
    pub use crate::interceptors::{Interceptor, InterceptorChain};
    pub use crate::pagination::{AsyncPageFetcher, PageFetcher, Paginator};
    pub use crate::pool::{ConnectionPool, EventLoop, Lease, PoolStats};
    pub use crate::retry::{BackoffStrategy, RetryCondition, RetryPolicy};
    pub use crate::stream::{channel, BodySender, ByteStream, ChunkFilter};
    pub use crate::transport::{Connection, Connector};
}
