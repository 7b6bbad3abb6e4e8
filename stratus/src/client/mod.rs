//! Request execution.
//!
//! [`AsyncHttpClient`] ties the pool, the interceptor chain and the retry
//! policy together; each call produces a [`RequestExecution`] that drives one
//! logical request through its attempts.

mod execution;
mod handler;
mod state;

pub use execution::{ExecutionHandle, RequestExecution};
pub use handler::{BufferedResponse, BufferingHandler, ResponseHandler};
pub use state::ExecutionState;

use std::sync::Arc;

use crate::config::ClientConfig;
use crate::errors::StratusError;
use crate::http::Request;
use crate::integrity::ContentIntegrityInterceptor;
use crate::interceptors::{Interceptor, InterceptorChain};
use crate::pool::{ConnectionPool, EventLoop};
use crate::retry::RetryPolicy;
use crate::transport::Connector;

/// Asynchronous client executing requests over a shared connection pool.
///
/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct AsyncHttpClient {
    pool: ConnectionPool,
    interceptors: InterceptorChain,
    retry_policy: RetryPolicy,
    config: ClientConfig,
}

impl AsyncHttpClient {
    /// Starts building a client.
    #[must_use]
    pub fn builder() -> AsyncHttpClientBuilder {
        AsyncHttpClientBuilder::default()
    }

    /// The connection pool.
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The configuration the client was built from.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The retry policy applied to executions.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Prepares an execution without starting it.
    pub fn execution<H: ResponseHandler>(&self, request: Request, handler: H) -> RequestExecution<H> {
        RequestExecution::new(
            self.pool.clone(),
            self.interceptors.clone(),
            self.retry_policy.clone(),
            request,
            handler,
        )
    }

    /// Executes a request on the pool's event loop and waits for the result.
    ///
    /// Dropping the returned future aborts the execution.
    ///
    /// # Errors
    ///
    /// Returns the final failure of the execution.
    pub async fn execute<H>(&self, request: Request, handler: H) -> Result<H::Output, StratusError>
    where
        H: ResponseHandler + 'static,
        H::Output: 'static,
    {
        let handle = self.execution(request, handler).spawn();
        let guard = handle.abort_on_drop();
        let result = handle.join().await;
        guard.disarm();
        result
    }

    /// Closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Builder for [`AsyncHttpClient`].
#[derive(Default)]
pub struct AsyncHttpClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    event_loop: Option<EventLoop>,
    retry_policy: Option<RetryPolicy>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl std::fmt::Debug for AsyncHttpClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncHttpClientBuilder")
            .field("config", &self.config)
            .field("interceptors", &self.interceptors.len())
            .finish_non_exhaustive()
    }
}

impl AsyncHttpClientBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the connector. Defaults to plain TCP.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Sets the event loop. Defaults to an owned loop sized by the pool
    /// configuration.
    #[must_use]
    pub fn event_loop(mut self, event_loop: EventLoop) -> Self {
        self.event_loop = Some(event_loop);
        self
    }

    /// Overrides the policy built from the retry configuration.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Adds an interceptor.
    #[must_use]
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid settings or a missing
    /// connector when the `h1` feature is disabled.
    pub fn build(self) -> Result<AsyncHttpClient, StratusError> {
        self.config.validate()?;
        let retry_policy = match self.retry_policy {
            Some(policy) => policy,
            None => self.config.retry.build()?,
        };
        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector()?,
        };
        let event_loop = match self.event_loop {
            Some(event_loop) => event_loop,
            None => EventLoop::new(self.config.pool.event_loop_threads)?,
        };
        let pool = ConnectionPool::new(connector, self.config.pool.clone(), event_loop)?;

        let mut interceptors = InterceptorChain::new()
            .with(Arc::new(ContentIntegrityInterceptor::new(self.config.integrity)));
        for interceptor in self.interceptors {
            interceptors.add(interceptor);
        }

        Ok(AsyncHttpClient {
            pool,
            interceptors,
            retry_policy,
            config: self.config,
        })
    }
}

#[cfg(feature = "h1")]
#[allow(clippy::unnecessary_wraps)]
fn default_connector() -> Result<Arc<dyn Connector>, StratusError> {
    Ok(Arc::new(crate::transport::h1::TcpConnector::new()))
}

#[cfg(not(feature = "h1"))]
fn default_connector() -> Result<Arc<dyn Connector>, StratusError> {
    Err(crate::errors::ConfigError::new("connector", "no connector configured").into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::testing::MockConnector;

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let config = ClientConfig::new().with_pool(PoolConfig::default().with_socket_timeout_ms(-5));
        let result = AsyncHttpClient::builder()
            .config(config)
            .connector(Arc::new(MockConnector::new()))
            .event_loop(EventLoop::current().unwrap())
            .build();
        assert!(matches!(result, Err(StratusError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_builder_installs_integrity_interceptor() {
        let client = AsyncHttpClient::builder()
            .connector(Arc::new(MockConnector::new()))
            .event_loop(EventLoop::current().unwrap())
            .build()
            .unwrap();
        assert_eq!(client.interceptors.len(), 1);
        assert_eq!(client.retry_policy().max_retries(), 3);
    }
}
