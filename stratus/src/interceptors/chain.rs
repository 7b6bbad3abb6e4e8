//! Ordered request/response interceptors.

use crate::attributes::ExecutionAttributes;
use crate::errors::StratusError;
use crate::http::{Request, Response};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

/// Hook invoked around every attempt of a request.
///
/// Interceptors transform values; they must not touch connections.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Lower runs first for requests and last for responses.
    fn priority(&self) -> i32 {
        0
    }

    /// Returns the request to send.
    ///
    /// # Errors
    ///
    /// An error fails the attempt before a connection is acquired.
    async fn modify_request(
        &self,
        request: Request,
        _attributes: &mut ExecutionAttributes,
    ) -> Result<Request, StratusError> {
        Ok(request)
    }

    /// Returns the response handed to the handler.
    ///
    /// # Errors
    ///
    /// An error fails the attempt and discards the connection.
    async fn modify_response(
        &self,
        response: Response,
        _attributes: &mut ExecutionAttributes,
    ) -> Result<Response, StratusError> {
        Ok(response)
    }
}

/// Interceptors sorted by priority.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.interceptors.iter().map(|i| i.name()))
            .finish()
    }
}

impl InterceptorChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an interceptor; equal priorities keep insertion order.
    pub fn add(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
        self.interceptors.sort_by_key(|i| i.priority());
    }

    /// Builder-style [`add`](Self::add).
    #[must_use]
    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.add(interceptor);
        self
    }

    /// Runs request hooks in priority order.
    ///
    /// # Errors
    ///
    /// Returns the first interceptor error.
    pub async fn modify_request(
        &self,
        mut request: Request,
        attributes: &mut ExecutionAttributes,
    ) -> Result<Request, StratusError> {
        for interceptor in &self.interceptors {
            trace!(interceptor = interceptor.name(), "modify_request");
            request = interceptor.modify_request(request, attributes).await?;
        }
        Ok(request)
    }

    /// Runs response hooks in reverse priority order.
    ///
    /// # Errors
    ///
    /// Returns the first interceptor error.
    pub async fn modify_response(
        &self,
        mut response: Response,
        attributes: &mut ExecutionAttributes,
    ) -> Result<Response, StratusError> {
        for interceptor in self.interceptors.iter().rev() {
            trace!(interceptor = interceptor.name(), "modify_response");
            response = interceptor.modify_response(response, attributes).await?;
        }
        Ok(response)
    }

    /// Number of interceptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Returns true if the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}
