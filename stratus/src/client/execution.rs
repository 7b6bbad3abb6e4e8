//! The per-request state machine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use super::handler::ResponseHandler;
use super::state::{ExecutionState, StateCell};
use crate::attributes::{AttributeKey, ExecutionAttributes};
use crate::cancellation::AbortSignal;
use crate::errors::StratusError;
use crate::http::{Request, Response};
use crate::interceptors::InterceptorChain;
use crate::pool::{ConnectionPool, Lease};
use crate::retry::{RetryContext, RetryDecision, RetryPolicy};
use crate::stream::{channel, BodySender};
use crate::transport::Connection;

/// How the body of a successful exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyOutcome {
    /// Read to the end; the connection may be reused.
    Drained,
    /// The consumer cancelled before the end; the connection is unusable.
    Abandoned,
}

/// One logical request driven through acquisition, transmission, response
/// streaming and retries.
pub struct RequestExecution<H: ResponseHandler> {
    pool: ConnectionPool,
    interceptors: InterceptorChain,
    policy: RetryPolicy,
    request: Request,
    handler: H,
    attributes: ExecutionAttributes,
    signal: Arc<AbortSignal>,
    state: StateCell,
    request_id: Uuid,
    retries: u32,
    started: Instant,
}

impl<H: ResponseHandler> std::fmt::Debug for RequestExecution<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecution")
            .field("request_id", &self.request_id)
            .field("request", &self.request)
            .field("state", &self.state.get())
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

impl<H: ResponseHandler> RequestExecution<H> {
    pub(crate) fn new(
        pool: ConnectionPool,
        interceptors: InterceptorChain,
        policy: RetryPolicy,
        request: Request,
        handler: H,
    ) -> Self {
        Self {
            pool,
            interceptors,
            policy,
            request,
            handler,
            attributes: ExecutionAttributes::new(),
            signal: Arc::new(AbortSignal::new()),
            state: StateCell::default(),
            request_id: Uuid::new_v4(),
            retries: 0,
            started: Instant::now(),
        }
    }

    /// Replaces the execution attributes.
    #[must_use]
    pub fn with_attributes(mut self, attributes: ExecutionAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Sets one execution attribute.
    #[must_use]
    pub fn with_attribute<T: Send + Sync + 'static>(mut self, key: &AttributeKey<T>, value: T) -> Self {
        self.attributes.put(key, value);
        self
    }

    /// Identifier carried by this execution's log span.
    #[must_use]
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// The signal that aborts this execution.
    #[must_use]
    pub fn abort_signal(&self) -> Arc<AbortSignal> {
        self.signal.clone()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ExecutionState {
        self.state.get()
    }

    /// Runs the execution to completion on the caller's task.
    ///
    /// # Errors
    ///
    /// `Cancelled` when aborted, `RetryExhausted` when a retryable failure
    /// outlives the retry budget, otherwise the failure that was not
    /// retryable.
    pub async fn run(mut self) -> Result<H::Output, StratusError> {
        let span = info_span!(
            "request",
            request_id = %self.request_id,
            method = %self.request.method(),
            uri = %self.request.uri(),
        );
        self.drive().instrument(span).await
    }

    /// Runs the execution on the pool's event loop.
    pub fn spawn(self) -> ExecutionHandle<H::Output>
    where
        H: 'static,
        H::Output: 'static,
    {
        let signal = self.signal.clone();
        let state = self.state.clone();
        let request_id = self.request_id;
        let pool = self.pool.clone();
        let task = pool.event_loop().spawn(self.run());
        ExecutionHandle {
            request_id,
            signal,
            state,
            task,
        }
    }

    async fn drive(&mut self) -> Result<H::Output, StratusError> {
        self.started = Instant::now();
        let signal = self.signal.clone();
        loop {
            if signal.is_aborted() {
                return Err(self.cancelled(false));
            }
            self.handler.prepare();

            let attempt = tokio::select! {
                biased;
                () = signal.aborted() => None,
                result = self.attempt() => Some(result),
            };
            let error = match attempt {
                None => return Err(self.cancelled(true)),
                Some(Ok(())) => {
                    self.state.set(ExecutionState::Complete);
                    return self.handler.complete().await;
                }
                Some(Err(error)) => error,
            };

            self.handler.exception_occurred(&error);
            let context = RetryContext::new(self.retries, Some(error.clone()), self.started.elapsed());
            let decision = if self.request.body().is_replayable() {
                self.policy.decide(&context)
            } else {
                debug!("Request body cannot be replayed");
                RetryDecision::NotRetryable
            };
            match decision {
                RetryDecision::Retry(delay) => {
                    self.state.set(ExecutionState::Retrying);
                    debug!(
                        attempt = self.retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying request"
                    );
                    tokio::select! {
                        biased;
                        () = signal.aborted() => return Err(self.cancelled(false)),
                        () = tokio::time::sleep(delay) => {}
                    }
                    self.retries += 1;
                }
                RetryDecision::GiveUp => {
                    self.state.set(ExecutionState::Failed);
                    warn!(attempts = self.retries + 1, error = %error, "Retries exhausted");
                    return Err(StratusError::RetryExhausted {
                        attempts: self.retries + 1,
                        source: Box::new(error),
                    });
                }
                RetryDecision::NotRetryable => {
                    self.state.set(ExecutionState::Failed);
                    debug!(error = %error, "Request failed");
                    return Err(error);
                }
            }
        }
    }

    /// Fails the execution after an abort.
    ///
    /// Any lease held by the interrupted attempt has already been dropped,
    /// which disconnects its connection. The handler hears about the abort
    /// only if it interrupted an attempt in flight.
    fn cancelled(&mut self, interrupted_attempt: bool) -> StratusError {
        self.state.set(ExecutionState::Failed);
        let reason = self
            .signal
            .reason()
            .unwrap_or_else(|| "aborted".to_string());
        debug!(reason = %reason, "Execution aborted");
        let error = StratusError::Cancelled(reason);
        if interrupted_attempt {
            self.handler.exception_occurred(&error);
        }
        error
    }

    async fn attempt(&mut self) -> Result<(), StratusError> {
        self.state.set(ExecutionState::AcquiringConnection);
        let request = self
            .interceptors
            .modify_request(self.request.clone(), &mut self.attributes)
            .await?;
        let mut lease = self.pool.acquire(request.endpoint()).await?;
        match self.exchange(&request, &mut lease).await {
            Ok(BodyOutcome::Drained) => self.pool.release(lease),
            Ok(BodyOutcome::Abandoned) => {
                self.pool.discard(lease);
                Ok(())
            }
            Err(error) => {
                self.pool.discard(lease);
                Err(error)
            }
        }
    }

    async fn exchange(&mut self, request: &Request, lease: &mut Lease) -> Result<BodyOutcome, StratusError> {
        let socket_timeout = self.pool.config().socket_timeout();
        let connection = lease.connection()?;

        self.state.set(ExecutionState::Transmitting);
        connection.send_request(&request.head(), request.body().open()).await?;

        self.state.set(ExecutionState::AwaitingResponse);
        let head = read_with_timeout(socket_timeout, "awaiting the response head", connection.read_response_head()).await?;

        if !head.is_success() {
            let error = StratusError::Status {
                code: head.status,
                text: head.status_text.clone(),
            };
            let context = RetryContext::new(self.retries, Some(error.clone()), self.started.elapsed());
            if self.policy.is_retryable(&context) {
                debug!(status = head.status, "Withholding retryable error response");
                return Err(error);
            }
        }

        let (sender, body) = channel();
        let body = body.with_content_length(head.headers.content_length());
        let Response { head, body } = self
            .interceptors
            .modify_response(Response::new(head, body), &mut self.attributes)
            .await?;

        self.handler.headers_received(&head);
        self.state.set(ExecutionState::StreamingBody);
        let (pumped, consumed) = tokio::join!(
            pump_body(connection, sender, socket_timeout),
            self.handler.on_stream(body),
        );
        match (pumped, consumed) {
            (Err(error), _) | (Ok(_), Err(error)) => Err(error),
            (Ok(outcome), Ok(())) => Ok(outcome),
        }
    }
}

/// Moves body chunks from the connection into the channel, honouring the
/// consumer's demand.
async fn pump_body(
    connection: &mut dyn Connection,
    mut sender: BodySender,
    socket_timeout: Duration,
) -> Result<BodyOutcome, StratusError> {
    loop {
        let chunk = tokio::select! {
            biased;
            () = sender.cancelled() => return Ok(BodyOutcome::Abandoned),
            chunk = read_with_timeout(socket_timeout, "reading the response body", connection.read_body_chunk()) => chunk,
        };
        match chunk {
            Ok(Some(chunk)) => {
                if sender.send(chunk).await.is_err() {
                    return Ok(BodyOutcome::Abandoned);
                }
            }
            Ok(None) => {
                sender.complete();
                return Ok(BodyOutcome::Drained);
            }
            Err(error) => {
                sender.fail(error.clone());
                return Err(error);
            }
        }
    }
}

async fn read_with_timeout<T>(
    timeout: Duration,
    during: &str,
    read: impl std::future::Future<Output = Result<T, StratusError>>,
) -> Result<T, StratusError> {
    match tokio::time::timeout(timeout, read).await {
        Ok(result) => result,
        Err(_) => Err(StratusError::SocketTimeout {
            millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            during: during.to_string(),
        }),
    }
}

/// Handle to an execution running on the event loop.
#[derive(Debug)]
pub struct ExecutionHandle<T> {
    request_id: Uuid,
    signal: Arc<AbortSignal>,
    state: StateCell,
    task: JoinHandle<Result<T, StratusError>>,
}

impl<T> ExecutionHandle<T> {
    /// Identifier carried by the execution's log span.
    #[must_use]
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Aborts the execution if this handle is dropped before it finishes.
    pub(crate) fn abort_on_drop(&self) -> AbortOnDrop {
        AbortOnDrop {
            signal: Some(self.signal.clone()),
        }
    }

    /// Aborts the execution. Returns false if it was already aborted.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        self.signal.abort(reason)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ExecutionState {
        self.state.get()
    }

    /// Returns true once the execution reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the execution's result.
    ///
    /// # Errors
    ///
    /// Returns the execution's failure, or `Cancelled` if its task was torn
    /// down with the event loop.
    pub async fn join(self) -> Result<T, StratusError> {
        match self.task.await {
            Ok(result) => result,
            Err(error) if error.is_cancelled() => {
                Err(StratusError::Cancelled("event loop shut down".to_string()))
            }
            Err(error) => Err(StratusError::Cancelled(format!("execution task panicked: {error}"))),
        }
    }
}

/// Aborts an execution when dropped unless disarmed.
pub(crate) struct AbortOnDrop {
    signal: Option<Arc<AbortSignal>>,
}

impl AbortOnDrop {
    pub(crate) fn disarm(mut self) {
        self.signal = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(signal) = self.signal.take() {
            signal.abort("caller dropped the execution");
        }
    }
}
