//! Per-endpoint connection pool.
//!
//! Each endpoint owns a fair semaphore sized to the connection limit, so
//! saturated endpoints queue acquisitions in arrival order. A [`Lease`] holds
//! one permit and one connection from acquisition until it is released,
//! discarded, or dropped.

mod event_loop;
mod stats;

pub use event_loop::EventLoop;
pub use stats::PoolStats;

use crate::config::PoolConfig;
use crate::errors::StratusError;
use crate::http::Endpoint;
use crate::transport::{Connection, Connector};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

#[derive(Default)]
struct EndpointState {
    idle: Vec<Box<dyn Connection>>,
    leased: HashSet<u64>,
    pending: usize,
    created: u64,
    reused: u64,
    released: u64,
    closed: u64,
    discarded: u64,
}

struct EndpointPool {
    endpoint: Endpoint,
    permits: Arc<Semaphore>,
    state: Mutex<EndpointState>,
}

impl EndpointPool {
    fn new(endpoint: Endpoint, max_connections: usize) -> Self {
        Self {
            endpoint,
            permits: Arc::new(Semaphore::new(max_connections)),
            state: Mutex::new(EndpointState::default()),
        }
    }

    /// Removes a lease id from the leased set.
    fn check_in(&self, id: u64) -> Result<(), StratusError> {
        if self.state.lock().leased.remove(&id) {
            Ok(())
        } else {
            Err(StratusError::DoubleRelease(id))
        }
    }

    fn record_discard(&self, id: u64) {
        let mut state = self.state.lock();
        state.leased.remove(&id);
        state.discarded += 1;
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            leased: state.leased.len(),
            idle: state.idle.len(),
            pending: state.pending,
            created: state.created,
            reused: state.reused,
            released: state.released,
            closed: state.closed,
            discarded: state.discarded,
        }
    }
}

struct PendingGuard<'a>(&'a EndpointPool);

impl<'a> PendingGuard<'a> {
    fn new(pool: &'a EndpointPool) -> Self {
        pool.state.lock().pending += 1;
        Self(pool)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.state.lock().pending -= 1;
    }
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    endpoints: DashMap<Endpoint, Arc<EndpointPool>>,
    closed: AtomicBool,
    next_lease_id: AtomicU64,
    event_loop: EventLoop,
}

/// Bounded pool of persistent connections, keyed by endpoint.
///
/// Cheap to clone; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoints", &self.inner.endpoints.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionPool {
    /// Creates a pool.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(
        connector: Arc<dyn Connector>,
        config: PoolConfig,
        event_loop: EventLoop,
    ) -> Result<Self, StratusError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                endpoints: DashMap::new(),
                closed: AtomicBool::new(false),
                next_lease_id: AtomicU64::new(1),
                event_loop,
            }),
        })
    }

    /// The pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The event loop the pool runs on.
    #[must_use]
    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    /// Returns true after [`close`](Self::close).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn endpoint_pool(&self, endpoint: &Endpoint) -> Arc<EndpointPool> {
        self.inner
            .endpoints
            .entry(endpoint.clone())
            .or_insert_with(|| {
                Arc::new(EndpointPool::new(
                    endpoint.clone(),
                    self.inner.config.max_connections_per_endpoint,
                ))
            })
            .clone()
    }

    /// Leases a connection to `endpoint`.
    ///
    /// Waits in FIFO order while the endpoint is at capacity, reuses an idle
    /// connection when one exists, and otherwise connects.
    ///
    /// # Errors
    ///
    /// `ConnectionAcquisition` on timeout or connect failure; `PoolClosed`
    /// once the pool is closed.
    pub async fn acquire(&self, endpoint: &Endpoint) -> Result<Lease, StratusError> {
        if self.is_closed() {
            return Err(StratusError::PoolClosed);
        }
        let pool = self.endpoint_pool(endpoint);
        let timeout = self.inner.config.acquisition_timeout();

        let permit = {
            let _pending = PendingGuard::new(&pool);
            match tokio::time::timeout(timeout, pool.permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(StratusError::PoolClosed),
                Err(_) => {
                    warn!(endpoint = %endpoint, timeout_ms = timeout.as_millis() as u64, "Connection acquisition timed out");
                    return Err(StratusError::ConnectionAcquisition {
                        endpoint: endpoint.to_string(),
                        message: format!(
                            "timed out after {}ms waiting for a connection",
                            timeout.as_millis()
                        ),
                    });
                }
            }
        };

        let id = self.inner.next_lease_id.fetch_add(1, Ordering::Relaxed);
        let idle = {
            let mut state = pool.state.lock();
            let idle = state.idle.pop();
            if idle.is_some() {
                state.reused += 1;
                state.leased.insert(id);
            }
            idle
        };
        if let Some(connection) = idle {
            debug!(endpoint = %endpoint, lease = id, "Reusing idle connection");
            return Ok(Lease::new(id, connection, permit, pool, true));
        }

        let connect_timeout = self.inner.config.connect_timeout();
        let connection = match tokio::time::timeout(connect_timeout, self.inner.connector.connect(endpoint)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(error)) => {
                debug!(endpoint = %endpoint, error = %error, "Connect failed");
                return Err(match error {
                    StratusError::ConnectionAcquisition { .. } => error,
                    other => StratusError::ConnectionAcquisition {
                        endpoint: endpoint.to_string(),
                        message: other.to_string(),
                    },
                });
            }
            Err(_) => {
                return Err(StratusError::ConnectionAcquisition {
                    endpoint: endpoint.to_string(),
                    message: format!("connect timed out after {}ms", connect_timeout.as_millis()),
                });
            }
        };

        {
            let mut state = pool.state.lock();
            state.created += 1;
            state.leased.insert(id);
        }
        debug!(endpoint = %endpoint, lease = id, "Opened new connection");
        Ok(Lease::new(id, connection, permit, pool, false))
    }

    /// Returns a lease's connection to the pool.
    ///
    /// Reusable connections become idle; others are closed in the background.
    ///
    /// # Errors
    ///
    /// Returns `DoubleRelease` if the lease was already settled.
    pub fn release(&self, mut lease: Lease) -> Result<(), StratusError> {
        let Some(mut connection) = lease.connection.take() else {
            return Err(StratusError::DoubleRelease(lease.id));
        };
        lease.pool.check_in(lease.id)?;

        if connection.is_reusable() && !self.is_closed() {
            let mut state = lease.pool.state.lock();
            state.released += 1;
            state.idle.push(connection);
            debug!(endpoint = %lease.pool.endpoint, lease = lease.id, "Connection returned to pool");
        } else {
            lease.pool.state.lock().closed += 1;
            debug!(endpoint = %lease.pool.endpoint, lease = lease.id, "Closing non-reusable connection");
            self.inner.event_loop.spawn(async move {
                connection.close().await;
            });
        }
        Ok(())
    }

    /// Forcibly disconnects a lease's connection and frees its slot.
    pub fn discard(&self, lease: Lease) {
        drop(lease);
    }

    /// Snapshot of an endpoint's counters.
    #[must_use]
    pub fn stats(&self, endpoint: &Endpoint) -> PoolStats {
        self.inner
            .endpoints
            .get(endpoint)
            .map(|pool| pool.stats())
            .unwrap_or_default()
    }

    /// Closes the pool.
    ///
    /// Pending and future acquisitions fail with `PoolClosed`, idle
    /// connections are closed, and an owned event loop is shut down.
    /// Outstanding leases stay valid; their connections are closed on release.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pools: Vec<Arc<EndpointPool>> = self.inner.endpoints.iter().map(|e| e.value().clone()).collect();
        for pool in pools {
            pool.permits.close();
            let idle = std::mem::take(&mut pool.state.lock().idle);
            let count = idle.len() as u64;
            for mut connection in idle {
                connection.close().await;
            }
            pool.state.lock().closed += count;
        }
        info!("Connection pool closed");
        self.inner.event_loop.shutdown();
    }
}

/// Exclusive use of one pooled connection.
///
/// Dropping a lease without releasing it aborts the connection.
pub struct Lease {
    id: u64,
    connection: Option<Box<dyn Connection>>,
    reused: bool,
    pool: Arc<EndpointPool>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("endpoint", &self.pool.endpoint)
            .field("reused", &self.reused)
            .finish()
    }
}

impl Lease {
    fn new(
        id: u64,
        connection: Box<dyn Connection>,
        permit: OwnedSemaphorePermit,
        pool: Arc<EndpointPool>,
        reused: bool,
    ) -> Self {
        Self {
            id,
            connection: Some(connection),
            reused,
            pool,
            _permit: permit,
        }
    }

    /// Lease identifier, unique within the pool.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The endpoint the connection belongs to.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.pool.endpoint
    }

    /// Returns true if the connection was reused from the idle set.
    #[must_use]
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// The leased connection.
    ///
    /// # Errors
    ///
    /// Returns `DoubleRelease` once the connection has been handed back.
    pub fn connection(&mut self) -> Result<&mut dyn Connection, StratusError> {
        match self.connection.as_deref_mut() {
            Some(connection) => Ok(connection),
            None => Err(StratusError::DoubleRelease(self.id)),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.abort();
            self.pool.record_discard(self.id);
            debug!(endpoint = %self.pool.endpoint, lease = self.id, "Connection discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Scheme;
    use crate::testing::{MockConnector, MockResponse};
    use std::time::Duration;
    use tokio_test::{assert_pending, task};

    fn endpoint() -> Endpoint {
        Endpoint::new(Scheme::Http, "localhost", 9000)
    }

    fn pool(connector: &MockConnector, config: PoolConfig) -> ConnectionPool {
        ConnectionPool::new(Arc::new(connector.clone()), config, EventLoop::current().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_never_exceeds_max_per_endpoint() {
        let connector = MockConnector::new();
        let pool = pool(&connector, PoolConfig::default().with_max_connections(2));

        let first = pool.acquire(&endpoint()).await.unwrap();
        let second = pool.acquire(&endpoint()).await.unwrap();

        let waiting_pool = pool.clone();
        let mut third = task::spawn(async move { waiting_pool.acquire(&endpoint()).await });
        assert_pending!(third.poll());
        assert_eq!(pool.stats(&endpoint()).leased, 2);
        assert_eq!(pool.stats(&endpoint()).pending, 1);

        pool.release(first).unwrap();
        assert!(third.is_woken());
        let third = third.await.unwrap();
        assert!(third.is_reused());
        assert_eq!(pool.stats(&endpoint()).leased, 2);
        assert_eq!(connector.stats().connects, 2);
        drop(second);
    }

    #[tokio::test]
    async fn test_many_concurrent_acquisitions() {
        let connector = MockConnector::new();
        let pool = pool(&connector, PoolConfig::default().with_max_connections(3));
        let peak = Arc::new(Mutex::new(0usize));

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let lease = pool.acquire(&endpoint()).await.unwrap();
                {
                    let mut peak = peak.lock();
                    *peak = (*peak).max(pool.stats(&endpoint()).leased);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
                pool.release(lease).unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(*peak.lock() <= 3);
        assert_eq!(pool.stats(&endpoint()).leased, 0);
    }

    #[tokio::test]
    async fn test_acquisition_timeout() {
        let connector = MockConnector::new();
        let pool = pool(
            &connector,
            PoolConfig::default()
                .with_max_connections(1)
                .with_acquisition_timeout_ms(20),
        );
        let _held = pool.acquire(&endpoint()).await.unwrap();
        let err = pool.acquire(&endpoint()).await.unwrap_err();
        assert!(matches!(err, StratusError::ConnectionAcquisition { .. }));
        assert_eq!(pool.stats(&endpoint()).pending, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_slot() {
        let connector = MockConnector::new().fail_connects(1);
        let pool = pool(&connector, PoolConfig::default().with_max_connections(1));

        assert!(matches!(
            pool.acquire(&endpoint()).await,
            Err(StratusError::ConnectionAcquisition { .. })
        ));
        let lease = pool.acquire(&endpoint()).await.unwrap();
        assert_eq!(pool.stats(&endpoint()).created, 1);
        pool.release(lease).unwrap();
    }

    #[tokio::test]
    async fn test_non_reusable_connection_closed_on_release() {
        let connector = MockConnector::new().respond(MockResponse::ok("x").keep_alive(false));
        let pool = pool(&connector, PoolConfig::default());
        let mut lease = pool.acquire(&endpoint()).await.unwrap();
        {
            let connection = lease.connection().unwrap();
            connection
                .send_request(&crate::http::Request::get("http://localhost:9000/").unwrap().head(), None)
                .await
                .unwrap();
            connection.read_response_head().await.unwrap();
            while connection.read_body_chunk().await.unwrap().is_some() {}
        }
        pool.release(lease).unwrap();
        let stats = pool.stats(&endpoint());
        assert_eq!((stats.idle, stats.closed, stats.released), (0, 1, 0));
    }

    #[tokio::test]
    async fn test_dropped_lease_is_discarded() {
        let connector = MockConnector::new();
        let pool = pool(&connector, PoolConfig::default().with_max_connections(1));
        let lease = pool.acquire(&endpoint()).await.unwrap();
        pool.discard(lease);

        let stats = pool.stats(&endpoint());
        assert_eq!((stats.leased, stats.idle, stats.discarded), (0, 0, 1));
        assert_eq!(connector.stats().aborts, 1);

        let again = pool.acquire(&endpoint()).await.unwrap();
        assert!(!again.is_reused());
    }

    #[tokio::test]
    async fn test_double_check_in_detected() {
        let connector = MockConnector::new();
        let pool = pool(&connector, PoolConfig::default());
        let lease = pool.acquire(&endpoint()).await.unwrap();
        let endpoint_pool = pool.endpoint_pool(&endpoint());
        let id = lease.id();
        pool.release(lease).unwrap();
        assert!(matches!(endpoint_pool.check_in(id), Err(StratusError::DoubleRelease(i)) if i == id));
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_future_acquisitions() {
        let connector = MockConnector::new();
        let pool = pool(&connector, PoolConfig::default().with_max_connections(1));
        let held = pool.acquire(&endpoint()).await.unwrap();

        let waiting_pool = pool.clone();
        let waiting = tokio::spawn(async move { waiting_pool.acquire(&endpoint()).await });
        tokio::task::yield_now().await;

        pool.close().await;
        assert!(matches!(waiting.await.unwrap(), Err(StratusError::PoolClosed)));
        assert!(matches!(pool.acquire(&endpoint()).await, Err(StratusError::PoolClosed)));

        pool.release(held).unwrap();
        assert_eq!(pool.stats(&endpoint()).idle, 0);
    }
}
