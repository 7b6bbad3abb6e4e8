//! Client configuration.
//!
//! Durations are plain millisecond integers so a configuration file can be
//! validated with a precise error instead of a generic parse failure.

use crate::errors::{ConfigError, ErrorKind, StratusError};
use crate::retry::{BackoffKind, BackoffStrategy, RetryCondition, RetryPolicy, RETRYABLE_STATUS_CODES};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Connection pool settings.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Retry settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Integrity validation settings.
    #[serde(default)]
    pub integrity: IntegrityConfig,
}

impl ClientConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns `StratusError::Configuration` for malformed JSON or invalid values.
    pub fn from_json(json: &str) -> Result<Self, StratusError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::new("json", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.retry.build().map(|_| ())
    }

    /// Sets the pool section.
    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the retry section.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the integrity section.
    #[must_use]
    pub fn with_integrity(mut self, integrity: IntegrityConfig) -> Self {
        self.integrity = integrity;
        self
    }
}

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum concurrent connections per endpoint.
    #[serde(default = "default_max_connections")]
    pub max_connections_per_endpoint: usize,
    /// How long an acquisition may wait, in milliseconds.
    #[serde(default = "default_acquisition_timeout")]
    pub connection_acquisition_timeout_ms: i64,
    /// How long establishing a connection may take, in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: i64,
    /// How long a single socket read may take, in milliseconds.
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout_ms: i64,
    /// Worker threads of an owned event loop.
    #[serde(default = "default_event_loop_threads")]
    pub event_loop_threads: usize,
}

fn default_max_connections() -> usize {
    50
}

fn default_acquisition_timeout() -> i64 {
    10_000
}

fn default_connect_timeout() -> i64 {
    2_000
}

fn default_socket_timeout() -> i64 {
    30_000
}

fn default_event_loop_threads() -> usize {
    2
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_endpoint: default_max_connections(),
            connection_acquisition_timeout_ms: default_acquisition_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            socket_timeout_ms: default_socket_timeout(),
            event_loop_threads: default_event_loop_threads(),
        }
    }
}

impl PoolConfig {
    /// Sets the per-endpoint connection limit.
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections_per_endpoint = max;
        self
    }

    /// Sets the acquisition timeout.
    #[must_use]
    pub fn with_acquisition_timeout_ms(mut self, millis: i64) -> Self {
        self.connection_acquisition_timeout_ms = millis;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub fn with_connect_timeout_ms(mut self, millis: i64) -> Self {
        self.connect_timeout_ms = millis;
        self
    }

    /// Sets the socket timeout.
    #[must_use]
    pub fn with_socket_timeout_ms(mut self, millis: i64) -> Self {
        self.socket_timeout_ms = millis;
        self
    }

    /// Checks limits and timeouts.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for a zero connection limit or a negative timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections_per_endpoint == 0 {
            return Err(ConfigError::new(
                "max_connections_per_endpoint",
                "must be at least 1",
            ));
        }
        for (field, value) in [
            ("connection_acquisition_timeout_ms", self.connection_acquisition_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("socket_timeout_ms", self.socket_timeout_ms),
        ] {
            if value < 0 {
                return Err(ConfigError::negative(field));
            }
        }
        Ok(())
    }

    /// Acquisition timeout.
    #[must_use]
    pub fn acquisition_timeout(&self) -> Duration {
        millis(self.connection_acquisition_timeout_ms)
    }

    /// Connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        millis(self.connect_timeout_ms)
    }

    /// Socket read timeout.
    #[must_use]
    pub fn socket_timeout(&self) -> Duration {
        millis(self.socket_timeout_ms)
    }
}

fn millis(value: i64) -> Duration {
    Duration::from_millis(u64::try_from(value).unwrap_or(0))
}

/// Retry settings, turned into a [`RetryPolicy`] by [`RetryConfig::build`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry budget.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    /// Base backoff delay in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: i64,
    /// Backoff cap in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: i64,
    /// Backoff curve.
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Statuses retried by the default condition.
    #[serde(default = "default_retry_status")]
    pub retry_on_status: Vec<u16>,
    /// Failure kinds retried by the default condition.
    #[serde(default = "default_retry_errors")]
    pub retry_on_errors: Vec<ErrorKind>,
    /// Explicit condition replacing the status and error lists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<RetryCondition>,
}

fn default_max_retries() -> i64 {
    3
}

fn default_base_delay() -> i64 {
    100
}

fn default_max_delay() -> i64 {
    20_000
}

fn default_retry_status() -> Vec<u16> {
    RETRYABLE_STATUS_CODES.to_vec()
}

fn default_retry_errors() -> Vec<ErrorKind> {
    ErrorKind::transient().to_vec()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            backoff: BackoffKind::default(),
            retry_on_status: default_retry_status(),
            retry_on_errors: default_retry_errors(),
            condition: None,
        }
    }
}

impl RetryConfig {
    /// Disables retries.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffKind::None,
            condition: Some(RetryCondition::Never),
            ..Self::default()
        }
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the backoff curve and its delays.
    #[must_use]
    pub fn with_backoff(mut self, kind: BackoffKind, base_delay_ms: i64, max_delay_ms: i64) -> Self {
        self.backoff = kind;
        self.base_delay_ms = base_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Sets an explicit condition.
    #[must_use]
    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Validates and builds the policy.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first negative parameter.
    pub fn build(&self) -> Result<RetryPolicy, ConfigError> {
        let backoff = BackoffStrategy::from_millis(
            self.backoff,
            self.base_delay_ms,
            self.max_delay_ms,
            self.max_retries,
        )?;
        let max_retries = u32::try_from(self.max_retries)
            .map_err(|_| ConfigError::negative("max_retries"))?;
        let condition = self.condition.clone().unwrap_or_else(|| {
            RetryCondition::error_kinds(self.retry_on_errors.clone())
                .or(RetryCondition::status_codes(self.retry_on_status.clone()))
        });
        Ok(RetryPolicy::new(condition, backoff, max_retries))
    }
}

/// Integrity validation switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Verify digests computed by the client against the service's.
    #[serde(default = "default_true")]
    pub client_side_validation: bool,
    /// Send `Content-MD5` so the service can verify uploads.
    #[serde(default = "default_true")]
    pub server_side_validation: bool,
}

fn default_true() -> bool {
    true
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            client_side_validation: true,
            server_side_validation: true,
        }
    }
}

impl IntegrityConfig {
    /// Both directions disabled.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            client_side_validation: false,
            server_side_validation: false,
        }
    }
}
