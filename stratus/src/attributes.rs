//! Typed per-request side channel.
//!
//! One [`ExecutionAttributes`] map lives for a whole logical request,
//! including its retries, and is handed to every interceptor hook.

use crate::config::IntegrityConfig;
use crate::integrity::{DigestSlot, OperationKind};
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;

/// A typed key into [`ExecutionAttributes`].
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    /// Creates a key. Keys are compared by name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// The key name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> std::fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AttributeKey({})", self.name)
    }
}

/// Digest slot filled by the upload digest filter at end of body.
pub const UPLOAD_DIGEST: AttributeKey<DigestSlot> = AttributeKey::new("stratus.upload_digest");

/// Per-request integrity settings overriding the client configuration.
pub const INTEGRITY_CONFIG: AttributeKey<IntegrityConfig> =
    AttributeKey::new("stratus.integrity_config");

/// Set when a trailing checksum was requested for the current attempt.
pub const TRAILING_CHECKSUM_REQUESTED: AttributeKey<bool> =
    AttributeKey::new("stratus.trailing_checksum_requested");

/// How the integrity interceptor should treat this operation.
pub const OPERATION_KIND: AttributeKey<OperationKind> = AttributeKey::new("stratus.operation_kind");

/// Heterogeneous map keyed by [`AttributeKey`].
#[derive(Default)]
pub struct ExecutionAttributes {
    values: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl ExecutionAttributes {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value, replacing any previous one for the key.
    pub fn put<T: Send + Sync + 'static>(&mut self, key: &AttributeKey<T>, value: T) {
        self.values.insert(key.name, Box::new(value));
    }

    /// Builder-style [`put`](Self::put).
    #[must_use]
    pub fn with<T: Send + Sync + 'static>(mut self, key: &AttributeKey<T>, value: T) -> Self {
        self.put(key, value);
        self
    }

    /// Returns the value for the key.
    #[must_use]
    pub fn get<T: 'static>(&self, key: &AttributeKey<T>) -> Option<&T> {
        self.values.get(key.name).and_then(|value| value.downcast_ref())
    }

    /// Removes and returns the value for the key.
    pub fn remove<T: 'static>(&mut self, key: &AttributeKey<T>) -> Option<T> {
        let value = self.values.remove(key.name)?;
        value.downcast().ok().map(|boxed| *boxed)
    }

    /// Returns true if a value is stored under the key.
    #[must_use]
    pub fn contains<T>(&self, key: &AttributeKey<T>) -> bool {
        self.values.contains_key(key.name)
    }

    /// Number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Debug for ExecutionAttributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("ExecutionAttributes").field("keys", &keys).finish()
    }
}
