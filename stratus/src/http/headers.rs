//! Ordered, case-insensitive, multi-valued header map.

use serde::{Deserialize, Serialize};

/// Header names used across the crate.
pub mod names {
    /// `Content-Length`.
    pub const CONTENT_LENGTH: &str = "Content-Length";
    /// `Content-Type`.
    pub const CONTENT_TYPE: &str = "Content-Type";
    /// `Content-MD5`.
    pub const CONTENT_MD5: &str = "Content-MD5";
    /// `Connection`.
    pub const CONNECTION: &str = "Connection";
    /// `ETag`.
    pub const ETAG: &str = "ETag";
    /// `Host`.
    pub const HOST: &str = "Host";
    /// `Range`.
    pub const RANGE: &str = "Range";
    /// `Transfer-Encoding`.
    pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
}

/// An ordered header collection.
///
/// Entries keep insertion order; lookups ignore ASCII case; a name may
/// appear several times.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value, keeping any existing values for the name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces all values for the name with a single value.
    ///
    /// The new entry takes the position of the first existing one.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(index) => {
                self.entries[index] = (name.clone(), value);
                let mut seen = false;
                self.entries.retain(|(n, _)| {
                    if n.eq_ignore_ascii_case(&name) {
                        let keep = !seen;
                        seen = true;
                        keep
                    } else {
                        true
                    }
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Removes all values for the name, returning them in order.
    pub fn remove(&mut self, name: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.entries.retain(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                removed.push(v.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Returns the first value for the name.
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns all values for the name, in order.
    #[must_use]
    pub fn all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Returns true if the name is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Returns true if the first value for the name equals `value`, ignoring case.
    #[must_use]
    pub fn first_matches(&self, name: &str, value: &str) -> bool {
        self.first(name).is_some_and(|v| v.trim().eq_ignore_ascii_case(value))
    }

    /// Parses the `Content-Length` header.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.first(names::CONTENT_LENGTH).and_then(|v| v.trim().parse().ok())
    }

    /// Iterates over all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}
