//! String header map carried on every message envelope and request context.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Well-known header keys.
pub mod headers {
    pub const TRACE_ID: &str = "Trace-Id";
    /// W3C trace context header, accepted on inbound messages.
    pub const TRACEPARENT: &str = "traceparent";
    pub const EVENT_ID: &str = "Event-Id";
    pub const TIMESTAMP: &str = "Timestamp";
    pub const SOURCE: &str = "Source";
    pub const SCHEMA_VERSION: &str = "Schema-Version";
    pub const PARTITION_KEY: &str = "Pkey";
    pub const TOPIC: &str = "Topic";

    pub const ERROR: &str = "x-error";
    pub const ORIGIN_TOPIC: &str = "x-origin-topic";
    pub const ORIGIN_TIMESTAMP: &str = "x-origin-timestamp";
}

/// Ordered string-to-string header map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Looks a header up ignoring ASCII case. Brokers and proxies are not
    /// consistent about header casing.
    pub fn get_ignore_case(&self, key: &str) -> Option<&str> {
        self.get(key).or_else(|| {
            self.0
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.as_str())
        })
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for Metadata {
    type Item = (String, String);
    type IntoIter = std::collections::btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
