use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::Field;

/// Namespace used for points that do not set one.
pub const DEFAULT_NAMESPACE: &str = "default-ns";

/// A single timestamped measurement.
///
/// A point is only accepted for writing if it has a metric name and at least one field. Tag keys are unique; adding a
/// tag that already exists replaces its value.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    namespace: Option<String>,
    metric_name: String,
    tags: BTreeMap<String, String>,
    timestamp_ms: i64,
    fields: Vec<Field>,
}

impl Point {
    /// Creates a new point for the given metric, timestamped with the current time.
    pub fn new<S: Into<String>>(metric_name: S) -> Self {
        Self {
            namespace: None,
            metric_name: metric_name.into(),
            tags: BTreeMap::new(),
            timestamp_ms: Utc::now().timestamp_millis(),
            fields: Vec::new(),
        }
    }

    /// Sets the namespace.
    pub fn with_namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Adds a tag.
    pub fn with_tag<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Sets the timestamp, in milliseconds since the Unix epoch.
    pub fn with_timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Sets the timestamp.
    pub fn with_timestamp(self, timestamp: DateTime<Utc>) -> Self {
        self.with_timestamp_ms(timestamp.timestamp_millis())
    }

    /// Adds a field.
    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Returns the namespace, if one was set.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Returns the metric name.
    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    /// Returns the tags.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Returns the timestamp, in milliseconds since the Unix epoch.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Returns the fields, in insertion order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Returns `true` if the point has a metric name and at least one field.
    pub fn is_valid(&self) -> bool {
        !self.metric_name.is_empty() && !self.fields.is_empty()
    }
}
