//! Client configuration.

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use http::Uri;
use serde::Deserialize;
use sluice_io::compression::CompressionScheme;

use crate::errors::ConfigurationError;

const fn default_batch_size() -> usize {
    1000
}

const fn default_flush_interval_ms() -> u64 {
    1000
}

const fn default_max_retries() -> usize {
    3
}

const fn default_retry_buffer_limit() -> usize {
    100
}

const fn default_buffer_capacity() -> usize {
    1024
}

const fn default_error_channel_capacity() -> usize {
    64
}

const fn default_request_timeout_secs() -> u64 {
    30
}

const fn default_sync_address_interval_secs() -> u64 {
    60
}

const fn default_sync_address_timeout_secs() -> u64 {
    5
}

const fn default_dial_timeout_secs() -> u64 {
    1
}

const fn default_retry_limit() -> usize {
    2
}

const fn default_database_limit() -> usize {
    30
}

/// Converts `duration` to whole seconds, rounding any fraction up.
fn whole_secs_rounded_up(duration: Duration) -> u64 {
    duration.as_secs().saturating_add(u64::from(duration.subsec_nanos() > 0))
}

/// Payload compression.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Payloads are sent as-is.
    None,

    /// Payloads are gzip-compressed.
    #[default]
    Gzip,
}

impl Compression {
    pub(crate) fn scheme(self) -> CompressionScheme {
        match self {
            Self::None => CompressionScheme::noop(),
            Self::Gzip => CompressionScheme::gzip_default(),
        }
    }
}

/// TLS configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TlsConfiguration {
    /// Path to a PEM file with the root certificates used to verify the broker.
    ///
    /// Defaults to the platform's root certificates.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

/// Client configuration.
///
/// Fixed once a client is built. Every field except `broker_url` has a default, so a configuration can be deserialized
/// from a document that only names the broker.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfiguration {
    /// Base URL of the broker, such as `http://broker:9000`.
    pub broker_url: String,

    /// Number of points that triggers a flush.
    ///
    /// Defaults to 1000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time between flushes, in milliseconds.
    ///
    /// Defaults to 1000.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Payload compression for HTTP writes.
    ///
    /// Defaults to gzip.
    #[serde(default)]
    pub compression: Compression,

    /// Tags added to every point. Tags set on a point take precedence.
    #[serde(default)]
    pub default_tags: BTreeMap<String, String>,

    /// Maximum number of retries for a failed payload.
    ///
    /// Defaults to 3.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Maximum number of payloads held for retry.
    ///
    /// Defaults to 100.
    #[serde(default = "default_retry_buffer_limit")]
    pub retry_buffer_limit: usize,

    /// Maximum number of points waiting to be batched.
    ///
    /// Defaults to 1024.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Maximum number of unread error notifications.
    ///
    /// Defaults to 64.
    #[serde(default = "default_error_channel_capacity")]
    pub error_channel_capacity: usize,

    /// Timeout for each HTTP write request, in seconds.
    ///
    /// Defaults to 30.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Interval between ingestion node discovery polls, in seconds.
    ///
    /// Defaults to 60.
    #[serde(default = "default_sync_address_interval_secs")]
    pub sync_address_interval_secs: u64,

    /// Timeout for each discovery poll, in seconds.
    ///
    /// Defaults to 5.
    #[serde(default = "default_sync_address_timeout_secs")]
    pub sync_address_timeout_secs: u64,

    /// Timeout for connecting to an ingestion node, in seconds.
    ///
    /// Defaults to 1.
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// Number of connect/write rounds per stream send.
    ///
    /// Defaults to 2.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: usize,

    /// Maximum number of distinct databases a client hands out writers for.
    ///
    /// Defaults to 30.
    #[serde(default = "default_database_limit")]
    pub database_limit: usize,

    /// TLS settings for connections to the broker.
    #[serde(default)]
    pub tls: TlsConfiguration,
}

impl ClientConfiguration {
    /// Creates a configuration for the given broker with every other setting at its default.
    pub fn new<S: Into<String>>(broker_url: S) -> Self {
        Self {
            broker_url: broker_url.into(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            compression: Compression::default(),
            default_tags: BTreeMap::new(),
            max_retries: default_max_retries(),
            retry_buffer_limit: default_retry_buffer_limit(),
            buffer_capacity: default_buffer_capacity(),
            error_channel_capacity: default_error_channel_capacity(),
            request_timeout_secs: default_request_timeout_secs(),
            sync_address_interval_secs: default_sync_address_interval_secs(),
            sync_address_timeout_secs: default_sync_address_timeout_secs(),
            dial_timeout_secs: default_dial_timeout_secs(),
            retry_limit: default_retry_limit(),
            database_limit: default_database_limit(),
            tls: TlsConfiguration::default(),
        }
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the payload compression.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Adds a default tag.
    pub fn with_default_tag<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.default_tags.insert(key.into(), value.into());
        self
    }

    /// Sets the maximum number of retries per payload.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the maximum number of payloads held for retry.
    pub fn with_retry_buffer_limit(mut self, limit: usize) -> Self {
        self.retry_buffer_limit = limit;
        self
    }

    /// Sets the point buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Sets the error channel capacity.
    pub fn with_error_channel_capacity(mut self, capacity: usize) -> Self {
        self.error_channel_capacity = capacity;
        self
    }

    /// Sets the discovery poll interval, rounded up to whole seconds.
    pub fn with_sync_address_interval(mut self, interval: Duration) -> Self {
        self.sync_address_interval_secs = whole_secs_rounded_up(interval);
        self
    }

    /// Sets the connect timeout for ingestion nodes, rounded up to whole seconds.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout_secs = whole_secs_rounded_up(timeout);
        self
    }

    /// Sets the number of connect/write rounds per stream send.
    pub fn with_retry_limit(mut self, retry_limit: usize) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Sets the maximum number of distinct databases per client.
    pub fn with_database_limit(mut self, limit: usize) -> Self {
        self.database_limit = limit;
        self
    }

    /// Sets the path to a PEM file with root certificates for the broker.
    pub fn with_ca_cert_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.tls.ca_cert_path = Some(path.into());
        self
    }

    /// Returns the flush interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Returns the HTTP write request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Returns the discovery poll interval.
    pub fn sync_address_interval(&self) -> Duration {
        Duration::from_secs(self.sync_address_interval_secs)
    }

    /// Returns the discovery poll timeout.
    pub fn sync_address_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_address_timeout_secs)
    }

    /// Returns the connect timeout for ingestion nodes.
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Returns the broker URL without any trailing slash.
    pub(crate) fn broker_base(&self) -> &str {
        self.broker_url.trim_end_matches('/')
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// If the broker URL is not an absolute `http` or `https` URL, or a size, interval or limit is zero where that
    /// makes no sense, an error is returned.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid_url = |reason: &str| ConfigurationError::InvalidBrokerUrl {
            url: self.broker_url.clone(),
            reason: reason.to_string(),
        };

        if self.broker_url.trim().is_empty() {
            return Err(invalid_url("broker URL is required"));
        }
        let uri = self
            .broker_url
            .parse::<Uri>()
            .map_err(|e| invalid_url(&e.to_string()))?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            _ => return Err(invalid_url("scheme must be http or https")),
        }
        if uri.host().is_none() {
            return Err(invalid_url("host is required"));
        }

        let checks: [(&'static str, bool); 10] = [
            ("batch_size", self.batch_size > 0),
            ("flush_interval_ms", self.flush_interval_ms > 0),
            ("buffer_capacity", self.buffer_capacity > 0),
            ("error_channel_capacity", self.error_channel_capacity > 0),
            ("request_timeout_secs", self.request_timeout_secs > 0),
            ("sync_address_interval_secs", self.sync_address_interval_secs > 0),
            ("sync_address_timeout_secs", self.sync_address_timeout_secs > 0),
            ("dial_timeout_secs", self.dial_timeout_secs > 0),
            ("retry_limit", self.retry_limit > 0),
            ("database_limit", self.database_limit > 0),
        ];
        for (setting, ok) in checks {
            if !ok {
                return Err(ConfigurationError::InvalidSetting {
                    setting,
                    reason: "must be greater than zero",
                });
            }
        }
        Ok(())
    }
}
