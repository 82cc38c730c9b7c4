//! Error types.
//!
//! Construction-time problems surface synchronously as [`ConfigurationError`]. Everything that goes wrong after a
//! writer is running is reported as a [`WriteError`] on the writer's error channel, which is best-effort: when the
//! consumer falls behind, notifications are dropped rather than stalling the pipeline.

use std::{io, sync::Arc, time::Duration};

use arc_swap::ArcSwapOption;
use http::StatusCode;
use sluice_error::GenericError;
use sluice_io::{framing::FramingError, net::client::http::HttpClientError};
use snafu::Snafu;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::discovery::Endpoint;

/// Boxed error used to carry generic bootstrap failures as a typed error source.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum ConfigurationError {
    /// The broker URL is missing or malformed.
    #[snafu(display("invalid broker URL '{}': {}", url, reason))]
    InvalidBrokerUrl {
        /// The offending URL.
        url: String,

        /// Why it was rejected.
        reason: String,
    },

    /// A setting has a value outside of its allowed range.
    #[snafu(display("invalid value for '{}': {}", setting, reason))]
    InvalidSetting {
        /// Setting name.
        setting: &'static str,

        /// Why it was rejected.
        reason: &'static str,
    },

    /// The database name cannot be used to address the write endpoint.
    #[snafu(display("invalid database name '{}'", database))]
    InvalidDatabase {
        /// The offending database name.
        database: String,
    },

    /// The HTTP client could not be built.
    #[snafu(display("failed to build HTTP client: {}", source))]
    HttpClient {
        /// Underlying error.
        #[snafu(source(from(GenericError, Into::into)))]
        source: BoxedError,
    },
}

/// Error returned when a client cannot hand out a writer.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum ClientError {
    /// The writer settings are invalid.
    #[snafu(display("{}", source))]
    Configuration {
        /// Underlying error.
        source: ConfigurationError,
    },

    /// Handing out a writer for another database would exceed the configured limit.
    #[snafu(display("number of databases exceeds the limit of {}", limit))]
    TooManyDatabases {
        /// Configured database limit.
        limit: usize,
    },

    /// The client is closed.
    #[snafu(display("client is closed"))]
    ClientClosed,
}

/// Point encoding error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum EncodeError {
    /// A tag has an empty key.
    #[snafu(display("tag key must not be empty"))]
    EmptyTagKey,

    /// A tag has an empty value.
    #[snafu(display("tag '{}' has an empty value", key))]
    EmptyTagValue {
        /// Tag key.
        key: String,
    },

    /// A field value is NaN or infinite.
    #[snafu(display("field '{}' has a non-finite value", field))]
    NonFiniteValue {
        /// Field name.
        field: String,
    },

    /// A histogram is malformed.
    #[snafu(display("histogram field '{}' is malformed: {}", field, reason))]
    MalformedHistogram {
        /// Field name.
        field: String,

        /// What is wrong with it.
        reason: &'static str,
    },

    /// A serialized batch could not be decoded.
    #[snafu(display("failed to decode batch: {}", source))]
    Decode {
        /// Underlying error.
        source: prost::DecodeError,
    },

    /// A decoded record does not describe a valid point.
    #[snafu(display("malformed record: {}", reason))]
    MalformedRecord {
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Transport error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum TransportError {
    /// The write request could not be built.
    #[snafu(display("failed to build request: {}", source))]
    BuildRequest {
        /// Underlying error.
        source: http::Error,
    },

    /// The request could not be completed.
    #[snafu(display("{}", source))]
    Http {
        /// Underlying error.
        source: HttpClientError,
    },

    /// The server answered with a non-success status.
    #[snafu(display("server responded with {}: {}", status, body))]
    Status {
        /// Response status.
        status: StatusCode,

        /// Response body, used as the error detail.
        body: String,
    },

    /// No ingestion node is currently known.
    #[snafu(display("no available node"))]
    NoAvailableNode,

    /// Connecting to an ingestion node failed.
    #[snafu(display("failed to connect to {}: {}", endpoint, source))]
    Connect {
        /// Target endpoint.
        endpoint: Endpoint,

        /// Underlying error.
        source: io::Error,
    },

    /// Connecting to an ingestion node did not complete in time.
    #[snafu(display("timed out connecting to {} after {:?}", endpoint, timeout))]
    ConnectTimedOut {
        /// Target endpoint.
        endpoint: Endpoint,

        /// Dial timeout.
        timeout: Duration,
    },

    /// Writing to an ingestion node failed.
    #[snafu(display("failed to write to {}: {}", endpoint, source))]
    Write {
        /// Target endpoint.
        endpoint: Endpoint,

        /// Underlying error.
        source: io::Error,
    },

    /// The payload could not be framed.
    #[snafu(display("{}", source))]
    Framing {
        /// Underlying error.
        source: FramingError,
    },

    /// Every round was spent connecting, leaving none to write the payload.
    #[snafu(display("payload not written within {} attempt(s)", attempts))]
    Unwritten {
        /// Number of attempts made.
        attempts: usize,
    },

    /// Every send attempt failed.
    #[snafu(display("send failed after {} attempt(s): {}", attempts, last))]
    AttemptsExhausted {
        /// Number of attempts made.
        attempts: usize,

        /// The last failure observed.
        last: Box<TransportError>,
    },
}

/// Broad classification of a [`WriteError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// A point was malformed and dropped.
    Validation,

    /// Work was dropped because a bounded buffer was full.
    Backpressure,

    /// Delivery failed at the network level.
    Transport,

    /// A payload was dropped after its last retry.
    RetryExhausted,
}

/// An asynchronous failure reported by a running writer.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum WriteError {
    /// A point failed to encode and was skipped.
    #[snafu(display("dropped point '{}': {}", metric, source))]
    InvalidPoint {
        /// Metric name of the dropped point.
        metric: String,

        /// Underlying error.
        source: EncodeError,
    },

    /// The point buffer was full and the point was dropped.
    #[snafu(display("point buffer full (capacity {}), dropping point", capacity))]
    BufferFull {
        /// Buffer capacity.
        capacity: usize,
    },

    /// The retry queue was full and the failed payload was dropped.
    #[snafu(display("too many retry requests (limit {}), dropping payload", limit))]
    RetryQueueFull {
        /// Retry queue limit.
        limit: usize,
    },

    /// A payload could not be delivered.
    #[snafu(display("failed to deliver payload: {}", source))]
    Transport {
        /// Underlying error.
        source: TransportError,
    },

    /// A payload could not be compressed and was dropped.
    #[snafu(display("failed to compress payload: {}", source))]
    Compression {
        /// Underlying error.
        source: io::Error,
    },

    /// A payload was dropped after its final retry failed.
    #[snafu(display("max retry attempts exceeded ({}), dropping payload", attempts))]
    RetryExhausted {
        /// Retries performed.
        attempts: usize,
    },

    /// The writer was closed and no longer accepts points.
    #[snafu(display("writer is closed"))]
    WriterClosed,
}

impl WriteError {
    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPoint { .. } => ErrorKind::Validation,
            Self::BufferFull { .. } | Self::RetryQueueFull { .. } | Self::WriterClosed => ErrorKind::Backpressure,
            Self::Transport { .. } | Self::Compression { .. } => ErrorKind::Transport,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
        }
    }
}

/// Reports asynchronous failures on a bounded channel without ever blocking.
///
/// All clones share the same underlying channel. Once [`close`][Self::close] is called, the channel is closed for
/// every clone, and further reports are discarded.
#[derive(Clone)]
pub struct ErrorReporter {
    tx: Arc<ArcSwapOption<mpsc::Sender<WriteError>>>,
}

impl ErrorReporter {
    /// Creates a reporter and its receiving half, holding at most `capacity` unread notifications.
    pub fn new(capacity: usize) -> (Self, ErrorReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let reporter = Self {
            tx: Arc::new(ArcSwapOption::from_pointee(tx)),
        };
        (reporter, ErrorReceiver { rx })
    }

    /// Reports an error.
    ///
    /// If the channel is full or closed, the error is dropped.
    pub fn report(&self, error: WriteError) {
        let guard = self.tx.load();
        let Some(tx) = &*guard else {
            debug!(%error, "Error channel closed. Dropping notification.");
            return;
        };

        match tx.try_send(error) {
            Ok(()) => {}
            Err(TrySendError::Full(error)) => debug!(%error, "Error channel full. Dropping notification."),
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Closes the channel.
    ///
    /// Calling this more than once has no additional effect.
    pub fn close(&self) {
        self.tx.store(None);
    }
}

/// Receiving half of a writer's error channel.
pub struct ErrorReceiver {
    rx: mpsc::Receiver<WriteError>,
}

impl ErrorReceiver {
    /// Waits for the next error.
    ///
    /// Returns `None` once the writer has been closed and every pending notification has been received.
    pub async fn recv(&mut self) -> Option<WriteError> {
        self.rx.recv().await
    }

    /// Returns the next error if one is immediately available.
    pub fn try_recv(&mut self) -> Option<WriteError> {
        self.rx.try_recv().ok()
    }
}
