//! Payload delivery.
//!
//! A [`PayloadSender`] runs on its own task and owns everything needed to deliver payloads: the [`Transport`], the
//! compressor and the retry queue. Payloads arrive one at a time and are delivered sequentially. After every successful
//! delivery, the retry queue is redriven once; when the payload channel closes, the queue is redriven one final time
//! and the transport is closed.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use sluice_io::compression::PayloadCompressor;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    errors::{ErrorReporter, TransportError, WriteError},
    retry::{RetryEntry, RetryQueue, RetryRejection},
    telemetry::WriterTelemetry,
};

mod conn;
pub use self::conn::ConnTransport;

mod http;
pub(crate) use self::http::write_uri;
pub use self::http::HttpTransport;

/// Delivers a serialized payload to an ingestion endpoint.
#[async_trait]
pub trait Transport: Send {
    /// Delivers a payload.
    ///
    /// # Errors
    ///
    /// If the payload could not be delivered, an error is returned.
    async fn deliver(&mut self, payload: Bytes) -> Result<(), TransportError>;

    /// Releases any held resources.
    ///
    /// Must be safe to call more than once, and must never fail.
    async fn close(&mut self) {}
}

/// Compresses payloads before they are handed to a [`Transport`].
#[async_trait]
pub trait Compressor: Send {
    /// Compresses a payload.
    ///
    /// # Errors
    ///
    /// If the payload cannot be compressed, an error is returned and the payload must not be sent.
    async fn compress(&mut self, payload: Bytes) -> io::Result<Bytes>;
}

#[async_trait]
impl Compressor for PayloadCompressor {
    async fn compress(&mut self, payload: Bytes) -> io::Result<Bytes> {
        PayloadCompressor::compress(self, payload).await
    }
}

/// How failures are handled while redriving the retry queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RedriveMode {
    /// Failed entries are requeued, subject to the queue's limits.
    Live,

    /// Failed entries are dropped.
    Shutdown,
}

/// Delivers payloads from a channel, retrying failures.
pub struct PayloadSender<T, C = PayloadCompressor> {
    transport: T,
    compressor: C,
    retries: RetryQueue,
    reporter: ErrorReporter,
    telemetry: WriterTelemetry,
}

impl<T: Transport, C: Compressor> PayloadSender<T, C> {
    /// Creates a new `PayloadSender`.
    pub fn new(
        transport: T, compressor: C, retries: RetryQueue, reporter: ErrorReporter,
        telemetry: WriterTelemetry,
    ) -> Self {
        Self {
            transport,
            compressor,
            retries,
            reporter,
            telemetry,
        }
    }

    /// Delivers payloads until `payloads` is closed and drained, then redrives the retry queue one last time and closes
    /// the transport.
    pub async fn run(mut self, mut payloads: mpsc::Receiver<Bytes>) {
        debug!("Payload sender started.");

        while let Some(payload) = payloads.recv().await {
            self.process(payload).await;
        }

        debug!(pending_retries = self.retries.len(), "Payload channel closed. Redriving before shutdown.");
        self.redrive(RedriveMode::Shutdown).await;
        self.transport.close().await;

        debug!("Payload sender stopped.");
    }

    /// Compresses and delivers a single payload.
    pub async fn process(&mut self, payload: Bytes) {
        if payload.is_empty() {
            return;
        }

        let payload = match self.compressor.compress(payload).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to compress payload. Dropping.");
                self.telemetry.payloads_dropped_compression().increment(1);
                self.reporter.report(WriteError::Compression { source: e });
                return;
            }
        };

        match self.transport.deliver(payload.clone()).await {
            Ok(()) => {
                self.telemetry.payloads_sent().increment(1);
                self.redrive(RedriveMode::Live).await;
            }
            Err(e) => {
                debug!(error = %e, "Failed to deliver payload.");
                self.telemetry.payloads_failed().increment(1);
                self.reporter.report(WriteError::Transport { source: e });
                self.enqueue_retry(RetryEntry::new(payload));
            }
        }
    }

    /// Walks the retry queue once, oldest entry first.
    pub async fn redrive(&mut self, mode: RedriveMode) {
        let pending = self.retries.take_pending();
        if pending.is_empty() {
            return;
        }

        debug!(entries = pending.len(), ?mode, "Redriving retry queue.");
        for mut entry in pending {
            match self.transport.deliver(entry.payload().clone()).await {
                Ok(()) => self.telemetry.payloads_sent().increment(1),
                Err(e) => {
                    self.telemetry.payloads_failed().increment(1);
                    self.reporter.report(WriteError::Transport { source: e });

                    match mode {
                        RedriveMode::Live => {
                            entry.record_failure();
                            self.enqueue_retry(entry);
                        }
                        RedriveMode::Shutdown => {
                            debug!(entry.attempts = entry.attempts(), "Dropping failed retry during shutdown.");
                        }
                    }
                }
            }
        }
    }

    /// Returns the number of payloads waiting to be retried.
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    fn enqueue_retry(&mut self, entry: RetryEntry) {
        match self.retries.push(entry) {
            Ok(()) => {}
            Err(RetryRejection::QueueFull { limit }) => {
                warn!(limit, "Retry queue full. Dropping payload.");
                self.telemetry.retry_queue_rejections().increment(1);
                self.reporter.report(WriteError::RetryQueueFull { limit });
            }
            Err(RetryRejection::Exhausted { attempts }) => {
                warn!(attempts, "Payload exhausted its retries. Dropping.");
                self.telemetry.retries_exhausted().increment(1);
                self.reporter.report(WriteError::RetryExhausted { attempts });
            }
        }
    }
}
