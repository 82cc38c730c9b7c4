//! Per-database writer handle.

use std::sync::{Arc, Mutex};

use sluice_io::compression::{CompressionScheme, PayloadCompressor};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span};

use crate::{
    batcher::Batcher,
    buffer::{Offer, PointBuffer},
    config::ClientConfiguration,
    encoding::BatchEncoder,
    errors::{ErrorReceiver, ErrorReporter, WriteError},
    model::Point,
    retry::RetryQueue,
    sender::{PayloadSender, Transport},
    task::spawn_traced_named,
    telemetry::WriterTelemetry,
};

/// Number of sealed batches that may wait for the sending task before the batcher blocks.
const PAYLOAD_CHANNEL_CAPACITY: usize = 1;

struct WriterTasks {
    shutdown: CancellationToken,
    batcher: JoinHandle<()>,
    sender: JoinHandle<()>,
}

/// Asynchronous writer for a single database.
///
/// Points are accepted without blocking and written in the background by two tasks: one batching points into payloads
/// and one delivering those payloads. Failures never surface from [`add_point`][Self::add_point]; they are reported on
/// the channel returned by [`errors`][Self::errors].
///
/// Call [`close`][Self::close] to flush pending points before the writer goes away. Dropping an unclosed writer still
/// stops its tasks, but does not wait for them.
pub struct Writer {
    database: String,
    buffer: Arc<PointBuffer>,
    reporter: ErrorReporter,
    errors: Mutex<Option<ErrorReceiver>>,
    telemetry: WriterTelemetry,
    tasks: tokio::sync::Mutex<Option<WriterTasks>>,
}

impl Writer {
    /// Starts a writer delivering through `transport`.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn<T>(
        database: &str, config: &ClientConfiguration, transport: T, compression: CompressionScheme,
    ) -> Self
    where
        T: Transport + 'static,
    {
        let span = info_span!("writer", database);
        let _entered = span.enter();

        let buffer = Arc::new(PointBuffer::new(config.buffer_capacity));
        let (reporter, errors) = ErrorReporter::new(config.error_channel_capacity);
        let telemetry = WriterTelemetry::new(database);
        let shutdown = CancellationToken::new();
        let (payloads_tx, payloads_rx) = mpsc::channel(PAYLOAD_CHANNEL_CAPACITY);

        let batcher = Batcher::new(
            Arc::clone(&buffer),
            BatchEncoder::new(database, config.default_tags.clone()),
            config.batch_size,
            config.flush_interval(),
            payloads_tx,
            reporter.clone(),
            telemetry.clone(),
            shutdown.clone(),
        );
        let sender = PayloadSender::new(
            transport,
            PayloadCompressor::new(compression),
            RetryQueue::new(config.max_retries, config.retry_buffer_limit),
            reporter.clone(),
            telemetry.clone(),
        );

        let tasks = WriterTasks {
            shutdown,
            batcher: spawn_traced_named("writer-batcher", batcher.run()),
            sender: spawn_traced_named("writer-sender", sender.run(payloads_rx)),
        };
        debug!("Writer started.");

        Self {
            database: database.to_string(),
            buffer,
            reporter,
            errors: Mutex::new(Some(errors)),
            telemetry,
            tasks: tokio::sync::Mutex::new(Some(tasks)),
        }
    }

    /// Returns the database this writer writes to.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Adds a point.
    ///
    /// Never blocks. Points without a metric name or without fields are ignored. If the buffer is full, the point is
    /// dropped and a [`WriteError::BufferFull`] is reported.
    pub fn add_point(&self, point: Point) {
        self.offer(point, None);
    }

    /// Adds a point unless `cancel` has already fired, in which case the point is silently discarded.
    pub fn add_point_cancellable(&self, point: Point, cancel: &CancellationToken) {
        self.offer(point, Some(cancel));
    }

    fn offer(&self, point: Point, cancel: Option<&CancellationToken>) {
        if !point.is_valid() {
            return;
        }

        match self.buffer.offer(point, cancel) {
            Offer::Accepted => self.telemetry.points_accepted().increment(1),
            Offer::Cancelled => {}
            Offer::Full => {
                self.telemetry.points_dropped_full().increment(1);
                self.reporter.report(WriteError::BufferFull {
                    capacity: self.buffer.capacity(),
                });
            }
            Offer::Closed => self.reporter.report(WriteError::WriterClosed),
        }
    }

    /// Takes the receiving end of the error channel.
    ///
    /// Only the first call returns the receiver; later calls return `None`. The channel ends once the writer is closed.
    pub fn errors(&self) -> Option<ErrorReceiver> {
        match self.errors.lock() {
            Ok(mut errors) => errors.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Closes the writer.
    ///
    /// New points are rejected immediately. Queued points are batched and flushed, pending payloads are delivered, the
    /// retry queue is redriven one final time, and the error channel is closed. Returns once both background tasks have
    /// finished. Calling this again, concurrently or afterwards, waits for the first close and otherwise does nothing.
    pub async fn close(&self) {
        let mut tasks = self.tasks.lock().await;
        let Some(WriterTasks {
            shutdown,
            batcher,
            sender,
        }) = tasks.take()
        else {
            return;
        };

        debug!(database = %self.database, "Closing writer.");
        self.buffer.close();

        // Batcher first: it flushes what is left and then closes the payload channel, which lets the sender finish.
        shutdown.cancel();
        if let Err(e) = batcher.await {
            error!(database = %self.database, error = %e, "Batcher task failed.");
        }
        if let Err(e) = sender.await {
            error!(database = %self.database, error = %e, "Sender task failed.");
        }

        self.reporter.close();
        info!(database = %self.database, "Writer closed.");
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.get_mut().take() {
            self.buffer.close();
            tasks.shutdown.cancel();
        }
    }
}
