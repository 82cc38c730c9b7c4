//! Size- and time-triggered batching.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    sync::mpsc,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    buffer::PointBuffer,
    encoding::BatchEncoder,
    errors::{ErrorReporter, WriteError},
    telemetry::WriterTelemetry,
};

/// Shortest flush interval; shorter intervals are raised to it.
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Drains points from a [`PointBuffer`] and turns them into batch payloads.
///
/// Points are encoded as soon as they are drained. A batch is flushed when it reaches `batch_size` points, or when the
/// flush interval elapses since the previous flush, whichever comes first. Flushed payloads are handed to the sending
/// task over a bounded channel.
///
/// When `shutdown` fires, the buffer is drained one last time, any partial batch is flushed, and the payload channel is
/// closed by dropping its sender.
pub struct Batcher {
    buffer: Arc<PointBuffer>,
    encoder: BatchEncoder,
    batch_size: usize,
    flush_interval: Duration,
    payloads: mpsc::Sender<Bytes>,
    reporter: ErrorReporter,
    telemetry: WriterTelemetry,
    shutdown: CancellationToken,
}

impl Batcher {
    /// Creates a new `Batcher`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buffer: Arc<PointBuffer>, encoder: BatchEncoder, batch_size: usize, flush_interval: Duration,
        payloads: mpsc::Sender<Bytes>, reporter: ErrorReporter, telemetry: WriterTelemetry,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            buffer,
            encoder,
            batch_size: batch_size.max(1),
            flush_interval: flush_interval.max(MIN_FLUSH_INTERVAL),
            payloads,
            reporter,
            telemetry,
            shutdown,
        }
    }

    /// Runs the batching loop until shutdown.
    pub async fn run(mut self) {
        let buffer = Arc::clone(&self.buffer);
        let shutdown = self.shutdown.clone();

        let mut flush_timer = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(batch_size = self.batch_size, flush_interval = ?self.flush_interval, "Batcher started.");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = buffer.notified() => {
                    if self.drain().await {
                        flush_timer.reset();
                    }
                },
                _ = flush_timer.tick() => {
                    // Points can be queued without a pending wakeup if they arrived mid-drain.
                    self.drain().await;
                    self.flush().await;
                },
            }
        }

        buffer.offers_settled().await;
        self.drain().await;
        self.flush().await;

        debug!("Batcher stopped.");
    }

    /// Encodes every queued point, flushing whenever the batch fills up.
    ///
    /// Returns `true` if at least one size-triggered flush happened.
    async fn drain(&mut self) -> bool {
        let buffer = Arc::clone(&self.buffer);
        let mut flushed = false;

        for point in buffer.drain() {
            if let Err(e) = self.encoder.encode(&point) {
                debug!(metric = point.metric_name(), error = %e, "Dropping point that failed to encode.");
                self.telemetry.points_dropped_invalid().increment(1);
                self.reporter.report(WriteError::InvalidPoint {
                    metric: point.metric_name().to_string(),
                    source: e,
                });
                continue;
            }

            if self.encoder.len() >= self.batch_size {
                self.flush().await;
                flushed = true;
            }
        }

        flushed
    }

    /// Seals the current batch and hands it to the sending task.
    ///
    /// Does nothing if the batch is empty.
    async fn flush(&mut self) {
        let points = self.encoder.len();
        let Some(payload) = self.encoder.seal() else {
            return;
        };

        debug!(points, bytes = payload.len(), "Flushing batch.");
        if self.payloads.send(payload).await.is_err() {
            warn!(points, "Sending task is gone. Dropping batch.");
        }
    }
}
