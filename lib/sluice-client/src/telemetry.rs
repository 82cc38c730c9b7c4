//! Writer telemetry.

use metrics::{counter, Counter};

/// Counters tracking a single writer's pipeline.
///
/// Every counter carries a `database` label. When no `metrics` recorder is installed, the counters are no-ops.
#[derive(Clone)]
pub struct WriterTelemetry {
    points_accepted: Counter,
    points_dropped_full: Counter,
    points_dropped_invalid: Counter,
    payloads_sent: Counter,
    payloads_failed: Counter,
    payloads_dropped_compression: Counter,
    retry_queue_rejections: Counter,
    retries_exhausted: Counter,
}

impl WriterTelemetry {
    /// Registers the counters for the given database.
    pub fn new(database: &str) -> Self {
        let database = database.to_string();
        Self {
            points_accepted: counter!("sluice_points_accepted_total", "database" => database.clone()),
            points_dropped_full: counter!(
                "sluice_points_dropped_total",
                "database" => database.clone(),
                "reason" => "buffer_full"
            ),
            points_dropped_invalid: counter!(
                "sluice_points_dropped_total",
                "database" => database.clone(),
                "reason" => "invalid"
            ),
            payloads_sent: counter!("sluice_payloads_sent_total", "database" => database.clone()),
            payloads_failed: counter!("sluice_payloads_failed_total", "database" => database.clone()),
            payloads_dropped_compression: counter!(
                "sluice_payloads_dropped_total",
                "database" => database.clone(),
                "reason" => "compression"
            ),
            retry_queue_rejections: counter!(
                "sluice_payloads_dropped_total",
                "database" => database.clone(),
                "reason" => "retry_queue_full"
            ),
            retries_exhausted: counter!(
                "sluice_payloads_dropped_total",
                "database" => database,
                "reason" => "retries_exhausted"
            ),
        }
    }

    /// Returns a reference to the "points accepted" counter.
    pub fn points_accepted(&self) -> &Counter {
        &self.points_accepted
    }

    /// Returns a reference to the "points dropped (buffer full)" counter.
    pub fn points_dropped_full(&self) -> &Counter {
        &self.points_dropped_full
    }

    /// Returns a reference to the "points dropped (invalid)" counter.
    pub fn points_dropped_invalid(&self) -> &Counter {
        &self.points_dropped_invalid
    }

    /// Returns a reference to the "payloads sent" counter.
    pub fn payloads_sent(&self) -> &Counter {
        &self.payloads_sent
    }

    /// Returns a reference to the "payloads failed" counter.
    ///
    /// Incremented once per failed delivery attempt, including retries.
    pub fn payloads_failed(&self) -> &Counter {
        &self.payloads_failed
    }

    /// Returns a reference to the "payloads dropped (compression)" counter.
    pub fn payloads_dropped_compression(&self) -> &Counter {
        &self.payloads_dropped_compression
    }

    /// Returns a reference to the "payloads dropped (retry queue full)" counter.
    pub fn retry_queue_rejections(&self) -> &Counter {
        &self.retry_queue_rejections
    }

    /// Returns a reference to the "payloads dropped (retries exhausted)" counter.
    pub fn retries_exhausted(&self) -> &Counter {
        &self.retries_exhausted
    }
}
