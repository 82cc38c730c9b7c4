//! Retry queue for failed payloads.

use std::collections::VecDeque;

use bytes::Bytes;
use snafu::Snafu;
use tracing::debug;

/// A payload awaiting redelivery.
#[derive(Clone, Debug)]
pub struct RetryEntry {
    payload: Bytes,
    attempts: usize,
}

impl RetryEntry {
    /// Creates an entry for a payload whose first delivery just failed.
    pub fn new(payload: Bytes) -> Self {
        Self { payload, attempts: 0 }
    }

    /// Returns the payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Returns the number of retries that have failed so far.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Records a failed retry.
    pub fn record_failure(&mut self) {
        self.attempts += 1;
    }
}

/// Reason an entry was not accepted by the [`RetryQueue`].
#[derive(Debug, Eq, PartialEq, Snafu)]
pub enum RetryRejection {
    /// The queue already holds its limit of entries.
    #[snafu(display("too many retry requests (limit {})", limit))]
    QueueFull {
        /// Queue limit.
        limit: usize,
    },

    /// The entry has used up its retries.
    #[snafu(display("max retry attempts exceeded ({})", attempts))]
    Exhausted {
        /// Retries performed.
        attempts: usize,
    },
}

/// A bounded FIFO of payloads awaiting redelivery.
///
/// New entries are rejected, rather than older ones evicted, when the queue is full.
pub struct RetryQueue {
    pending: VecDeque<RetryEntry>,
    max_retries: usize,
    limit: usize,
}

impl RetryQueue {
    /// Creates a new `RetryQueue` holding at most `limit` entries, each retried at most `max_retries` times.
    pub fn new(max_retries: usize, limit: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            max_retries,
            limit,
        }
    }

    /// Returns the number of pending entries.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if there are no pending entries.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Enqueues an entry.
    ///
    /// # Errors
    ///
    /// If the entry has already been retried `max_retries` times, or the queue is full, the entry is dropped and the
    /// reason is returned.
    pub fn push(&mut self, entry: RetryEntry) -> Result<(), RetryRejection> {
        if entry.attempts >= self.max_retries {
            return Err(RetryRejection::Exhausted {
                attempts: entry.attempts,
            });
        }
        if self.pending.len() >= self.limit {
            return Err(RetryRejection::QueueFull { limit: self.limit });
        }

        debug!(
            entry.len = entry.payload.len(),
            entry.attempts = entry.attempts,
            "Enqueued payload for retry."
        );
        self.pending.push_back(entry);
        Ok(())
    }

    /// Takes every pending entry, oldest first, leaving the queue empty.
    ///
    /// Entries that fail again are pushed back by the caller, so a single redrive pass visits each entry once.
    pub fn take_pending(&mut self) -> VecDeque<RetryEntry> {
        std::mem::take(&mut self.pending)
    }
}
