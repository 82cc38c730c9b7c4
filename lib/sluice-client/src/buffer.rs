//! Bounded point buffer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use tokio::sync::{futures::Notified, Notify};
use tokio_util::sync::CancellationToken;

use crate::model::Point;

/// Outcome of offering a point to a [`PointBuffer`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Offer {
    /// The point was queued.
    Accepted,

    /// The cancellation signal had already fired, so the point was discarded.
    Cancelled,

    /// The buffer was full, so the point was dropped.
    Full,

    /// The buffer is closed and no longer accepts points.
    Closed,
}

/// A bounded, lock-free queue of points.
///
/// Offering never blocks: when the buffer is full the point is dropped and the caller is told so. The consumer is woken
/// through [`notified`][Self::notified] whenever a point is accepted.
///
/// Once the buffer is closed, [`offers_settled`][Self::offers_settled] resolves after every offer that got past the
/// closed check has landed in the queue, so a drain that follows it sees every accepted point.
pub struct PointBuffer {
    queue: ArrayQueue<Point>,
    notify: Notify,
    closed: AtomicBool,
    offers_in_flight: AtomicUsize,
}

impl PointBuffer {
    /// Creates a new buffer holding at most `capacity` points.
    ///
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            offers_in_flight: AtomicUsize::new(0),
        }
    }

    /// Returns the capacity of the buffer.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Returns the number of queued points.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if no points are queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Offers a point to the buffer.
    ///
    /// If `cancel` has already fired, the point is discarded before any other check.
    pub fn offer(&self, point: Point, cancel: Option<&CancellationToken>) -> Offer {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Offer::Cancelled;
        }

        // Registered before the closed check, so `offers_settled` cannot miss an offer that sees the buffer open.
        self.offers_in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = if self.closed.load(Ordering::SeqCst) {
            Offer::Closed
        } else {
            match self.queue.push(point) {
                Ok(()) => Offer::Accepted,
                Err(_) => Offer::Full,
            }
        };
        self.offers_in_flight.fetch_sub(1, Ordering::SeqCst);

        if outcome == Offer::Accepted {
            self.notify.notify_one();
        }
        outcome
    }

    /// Removes and returns the points queued at the time of the call, oldest first.
    ///
    /// Never blocks. Points offered while draining may or may not be included.
    pub fn drain(&self) -> impl Iterator<Item = Point> + '_ {
        let queued = self.queue.len();
        (0..queued).map_while(|_| self.queue.pop())
    }

    /// Waits until a point has been accepted since the last wakeup.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Closes the buffer, rejecting all further offers.
    ///
    /// Points already queued remain available to [`drain`][Self::drain].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Returns `true` if the buffer has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Waits until no offer is between its closed check and its push.
    ///
    /// Only meaningful after [`close`][Self::close]: from then on, no new offer can be accepted, so once this resolves
    /// the queue holds every accepted point.
    pub async fn offers_settled(&self) {
        while self.offers_in_flight.load(Ordering::SeqCst) != 0 {
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio_test::{assert_pending, assert_ready, task::spawn};

    use super::*;
    use crate::model::Field;

    fn point(name: &str) -> Point {
        Point::new(name).with_field(Field::sum("v", 1.0))
    }

    #[test]
    fn full_buffer_drops_newest() {
        let buffer = PointBuffer::new(1);
        assert_eq!(buffer.offer(point("first"), None), Offer::Accepted);
        assert_eq!(buffer.offer(point("second"), None), Offer::Full);

        let drained = buffer.drain().collect::<Vec<_>>();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].metric_name(), "first");
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_preserves_order() {
        let buffer = PointBuffer::new(8);
        for name in ["a", "b", "c"] {
            buffer.offer(point(name), None);
        }

        let names = buffer.drain().map(|p| p.metric_name().to_string()).collect::<Vec<_>>();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(buffer.drain().count(), 0);
    }

    #[test]
    fn cancelled_offer_is_discarded() {
        let buffer = PointBuffer::new(4);
        let token = CancellationToken::new();
        token.cancel();

        assert_eq!(buffer.offer(point("p"), Some(&token)), Offer::Cancelled);
        assert!(buffer.is_empty());

        let live = CancellationToken::new();
        assert_eq!(buffer.offer(point("p"), Some(&live)), Offer::Accepted);
    }

    #[test]
    fn closed_buffer_rejects_but_keeps_queued_points() {
        let buffer = PointBuffer::new(4);
        buffer.offer(point("before"), None);
        buffer.close();

        assert!(buffer.is_closed());
        assert_eq!(buffer.offer(point("after"), None), Offer::Closed);
        assert_eq!(buffer.drain().count(), 1);
    }

    #[test]
    fn accepted_offer_wakes_consumer() {
        let buffer = PointBuffer::new(4);

        let mut notified = spawn(buffer.notified());
        assert_pending!(notified.poll());

        buffer.offer(point("p"), None);
        assert!(notified.is_woken());
        assert_ready!(notified.poll());
    }

    #[tokio::test]
    async fn close_settles_before_final_drain() {
        let buffer = Arc::new(PointBuffer::new(10_000));
        let producers = (0..4)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    let mut accepted = 0usize;
                    loop {
                        match buffer.offer(point("p"), None) {
                            Offer::Accepted => accepted += 1,
                            Offer::Full => std::thread::yield_now(),
                            Offer::Closed => return accepted,
                            Offer::Cancelled => unreachable!("no cancellation token given"),
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        std::thread::sleep(Duration::from_millis(5));
        buffer.close();
        buffer.offers_settled().await;
        let drained = buffer.drain().count();

        let accepted = producers.into_iter().map(|p| p.join().unwrap()).sum::<usize>();
        assert_eq!(drained, accepted);
    }

    #[test]
    fn zero_capacity_holds_one() {
        assert_eq!(PointBuffer::new(0).capacity(), 1);
    }
}
