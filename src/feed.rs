//! Push-style notification streams (receipts, operational errors) exposed to callers.
use crate::queue::BoundedQueue;

/// A bounded multi-producer, multi-consumer stream.
///
/// Callers are expected to keep draining it: once `capacity` items are pending,
/// [`Feed::send`] waits and [`Feed::offer`] drops the item.
/// A pending [`Feed::recv`] never locks the other consumers out: `try_recv` and `flush`
/// see the backlog as it is.
pub(crate) struct Feed<T> {
    backlog: BoundedQueue<T>,
}

impl<T> Feed<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            backlog: BoundedQueue::new(capacity),
        }
    }

    /// Push an item, waiting for room if the backlog is full.
    pub(crate) async fn send(&self, item: T) {
        self.backlog.push(item).await;
    }

    /// Push an item without waiting. Returns `false` if it was dropped.
    pub(crate) fn offer(&self, item: T) -> bool {
        self.backlog.try_push(item).is_ok()
    }

    /// Wait for the next item.
    pub(crate) async fn recv(&self) -> T {
        self.backlog.pop().await
    }

    pub(crate) fn try_recv(&self) -> Option<T> {
        self.backlog.try_pop()
    }

    /// Discard the whole backlog. Returns how many items were thrown away.
    pub(crate) fn flush(&self) -> usize {
        self.backlog.drain().len()
    }
}
