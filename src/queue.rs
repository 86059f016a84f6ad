//! A bounded, blocking FIFO queue for async producers and consumers.
//!
//! Consumers wait while the queue is empty, producers wait while it is full.
//! Both the channel pool and the publisher's letter buffer are built on top of it:
//! its capacity is what throttles callers.
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

pub(crate) struct BoundedQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> BoundedQueue<T> {
    /// A queue holding at most `capacity` items.
    ///
    /// A capacity of zero is bumped to one, otherwise `push` could never complete.
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Append an item, waiting for a free slot if the queue is full.
    pub(crate) async fn push(&self, item: T) {
        let mut item = item;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            // Register interest before looking at the queue, so a slot freed in between
            // is not missed.
            notified.as_mut().enable();

            match self.try_push(item) {
                Ok(()) => return,
                Err(rejected) => item = rejected,
            }
            notified.await;
        }
    }

    /// Append an item if there is room for it, handing it back otherwise.
    pub(crate) fn try_push(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                return Err(item);
            }
            items.push_back(item);
        }
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the oldest item, waiting for one to become available if the queue is empty.
    pub(crate) async fn pop(&self) -> T {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Take the oldest item, if any.
    pub(crate) fn try_pop(&self) -> Option<T> {
        let item = self.lock().pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Remove every queued item at once.
    pub(crate) fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self.lock().drain(..).collect();
        if !drained.is_empty() {
            self.not_full.notify_waiters();
        }
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // The critical sections never panic halfway through a mutation.
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
