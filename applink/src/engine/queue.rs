//! Bounded FIFO queues between the transport edge and the worker threads.
//!
//! Producers never block: when a queue is at capacity the oldest
//! droppable item is discarded to make room. Items that report themselves
//! non-droppable (control frames) are always retained, letting the queue
//! exceed its nominal capacity rather than lose them.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::trace::warn;

/// Implemented by queued items to steer the overflow policy.
pub trait QueueItem {
    /// Whether this item may be discarded under overflow pressure.
    fn droppable(&self) -> bool {
        true
    }
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer queue drained by one worker thread.
pub struct MessageQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T: QueueItem> MessageQueue<T> {
    /// # Panics
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be greater than 0");
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Enqueues `item`, returning whatever had to be dropped to fit it.
    ///
    /// Pushing to a closed queue discards the item.
    pub fn push(&self, item: T) -> Option<T> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        if inner.closed {
            return Some(item);
        }

        let mut dropped = None;
        if inner.items.len() >= self.capacity {
            if let Some(pos) = inner.items.iter().position(QueueItem::droppable) {
                dropped = inner.items.remove(pos);
                warn!("queue overflow, dropped oldest droppable item");
            }
            // No droppable item: retain everything and grow past capacity.
        }
        inner.items.push_back(item);
        drop(inner);
        self.available.notify_one();
        dropped
    }

    /// Blocks until an item is available or the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().expect("queue poisoned");
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.available.wait(inner).expect("queue poisoned");
        }
    }

    /// Non-blocking variant of [`MessageQueue::pop`].
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().expect("queue poisoned").items.pop_front()
    }

    /// Closes the queue; blocked consumers drain what is left, then stop.
    pub fn close(&self) {
        self.inner.lock().expect("queue poisoned").closed = true;
        self.available.notify_all();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue poisoned").items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
