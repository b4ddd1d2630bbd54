//! Bounded worker inbox with backpressure.
//!
//! A fixed-capacity channel. Producers either get their item back when the
//! queue is full or block for a bounded time waiting for room; the worker
//! blocks on an empty queue instead of spinning.
//!
//! # Sizing
//!
//! Size the queue using Little's Law: `capacity = throughput * latency`.
//! At 20k tasks/sec per worker with 50ms of queueing, `capacity = 1000`.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};

/// Result of pushing onto the queue.
#[derive(Debug)]
pub enum PushResult<T> {
    Ok,
    /// Queue is full. Returns the item for the caller to handle.
    Backpressure(T),
}

#[derive(Debug)]
pub struct BoundedQueue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    pub fn try_push(&self, item: T) -> PushResult<T> {
        match self.sender.try_send(item) {
            Ok(()) => PushResult::Ok,
            Err(TrySendError::Full(item) | TrySendError::Disconnected(item)) => {
                PushResult::Backpressure(item)
            }
        }
    }

    /// Waits up to `timeout` for room.
    pub fn push_timeout(&self, item: T, timeout: Duration) -> PushResult<T> {
        match self.sender.send_timeout(item, timeout) {
            Ok(()) => PushResult::Ok,
            Err(SendTimeoutError::Timeout(item) | SendTimeoutError::Disconnected(item)) => {
                PushResult::Backpressure(item)
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Waits up to `timeout` for an item.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        match self.receiver.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Pops up to `max` items without blocking.
    pub fn pop_batch(&self, max: usize) -> Vec<T> {
        self.receiver.try_iter().take(max).collect()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.sender.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
