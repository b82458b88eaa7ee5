//! Bounded queue that never blocks a producer indefinitely.

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::time::Duration;
use tracing::warn;

/// A bounded MPMC queue that, after waiting `put_timeout` on a full buffer,
/// evicts the oldest item to make room for the new one.
pub struct DropOldestQueue<T> {
    name: &'static str,
    sender: Sender<T>,
    receiver: Receiver<T>,
    put_timeout: Duration,
    // Serializes producers so an eviction always frees the slot it was made for.
    push_lock: Mutex<()>,
}

impl<T: Send> DropOldestQueue<T> {
    pub fn new(name: &'static str, capacity: usize, put_timeout: Duration) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self {
            name,
            sender,
            receiver,
            put_timeout,
            push_lock: Mutex::new(()),
        }
    }

    /// Enqueue `item`. Returns the item that was evicted to make room, if any.
    pub fn push(&self, item: T) -> Option<T> {
        let _guard = self.push_lock.lock();

        let item = match self.sender.send_timeout(item, self.put_timeout) {
            Ok(()) => return None,
            Err(SendTimeoutError::Timeout(item)) | Err(SendTimeoutError::Disconnected(item)) => {
                item
            }
        };

        let evicted = self.receiver.try_recv().ok();
        warn!(
            queue = self.name,
            capacity = self.capacity(),
            "Queue full, dropping oldest item"
        );

        match self.sender.try_send(item) {
            Ok(()) => evicted,
            // Unreachable while we hold the receiver and the push lock.
            Err(TrySendError::Full(item)) | Err(TrySendError::Disconnected(item)) => {
                warn!(queue = self.name, "Queue still full after eviction, dropping newest item");
                Some(item)
            }
        }
    }

    /// A consumer handle.
    pub fn receiver(&self) -> Receiver<T> {
        self.receiver.clone()
    }

    /// Discard everything queued. Returns how many items were dropped.
    pub fn clear(&self) -> usize {
        self.receiver.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.sender.capacity().unwrap_or(0)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_push_within_capacity() {
        let queue = DropOldestQueue::new("test", 3, Duration::from_millis(10));
        assert!(queue.push(1).is_none());
        assert!(queue.push(2).is_none());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.capacity(), 3);
    }

    #[test]
    fn test_full_queue_evicts_oldest() {
        let queue = DropOldestQueue::new("test", 2, Duration::from_millis(10));
        queue.push(1);
        queue.push(2);

        assert_eq!(queue.push(3), Some(1));
        assert_eq!(queue.push(4), Some(2));

        let remaining: Vec<i32> = queue.receiver().try_iter().collect();
        assert_eq!(remaining, vec![3, 4]);
    }

    #[test]
    fn test_push_waits_at_most_put_timeout() {
        let queue = DropOldestQueue::new("test", 1, Duration::from_millis(50));
        queue.push(1);

        let started = Instant::now();
        queue.push(2);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_consumer_frees_space_before_timeout() {
        let queue = Arc::new(DropOldestQueue::new("test", 1, Duration::from_secs(2)));
        queue.push(1);

        let receiver = queue.receiver();
        let consumer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            receiver.recv().unwrap()
        });

        assert!(queue.push(2).is_none());
        assert_eq!(consumer.join().unwrap(), 1);
        assert_eq!(queue.receiver().try_recv().unwrap(), 2);
    }

    #[test]
    fn test_clear() {
        let queue = DropOldestQueue::new("test", 4, Duration::from_millis(10));
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
