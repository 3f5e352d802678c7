//! Run queue implementation
//!
//! A lock-protected FIFO of runnable processes. Each scheduler owns one;
//! peers pop from its front when stealing.

use std::collections::VecDeque;
use std::fmt::Debug;

use crate::lock::{LockKind, Locked};

/// Thread-safe FIFO guarded by a runtime-selected lock.
pub struct RunQueue<T> {
    items: Locked<VecDeque<T>>,
}

impl<T> RunQueue<T> {
    /// Create an empty queue protected by a lock of `kind`.
    pub fn new(kind: LockKind) -> Self {
        Self {
            items: Locked::new(VecDeque::new(), kind),
        }
    }

    /// Push to the back. Returns true if the queue was empty before.
    pub fn enqueue(&self, item: T) -> bool {
        let mut items = self.items.lock();
        let was_empty = items.is_empty();
        items.push_back(item);
        was_empty
    }

    /// Pop from the front.
    pub fn dequeue(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Lock strategy protecting the queue.
    pub fn lock_kind(&self) -> LockKind {
        self.items.raw().kind()
    }
}

impl<T> Default for RunQueue<T> {
    fn default() -> Self {
        Self::new(LockKind::default())
    }
}

impl<T> Debug for RunQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunQueue")
            .field("len", &self.len())
            .field("lock", &self.lock_kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_run_queue_is_fifo() {
        let queue = RunQueue::new(LockKind::Ticket);
        assert!(queue.is_empty());

        assert!(queue.enqueue(1));
        assert!(!queue.enqueue(2));
        assert!(!queue.enqueue(3));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.dequeue(), Some(1));
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), Some(3));
        assert_eq!(queue.dequeue(), None);
        assert!(queue.enqueue(4));
    }

    #[test]
    fn test_concurrent_enqueue_dequeue() {
        let queue = Arc::new(RunQueue::new(LockKind::Tas));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..1_000 {
                        queue.enqueue(p * 1_000 + i);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut seen = Vec::new();
        while let Some(item) = queue.dequeue() {
            seen.push(item);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..4_000).collect::<Vec<_>>());
    }

    #[test]
    fn test_reports_lock_kind() {
        let queue: RunQueue<()> = RunQueue::new(LockKind::Clh);
        assert_eq!(queue.lock_kind(), LockKind::Clh);
    }
}
