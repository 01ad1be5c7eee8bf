//! Bounded drop-oldest queue for outbound notifications.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A bounded multi-producer queue that never blocks producers.
///
/// When full, the oldest item is discarded to make room.
#[derive(Debug)]
pub struct ServedQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> ServedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue `item`. Returns `false` if the queue is closed.
    pub fn push(&self, item: T) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            if state.items.len() >= self.capacity {
                state.items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next item. Returns `None` once closed and empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting items; queued items can still be popped.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Discard everything queued, returning how many items were dropped.
    pub fn clear(&self) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            let n = state.items.len();
            state.items.clear();
            n
        };
        self.dropped.fetch_add(discarded as u64, Ordering::Relaxed);
        discarded
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items discarded because the queue was full or cleared.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_drops_oldest_when_full() {
        let queue = ServedQueue::new(2);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(queue.push(3));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test]
    async fn test_pop_order_after_overflow() {
        let queue = ServedQueue::new(2);
        queue.push("a");
        queue.push("b");
        queue.push("c");

        assert_eq!(queue.pop().await, Some("b"));
        assert_eq!(queue.pop().await, Some("c"));
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(ServedQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(7);

        let item = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item, Some(7));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = Arc::new(ServedQueue::new(4));
        queue.push(1);
        queue.close();

        assert!(!queue.push(2));
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumer() {
        let queue: Arc<ServedQueue<u32>> = Arc::new(ServedQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        let item = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item, None);
    }

    #[test]
    fn test_clear_counts_discards() {
        let queue = ServedQueue::new(8);
        queue.push(1);
        queue.push(2);

        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 2);
    }
}
