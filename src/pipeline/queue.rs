//! Bounded blocking queue between the capture and persistence workers.
//!
//! Backpressure is the only throttle: a full queue blocks the producer, an
//! empty one blocks the consumer, and nothing is ever dropped silently.
//! Shutdown uses sticky release flags instead of sentinel items, so a
//! worker that has not parked yet still observes the release on its next
//! call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;

use crate::capture::Frame;

/// The queue the capture pipeline runs on.
pub type FrameQueue = BoundedQueue<Frame>;

pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,

    /// Statistics
    stats: CachePadded<Stats>,
}

struct Inner<T> {
    items: VecDeque<T>,
    producer_released: bool,
    consumer_released: bool,
}

#[derive(Default)]
struct Stats {
    pushed: AtomicU64,
    popped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "a zero-capacity queue can never transfer");
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                producer_released: false,
                consumer_released: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer: insert at the newest end, blocking while full.
    ///
    /// Returns `false` without inserting when the producer side has been
    /// released for shutdown; the item is dropped.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.lock();
        while inner.items.len() == self.capacity && !inner.producer_released {
            inner = self
                .not_full
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if inner.producer_released {
            return false;
        }

        inner.items.push_back(item);
        drop(inner);

        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();
        true
    }

    /// Consumer: remove the oldest item, blocking while empty.
    ///
    /// Returns `None` when the consumer side has been released for
    /// shutdown.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.lock();
        while inner.items.is_empty() && !inner.consumer_released {
            inner = self
                .not_empty
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if inner.consumer_released {
            return None;
        }

        let item = inner.items.pop_front();
        drop(inner);

        if item.is_some() {
            self.stats.popped.fetch_add(1, Ordering::Relaxed);
            self.not_full.notify_one();
        }
        item
    }

    /// Wake a producer parked in [`push`](Self::push) without consuming
    /// anything. Sticky until [`clear`](Self::clear).
    pub fn release_producer_wait(&self) {
        self.lock().producer_released = true;
        self.not_full.notify_all();
    }

    /// Wake a consumer parked in [`pop`](Self::pop) without delivering an
    /// item. Sticky until [`clear`](Self::clear).
    pub fn release_consumer_wait(&self) {
        self.lock().consumer_released = true;
        self.not_empty.notify_all();
    }

    /// Drop everything queued and re-arm both sides. Only called while no
    /// worker is using the queue (teardown or between restarts).
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.items.clear();
        inner.producer_released = false;
        inner.consumer_released = false;
    }

    /// Frames currently queued and unread.
    pub fn unread(&self) -> usize {
        self.lock().items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.unread() == 0
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.pushed.load(Ordering::Relaxed),
            self.stats.popped.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_ordering_across_threads() {
        let queue = Arc::new(BoundedQueue::with_capacity(8));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for n in 0..1000u32 {
                    assert!(queue.push(n));
                }
            })
        };

        for expected in 0..1000u32 {
            assert_eq!(queue.pop(), Some(expected));
        }
        producer.join().unwrap();
        assert_eq!(queue.stats(), (1000, 1000));
    }

    #[test]
    fn unread_never_exceeds_capacity() {
        let queue = Arc::new(BoundedQueue::with_capacity(4));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for n in 0..500u32 {
                    queue.push(n);
                }
            })
        };

        for _ in 0..500 {
            assert!(queue.unread() <= queue.capacity());
            queue.pop();
        }
        producer.join().unwrap();
    }

    #[test]
    fn push_blocks_on_full_queue_until_pop() {
        let queue = Arc::new(BoundedQueue::with_capacity(1));
        assert!(queue.push('a'));

        let second_done = Arc::new(AtomicBool::new(false));
        let blocked = {
            let queue = Arc::clone(&queue);
            let second_done = Arc::clone(&second_done);
            thread::spawn(move || {
                assert!(queue.push('b'));
                second_done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!second_done.load(Ordering::SeqCst), "push must block while full");

        assert_eq!(queue.pop(), Some('a'));
        blocked.join().unwrap();
        assert!(second_done.load(Ordering::SeqCst));
        assert_eq!(queue.pop(), Some('b'));
    }

    #[test]
    fn pop_blocks_on_empty_queue_until_push() {
        let queue = Arc::new(BoundedQueue::with_capacity(1));
        let popped = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(50));
        assert!(queue.push(42u32));
        assert_eq!(popped.join().unwrap(), Some(42));
    }

    #[test]
    fn release_wakes_parked_consumer() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::with_capacity(1));
        let parked = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(50));
        queue.release_consumer_wait();
        assert_eq!(parked.join().unwrap(), None);
    }

    #[test]
    fn release_wakes_parked_producer() {
        let queue = Arc::new(BoundedQueue::with_capacity(1));
        assert!(queue.push(1u32));
        let parked = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };

        thread::sleep(Duration::from_millis(50));
        queue.release_producer_wait();
        assert!(!parked.join().unwrap(), "released push must not insert");
        assert_eq!(queue.unread(), 1);
    }

    #[test]
    fn release_is_sticky_for_late_arrivals() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::with_capacity(1));
        queue.release_consumer_wait();
        // A consumer arriving after the release must not park.
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn clear_resets_items_and_release_flags() {
        let queue = BoundedQueue::with_capacity(4);
        queue.push(1u32);
        queue.push(2);
        queue.release_producer_wait();
        queue.release_consumer_wait();

        queue.clear();
        assert_eq!(queue.unread(), 0);

        // Both sides usable again after the restart-style reset.
        assert!(queue.push(3));
        assert_eq!(queue.pop(), Some(3));
    }
}
