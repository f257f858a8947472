//! Fixed-capacity synchronized queue for handing buffer descriptors across threads

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What a queue operation does when it cannot proceed right away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockingBehavior {
    /// Sleep until the condition clears
    #[default]
    Block,
    /// Return an error immediately
    Fail,
}

/// Thread-safe bounded FIFO.
///
/// Any number of producers and consumers may share one queue by reference
/// (typically behind an `Arc`). A full queue either blocks `push` or fails it
/// with [`Error::QueueSaturated`], and an empty queue either blocks `pop` or
/// fails it with [`Error::QueueStarved`], depending on the two behaviors given
/// at construction. The lock is released while a caller sleeps.
pub struct BoundedQueue<T> {
    ring: Mutex<HeapRb<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
    when_full: BlockingBehavior,
    when_empty: BlockingBehavior,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    pushed: AtomicUsize,
    popped: AtomicUsize,
    rejected: AtomicUsize,
}

impl<T> BoundedQueue<T> {
    /// Create an empty queue holding at most `capacity` elements.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, when_full: BlockingBehavior, when_empty: BlockingBehavior) -> Self {
        assert!(capacity > 0, "bounded queue capacity must be non-zero");
        Self {
            ring: Mutex::new(HeapRb::new(capacity)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
            when_full,
            when_empty,
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeapRb<T>> {
        // The ring is never left half-updated, so a panic elsewhere does not invalidate it
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `val` at the tail
    pub fn push(&self, val: T) -> Result<()> {
        let mut ring = self.lock();
        while ring.is_full() {
            match self.when_full {
                BlockingBehavior::Fail => {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::QueueSaturated);
                }
                BlockingBehavior::Block => {
                    ring = self
                        .not_full
                        .wait(ring)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }

        if ring.try_push(val).is_err() {
            return Err(Error::QueueSaturated);
        }
        drop(ring);

        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove and return the oldest element
    pub fn pop(&self) -> Result<T> {
        let mut ring = self.lock();
        loop {
            if let Some(val) = ring.try_pop() {
                drop(ring);
                self.stats.popped.fetch_add(1, Ordering::Relaxed);
                self.not_full.notify_one();
                return Ok(val);
            }
            match self.when_empty {
                BlockingBehavior::Fail => {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::QueueStarved);
                }
                BlockingBehavior::Block => {
                    ring = self
                        .not_empty
                        .wait(ring)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Current number of queued elements.
    ///
    /// Informational only: another thread may change it before the caller acts on it.
    pub fn filled_size(&self) -> usize {
        self.lock().occupied_len()
    }

    /// Capacity fixed at construction
    pub fn size(&self) -> usize {
        self.capacity
    }

    /// Drop every queued element. Capacity is unchanged.
    pub fn clear(&self) {
        let mut ring = self.lock();
        while ring.try_pop().is_some() {}
        drop(ring);
        self.not_full.notify_all();
    }

    /// (pushed, popped, rejected)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.pushed.load(Ordering::Relaxed),
            self.stats.popped.load(Ordering::Relaxed),
            self.stats.rejected.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use BlockingBehavior::{Block, Fail};

    #[test]
    fn fail_policy_rejects_push_past_capacity() {
        let q = BoundedQueue::new(3, Fail, Fail);
        for i in 0..3 {
            q.push(i).unwrap();
        }
        assert!(matches!(q.push(3), Err(Error::QueueSaturated)));
        assert_eq!(q.filled_size(), 3);

        assert_eq!(q.pop().unwrap(), 0);
        q.push(3).unwrap();
        assert!(matches!(q.push(4), Err(Error::QueueSaturated)));
        assert_eq!(q.stats(), (4, 1, 2));
    }

    #[test]
    fn fail_policy_rejects_pop_when_empty() {
        let q: BoundedQueue<u8> = BoundedQueue::new(1, Fail, Fail);
        assert!(matches!(q.pop(), Err(Error::QueueStarved)));
    }

    #[test]
    fn clear_resets_occupancy_not_capacity() {
        let q = BoundedQueue::new(2, Fail, Fail);
        q.push('a').unwrap();
        q.push('b').unwrap();
        q.clear();
        assert_eq!(q.filled_size(), 0);
        assert_eq!(q.size(), 2);
        q.push('c').unwrap();
        assert_eq!(q.pop().unwrap(), 'c');
    }

    #[test]
    fn blocking_pop_wakes_on_push() {
        let q = Arc::new(BoundedQueue::new(1, Block, Block));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.pop().unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        q.push(42u32).unwrap();
        assert_eq!(consumer.join().unwrap(), 42);
    }

    #[test]
    fn blocking_push_wakes_on_pop() {
        let q = Arc::new(BoundedQueue::new(1, Block, Block));
        q.push(1).unwrap();
        let producer = {
            let q = q.clone();
            thread::spawn(move || q.push(2).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.filled_size(), 1);
        assert_eq!(q.pop().unwrap(), 1);
        producer.join().unwrap();
        assert_eq!(q.pop().unwrap(), 2);
    }

    #[test]
    fn clear_releases_blocked_producer() {
        let q = Arc::new(BoundedQueue::new(1, Block, Fail));
        q.push(1).unwrap();
        let producer = {
            let q = q.clone();
            thread::spawn(move || q.push(2).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        q.clear();
        producer.join().unwrap();
        assert_eq!(q.pop().unwrap(), 2);
        assert!(matches!(q.pop(), Err(Error::QueueStarved)));
    }

    #[test]
    fn many_producers_keep_per_producer_order() {
        let q = Arc::new(BoundedQueue::new(4, Block, Block));
        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..100u32 {
                        q.push((p, i)).unwrap();
                    }
                })
            })
            .collect();

        let mut last = [None::<u32>; 4];
        for _ in 0..400 {
            let (p, i) = q.pop().unwrap();
            if let Some(prev) = last[p as usize] {
                assert!(i > prev, "producer {p} reordered: {i} after {prev}");
            }
            last[p as usize] = Some(i);
        }
        for p in producers {
            p.join().unwrap();
        }
        assert_eq!(q.filled_size(), 0);
        assert_eq!(last, [Some(99); 4]);
    }
}
