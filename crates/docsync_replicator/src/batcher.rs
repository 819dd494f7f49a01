//! Revision batching.
//!
//! [`Batcher`] collects pending revisions into batches of at most
//! `capacity` items. A batch is released as soon as the queue is full, or
//! once `delay` has passed since the first item landed in an empty queue.
//! The batcher holds no timer of its own; the owner sleeps until
//! [`Batcher::deadline`] and then calls [`Batcher::take_due`].

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Bounded, order-preserving batch accumulator.
#[derive(Debug)]
pub struct Batcher<T> {
    capacity: usize,
    delay: Duration,
    queue: VecDeque<T>,
    deadline: Option<Instant>,
}

impl<T> Batcher<T> {
    /// Creates a batcher. A capacity of zero is treated as one.
    pub fn new(capacity: usize, delay: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            delay,
            queue: VecDeque::new(),
            deadline: None,
        }
    }

    /// Maximum batch size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// When the queued items become due, if any are queued.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Queues an item and returns a full batch once capacity is reached.
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        if self.queue.is_empty() {
            self.deadline = Some(Instant::now() + self.delay);
        }
        self.queue.push_back(item);
        if self.queue.len() >= self.capacity {
            Some(self.take(self.capacity))
        } else {
            None
        }
    }

    /// Releases the queued items if the deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> Option<Vec<T>> {
        match self.deadline {
            Some(deadline) if deadline <= now && !self.queue.is_empty() => {
                Some(self.take(self.capacity))
            }
            _ => None,
        }
    }

    /// Releases everything queued, in batches of at most `capacity`.
    pub fn flush_all(&mut self) -> Vec<Vec<T>> {
        let mut batches = Vec::new();
        while !self.queue.is_empty() {
            batches.push(self.take(self.capacity));
        }
        batches
    }

    /// Drops queued items for which `keep` returns false and returns them.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for item in self.queue.drain(..) {
            if keep(&item) {
                kept.push_back(item);
            } else {
                removed.push(item);
            }
        }
        self.queue = kept;
        if self.queue.is_empty() {
            self.deadline = None;
        }
        removed
    }

    /// Iterates over queued items in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.queue.iter()
    }

    fn take(&mut self, count: usize) -> Vec<T> {
        let count = count.min(self.queue.len());
        let batch: Vec<T> = self.queue.drain(..count).collect();
        self.deadline = if self.queue.is_empty() {
            None
        } else {
            Some(Instant::now() + self.delay)
        };
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn releases_when_full() {
        let mut batcher = Batcher::new(3, Duration::from_secs(60));
        assert!(batcher.push(1).is_none());
        assert!(batcher.push(2).is_none());
        assert_eq!(batcher.push(3), Some(vec![1, 2, 3]));
        assert!(batcher.is_empty());
        assert!(batcher.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn releases_after_delay() {
        let mut batcher = Batcher::new(10, Duration::from_millis(500));
        batcher.push("a");
        let deadline = batcher.deadline().unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        batcher.push("b");
        // The window started with the first item.
        assert_eq!(batcher.deadline(), Some(deadline));
        assert!(batcher.take_due(Instant::now()).is_none());

        tokio::time::sleep_until(deadline).await;
        assert_eq!(batcher.take_due(Instant::now()), Some(vec!["a", "b"]));
        assert!(batcher.take_due(Instant::now()).is_none());
    }

    #[test]
    fn flush_all_chunks_by_capacity() {
        let mut batcher = Batcher::new(4, Duration::from_secs(1));
        for i in 0..3 {
            batcher.push(i);
        }
        assert_eq!(batcher.flush_all(), vec![vec![0, 1, 2]]);
        assert!(batcher.flush_all().is_empty());
    }

    #[test]
    fn retain_removes_purged_items() {
        let mut batcher = Batcher::new(10, Duration::from_secs(1));
        for doc in ["a", "b", "a", "c"] {
            batcher.push(doc);
        }
        let removed = batcher.retain(|doc| *doc != "a");
        assert_eq!(removed, vec!["a", "a"]);
        assert_eq!(batcher.iter().copied().collect::<Vec<_>>(), vec!["b", "c"]);

        batcher.retain(|_| false);
        assert!(batcher.deadline().is_none());
    }

    proptest! {
        #[test]
        fn batches_never_exceed_capacity(capacity in 1usize..20, count in 0usize..200) {
            let mut batcher = Batcher::new(capacity, Duration::from_secs(1));
            let mut released = Vec::new();
            for i in 0..count {
                if let Some(batch) = batcher.push(i) {
                    released.push(batch);
                }
            }
            released.extend(batcher.flush_all());

            prop_assert!(released.iter().all(|batch| !batch.is_empty() && batch.len() <= capacity));
            let flattened: Vec<usize> = released.into_iter().flatten().collect();
            prop_assert_eq!(flattened, (0..count).collect::<Vec<_>>());
        }
    }
}
