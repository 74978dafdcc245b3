//! The three hardware queues.
//!
//! Each is a bounded FIFO that rejects submissions at capacity instead of dropping or evicting
//! anything. Entries are timestamped while the queue lock is held, so timestamps are
//! non-decreasing in FIFO order.

mod command;
mod event;
mod pri;

pub use command::{CommandEntry, CommandQueue, CommandType};
pub use event::{EventEntry, EventQueue, EventSink, EventType};
pub use pri::{PriEntry, PriQueue};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::sync::lock;

/// Queue entries carry the time they were accepted.
pub trait Timestamped {
    fn set_timestamp(&mut self, timestamp: u64);
}

/// Submission was rejected because the queue held `capacity` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull {
    pub capacity: usize,
}

#[derive(Debug)]
struct QueueState<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

/// Admission counters. `accepted + rejected` equals the number of submission attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub accepted: u64,
    pub rejected: u64,
}

#[derive(Debug)]
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    clock: Arc<Clock>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl<T: Timestamped> BoundedQueue<T> {
    pub fn new(capacity: usize, clock: Arc<Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
            }),
            clock,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn push(&self, mut entry: T) -> Result<(), QueueFull> {
        let mut state = lock(&self.state);
        if state.entries.len() >= state.capacity {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(QueueFull {
                capacity: state.capacity,
            });
        }
        entry.set_timestamp(self.clock.now_ns());
        state.entries.push_back(entry);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn pop_front(&self) -> Option<T> {
        lock(&self.state).entries.pop_front()
    }

    pub fn drain(&self) -> Vec<T> {
        lock(&self.state).entries.drain(..).collect()
    }

    /// Pops entries from the head for as long as `accept` takes them. The entry `accept`
    /// refuses stays at the head. Returns how many entries were taken.
    ///
    /// The queue stays locked throughout, so `accept` must not touch this queue.
    pub fn drain_while(&self, mut accept: impl FnMut(&T) -> bool) -> usize {
        let mut state = lock(&self.state);
        let mut taken = 0;
        while let Some(entry) = state.entries.front() {
            if !accept(entry) {
                break;
            }
            state.entries.pop_front();
            taken += 1;
        }
        taken
    }

    /// Drops every queued entry, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut state = lock(&self.state);
        let dropped = state.entries.len();
        state.entries.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        let state = lock(&self.state);
        state.entries.len() >= state.capacity
    }

    pub fn capacity(&self) -> usize {
        lock(&self.state).capacity
    }

    /// Changes the capacity. Fails, leaving the queue untouched, when more entries are queued
    /// than `capacity` could hold.
    pub fn resize(&self, capacity: usize) -> Result<(), QueueFull> {
        let mut state = lock(&self.state);
        if state.entries.len() > capacity {
            return Err(QueueFull { capacity });
        }
        state.capacity = capacity;
        Ok(())
    }

    pub fn counters(&self) -> QueueCounters {
        QueueCounters {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn reset_counters(&self) {
        self.accepted.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
    }
}

impl<T: Timestamped + Clone> BoundedQueue<T> {
    pub fn front(&self) -> Option<T> {
        lock(&self.state).entries.front().cloned()
    }

    pub fn snapshot(&self) -> Vec<T> {
        lock(&self.state).entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Item {
        id: u32,
        timestamp: u64,
    }

    impl Timestamped for Item {
        fn set_timestamp(&mut self, timestamp: u64) {
            self.timestamp = timestamp;
        }
    }

    fn item(id: u32) -> Item {
        Item { id, timestamp: 0 }
    }

    fn ids(items: &[Item]) -> Vec<u32> {
        items.iter().map(|i| i.id).collect()
    }

    #[test]
    fn rejects_at_capacity_and_recovers_after_drain() {
        let q = BoundedQueue::new(2, Clock::new_shared());
        q.push(item(1)).unwrap();
        q.push(item(2)).unwrap();
        assert_eq!(q.push(item(3)), Err(QueueFull { capacity: 2 }));
        assert!(q.is_full());

        assert_eq!(ids(&q.drain()), vec![1, 2]);
        q.push(item(4)).unwrap();
        assert_eq!(
            q.counters(),
            QueueCounters {
                accepted: 3,
                rejected: 1
            }
        );
    }

    #[test]
    fn timestamps_are_non_decreasing() {
        let q = BoundedQueue::new(64, Clock::new_shared());
        for id in 0..64 {
            q.push(item(id)).unwrap();
        }
        let items = q.drain();
        assert!(items.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn drain_while_leaves_refused_entry_at_head() {
        let q = BoundedQueue::new(8, Clock::new_shared());
        for id in 1..=4 {
            q.push(item(id)).unwrap();
        }
        assert_eq!(q.drain_while(|i| i.id < 3), 2);
        assert_eq!(q.front().map(|i| i.id), Some(3));
        assert_eq!(ids(&q.snapshot()), vec![3, 4]);
    }

    #[test]
    fn resize_refuses_to_truncate() {
        let q = BoundedQueue::new(4, Clock::new_shared());
        for id in 0..3 {
            q.push(item(id)).unwrap();
        }
        assert_eq!(q.resize(2), Err(QueueFull { capacity: 2 }));
        assert_eq!(q.capacity(), 4);
        q.resize(3).unwrap();
        assert!(q.is_full());
    }

    #[test]
    fn concurrent_submitters_never_exceed_capacity() {
        let q = Arc::new(BoundedQueue::new(100, Clock::new_shared()));
        let mut threads = Vec::new();
        for t in 0..4u32 {
            let q = Arc::clone(&q);
            threads.push(std::thread::spawn(move || {
                for i in 0..50u32 {
                    let _ = q.push(item(t * 1000 + i));
                }
            }));
        }
        for th in threads {
            th.join().expect("thread join");
        }

        let counters = q.counters();
        assert_eq!(q.len(), 100);
        assert_eq!(counters.accepted, 100);
        assert_eq!(counters.accepted + counters.rejected, 200);
    }
}
