//! Cycle-indexed event scheduler
//!
//! Any thread may schedule a callback to run once the emulated cycle counter
//! reaches a given value. Callbacks run on the thread that calls
//! [`EventQueue::expire`] (the emulation thread) and receive the context
//! passed to it, normally the [`Machine`](super::Machine).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard};

use tracing::trace;

use super::CycleSlot;

/// Work scheduled for a future cycle
pub type EventCallback<C> = Box<dyn FnOnce(&mut C) + Send>;

struct Entry<C> {
    cycle: u64,
    callback: EventCallback<C>,
}

// BinaryHeap is a max-heap; reverse so the earliest cycle pops first
impl<C> Ord for Entry<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.cycle.cmp(&self.cycle)
    }
}

impl<C> PartialOrd for Entry<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> PartialEq for Entry<C> {
    fn eq(&self, other: &Self) -> bool {
        self.cycle == other.cycle
    }
}

impl<C> Eq for Entry<C> {}

struct Inner<C> {
    heap: BinaryHeap<Entry<C>>,
    slot: Option<CycleSlot>,
    stop: u64,
}

impl<C> Inner<C> {
    fn push(&mut self, cycle: u64, callback: EventCallback<C>) {
        self.heap.push(Entry { cycle, callback });
        if let Some(slot) = &self.slot {
            slot.lower_to(cycle);
        }
    }

    fn bound(&self) -> u64 {
        self.heap.peek().map_or(self.stop, |e| e.cycle.min(self.stop))
    }
}

/// Min-heap of `(cycle, callback)` pairs.
///
/// Ties between entries at the same cycle run in unspecified order.
pub struct EventQueue<C> {
    inner: Mutex<Inner<C>>,
}

impl<C> Default for EventQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> EventQueue<C> {
    pub fn new() -> Self {
        EventQueue {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                slot: None,
                stop: u64::MAX,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<C>> {
        // A panicking callback never runs under the lock, so the heap is intact
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind the caller's watermark and lower it to the earlier of the next
    /// entry and `stop`
    pub fn start(&self, slot: &CycleSlot, stop: u64) {
        let mut inner = self.lock();
        inner.stop = stop;
        inner.slot = Some(slot.clone());
        slot.set(inner.bound());
    }

    /// Schedule from any thread
    pub fn schedule<F>(&self, cycle: u64, callback: F)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.lock().push(cycle, Box::new(callback));
    }

    /// Schedule from the emulation thread, including from inside a callback.
    ///
    /// Callbacks never run with the queue locked, so this cannot deadlock.
    pub fn schedule_no_lock<F>(&self, cycle: u64, callback: F)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.schedule(cycle, callback);
    }

    /// Run every entry due at or before `now`, earliest first, then re-lower
    /// the bound watermark. Returns the number of callbacks run.
    pub fn expire(&self, now: u64, context: &mut C) -> usize {
        let mut ran = 0;
        loop {
            let entry = {
                let mut inner = self.lock();
                if inner.heap.peek().is_some_and(|e| e.cycle <= now) {
                    inner.heap.pop()
                } else {
                    if let Some(slot) = &inner.slot {
                        slot.set(inner.bound());
                    }
                    break;
                }
            };
            if let Some(entry) = entry {
                trace!(cycle = entry.cycle, now, "event expired");
                (entry.callback)(context);
                ran += 1;
            }
        }
        ran
    }

    /// Cycle of the earliest pending entry
    pub fn next_cycle(&self) -> Option<u64> {
        self.lock().heap.peek().map(|e| e.cycle)
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    pub fn clear(&self) {
        self.lock().heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    type Log = Vec<u64>;

    fn log_at(q: &EventQueue<Log>, cycle: u64) {
        q.schedule(cycle, move |log: &mut Log| log.push(cycle));
    }

    #[test]
    fn test_expire_order() {
        let q = EventQueue::new();
        let slot = CycleSlot::new(0);
        for c in [5, 2, 8] {
            log_at(&q, c);
        }
        q.start(&slot, 100);
        assert_eq!(slot.get(), 2);

        let mut log = Vec::new();
        assert_eq!(q.expire(3, &mut log), 1);
        assert_eq!(log, vec![2]);
        assert_eq!(slot.get(), 5);

        q.expire(8, &mut log);
        assert_eq!(log, vec![2, 5, 8]);
        assert_eq!(slot.get(), 100);
        assert!(q.is_empty());
    }

    #[test]
    fn test_start_bounds_by_stop() {
        let q: EventQueue<Log> = EventQueue::new();
        let slot = CycleSlot::new(0);
        log_at(&q, 500);
        q.start(&slot, 100);
        assert_eq!(slot.get(), 100);
    }

    #[test]
    fn test_schedule_lowers_bound_slot() {
        let q: EventQueue<Log> = EventQueue::new();
        let slot = CycleSlot::new(0);
        q.start(&slot, 1000);
        assert_eq!(slot.get(), 1000);
        log_at(&q, 10);
        assert_eq!(slot.get(), 10);
        log_at(&q, 900);
        assert_eq!(slot.get(), 10);
    }

    #[test]
    fn test_reentrant_schedule_from_callback() {
        let q = std::sync::Arc::new(EventQueue::<Log>::new());
        let slot = CycleSlot::new(0);
        let q2 = q.clone();
        q.schedule(1, move |log: &mut Log| {
            log.push(1);
            // Due immediately, so the same expire call picks it up
            q2.schedule_no_lock(1, |log: &mut Log| log.push(11));
            q2.schedule_no_lock(7, |log: &mut Log| log.push(7));
        });
        q.start(&slot, 50);
        let mut log = Vec::new();
        q.expire(1, &mut log);
        assert_eq!(log, vec![1, 11]);
        assert_eq!(slot.get(), 7);
        assert_eq!(q.next_cycle(), Some(7));
    }

    #[test]
    fn test_schedule_from_other_thread() {
        let q = std::sync::Arc::new(EventQueue::<Log>::new());
        let slot = CycleSlot::new(0);
        q.start(&slot, u64::MAX);
        let q2 = q.clone();
        std::thread::spawn(move || q2.schedule(42, |log: &mut Log| log.push(42)))
            .join()
            .unwrap();
        assert_eq!(slot.get(), 42);
        let mut log = Vec::new();
        q.expire(42, &mut log);
        assert_eq!(log, vec![42]);
    }

    proptest! {
        #[test]
        fn prop_expire_is_sorted_and_bounded(cycles in proptest::collection::vec(0u64..1000, 0..64), now in 0u64..1000) {
            let q = EventQueue::new();
            for &c in &cycles {
                log_at(&q, c);
            }
            let mut log = Vec::new();
            q.expire(now, &mut log);
            let mut expected: Vec<u64> = cycles.iter().copied().filter(|&c| c <= now).collect();
            expected.sort_unstable();
            prop_assert_eq!(log, expected);
            prop_assert_eq!(q.len(), cycles.iter().filter(|&&c| c > now).count());
        }
    }
}
