// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicI64, Ordering};
use core::fmt;
use strata_util::CachePadded;

/// A sharded counter for tracking outstanding work without a contended hot
/// line.
///
/// Each participant increments and decrements only its own cache-line-padded
/// slot, indexed by thread id (slot 0 belongs to non-worker submitters).
/// [`count`][TaskCounter::count] sums the slots with relaxed loads, so the
/// aggregate is eventually consistent: it may momentarily over- or
/// undershoot while increments and decrements race on different slots, but
/// it converges once the slots quiesce.
pub struct TaskCounter {
    slots: Box<[CachePadded<AtomicI64>]>,
}

// === impl TaskCounter ===

impl TaskCounter {
    /// Creates a counter with `slots` shards; pools size this as
    /// `workers + 1` so slot 0 can serve external submitters.
    pub fn new(slots: usize) -> Self {
        assert!(slots > 0, "counter needs at least one slot");
        Self {
            slots: (0..slots)
                .map(|_| CachePadded::new(AtomicI64::new(0)))
                .collect(),
        }
    }

    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn increment(&self, id: u32) {
        self.slots[id as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn decrement(&self, id: u32) {
        self.slots[id as usize].fetch_sub(1, Ordering::Relaxed);
    }

    /// The eventually-consistent aggregate across all slots.
    pub fn count(&self) -> i64 {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .sum()
    }
}

impl fmt::Debug for TaskCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCounter")
            .field("slots", &self.slots.len())
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use std::sync::Arc;

    #[test]
    fn slots_shard_the_aggregate() {
        loom::model(|| {
            let counter = TaskCounter::new(4);
            counter.increment(0);
            counter.increment(3);
            counter.increment(3);
            counter.decrement(1);
            assert_eq!(counter.count(), 2);
        });
    }

    #[test]
    fn converges_across_threads() {
        loom::model(|| {
            let counter = Arc::new(TaskCounter::new(3));

            let handles: Vec<_> = (1..3_u32)
                .map(|id| {
                    let counter = Arc::clone(&counter);
                    loom::thread::spawn(move || {
                        counter.increment(id);
                        counter.decrement(id);
                        counter.increment(id);
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(counter.count(), 2);
        });
    }
}
