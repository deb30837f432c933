// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The work queue contract and its two implementations.

use crate::loom::sync::Mutex;
use crate::task::Task;
use core::fmt;
use crossbeam_queue::SegQueue;
use std::collections::VecDeque;

/// A queue of [`Task`]s shared between one owning worker and any number of
/// submitters and thieves.
///
/// All operations are non-blocking in the sense that they complete without
/// waiting for work to appear. A pushed task is executed exactly once by
/// whoever dequeues it; [`try_push`][WorkQueue::try_push] hands the task
/// back instead of dropping it when the queue is full.
pub trait WorkQueue: Send + Sync {
    /// `capacity` is advisory; unbounded implementations ignore it.
    fn with_capacity(capacity: usize) -> Self
    where
        Self: Sized;

    fn try_push(&self, task: Task) -> Result<(), Task>;

    /// Dequeue from the owner's end. Called only by the owning worker.
    fn try_pop(&self) -> Option<Task>;

    /// Dequeue from the thief end. Called by any thread.
    fn try_steal(&self) -> Option<Task>;
}

/// Bounded mutex-guarded deque.
///
/// The owner pops newest-first from the back; thieves take oldest-first from
/// the front, so stolen work is the work that has waited longest.
pub struct LockedQueue {
    tasks: Mutex<VecDeque<Task>>,
    capacity: usize,
}

// === impl LockedQueue ===

impl WorkQueue for LockedQueue {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn try_push(&self, task: Task) -> Result<(), Task> {
        let mut tasks = self.tasks.lock();
        if tasks.len() == self.capacity {
            return Err(task);
        }
        tasks.push_back(task);
        Ok(())
    }

    fn try_pop(&self) -> Option<Task> {
        self.tasks.lock().pop_back()
    }

    fn try_steal(&self) -> Option<Task> {
        self.tasks.lock().pop_front()
    }
}

impl fmt::Debug for LockedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedQueue")
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Unbounded lock-free MPMC queue backed by [`crossbeam_queue::SegQueue`].
///
/// Pops and steals map to the same dequeue end; ordering across producers is
/// not part of the queue contract, so one underlying operation serves both.
pub struct SegmentQueue {
    tasks: SegQueue<Task>,
}

// === impl SegmentQueue ===

impl WorkQueue for SegmentQueue {
    fn with_capacity(_capacity: usize) -> Self {
        Self {
            tasks: SegQueue::new(),
        }
    }

    fn try_push(&self, task: Task) -> Result<(), Task> {
        self.tasks.push(task);
        Ok(())
    }

    fn try_pop(&self) -> Option<Task> {
        self.tasks.pop()
    }

    fn try_steal(&self) -> Option<Task> {
        self.tasks.pop()
    }
}

impl fmt::Debug for SegmentQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentQueue")
            .field("len", &self.tasks.len())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn marker_task(counter: &Arc<AtomicUsize>, value: usize) -> Task {
        let counter = Arc::clone(counter);
        Task::new(move || {
            counter.fetch_add(value, Ordering::SeqCst);
        })
    }

    #[test]
    fn owner_pops_lifo_thieves_steal_fifo() {
        let counter = Arc::new(AtomicUsize::new(0));
        let queue = LockedQueue::with_capacity(8);

        queue.try_push(marker_task(&counter, 1)).unwrap();
        queue.try_push(marker_task(&counter, 10)).unwrap();
        queue.try_push(marker_task(&counter, 100)).unwrap();

        // owner takes the newest task
        queue.try_pop().unwrap().run();
        assert_eq!(counter.load(Ordering::SeqCst), 100);

        // a thief takes the oldest
        queue.try_steal().unwrap().run();
        assert_eq!(counter.load(Ordering::SeqCst), 101);

        queue.try_pop().unwrap().run();
        assert_eq!(counter.load(Ordering::SeqCst), 111);
        assert!(queue.try_pop().is_none());
        assert!(queue.try_steal().is_none());
    }

    #[test]
    fn bounded_queue_rejects_when_full() {
        let counter = Arc::new(AtomicUsize::new(0));
        let queue = LockedQueue::with_capacity(1);

        queue.try_push(marker_task(&counter, 1)).unwrap();
        let rejected = queue.try_push(marker_task(&counter, 2)).unwrap_err();
        // the rejected task is handed back intact
        rejected.run();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn segment_queue_never_rejects() {
        let counter = Arc::new(AtomicUsize::new(0));
        let queue = SegmentQueue::with_capacity(1);

        for i in 0..64 {
            queue.try_push(marker_task(&counter, i)).unwrap();
        }
        let mut drained = 0;
        while let Some(task) = queue.try_steal() {
            task.run();
            drained += 1;
        }
        assert_eq!(drained, 64);
        assert_eq!(counter.load(Ordering::SeqCst), (0..64).sum::<usize>());
    }

    #[test]
    fn tasks_are_not_duplicated_under_racing_consumers() {
        use std::thread;

        let counter = Arc::new(AtomicUsize::new(0));
        let queue = Arc::new(LockedQueue::with_capacity(1024));
        for _ in 0..1000 {
            queue.try_push(marker_task(&counter, 1)).unwrap();
        }

        thread::scope(|s| {
            for _ in 0..4 {
                let queue = Arc::clone(&queue);
                s.spawn(move || while queue.try_steal().map(Task::run).is_some() {});
            }
        });

        assert_eq!(counter.load(Ordering::SeqCst), 1000);
    }
}
