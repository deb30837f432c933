// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A work-stealing thread pool.
//!
//! Each worker owns a queue; submissions land on the submitter's own queue
//! (when the submitter is a worker), an explicitly chosen queue, or the
//! shared pool queue. Workers drain their own queue first, then the pool
//! queue, then steal round-robin from their peers; a worker that finds
//! nothing spins briefly and finally blocks on a condition variable until
//! the next submission wakes it.
//!
//! [`WorkStealingPool::parallel_for`] and
//! [`WorkStealingPool::parallel_apply`] tile their input across the worker
//! queues and *wait-or-help*: the calling thread executes queued work itself
//! until every tile has finished, so waiting inside the pool never
//! deadlocks.

pub mod counter;
mod handle;
pub mod loom;
mod partition;
mod pool;
pub mod queue;
mod task;

pub use counter::TaskCounter;
pub use handle::{JoinError, TaskHandle};
pub use pool::{Builder, WorkStealingPool, thread_id};
pub use queue::{LockedQueue, SegmentQueue, WorkQueue};
pub use task::Task;
