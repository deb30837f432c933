// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::counter::TaskCounter;
use crate::handle::{TaskHandle, promise};
use crate::loom::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use crate::loom::sync::{Condvar, Mutex};
use crate::partition::tiles;
use crate::queue::{LockedQueue, WorkQueue};
use crate::task::Task;
use core::cell::Cell;
use core::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use strata_util::CachePadded;

std::thread_local! {
    static THREAD_ID: Cell<u32> = const { Cell::new(0) };
    static RR_COUNTER: Cell<usize> = const { Cell::new(0) };
}

/// The calling thread's pool identity: `1..=N` on a worker thread, `0`
/// everywhere else (external submitters share slot 0).
pub fn thread_id() -> u32 {
    THREAD_ID.get()
}

type Callback = Box<dyn Fn() + Send + Sync>;
type BindFn = Box<dyn Fn(usize) + Send + Sync>;

/// How many spin/yield rounds a worker burns through before it gives up and
/// blocks on the condition variable.
const SPIN_ROUNDS: u32 = 100;

/// Configures and spawns a [`WorkStealingPool`].
pub struct Builder {
    num_threads: usize,
    queue_capacity: usize,
    bind_to_core: Option<BindFn>,
    on_thread_start: Option<Callback>,
    on_thread_stop: Option<Callback>,
}

// === impl Builder ===

impl Builder {
    /// Defaults: `available cores - 1` workers (at least one) and a local
    /// queue capacity of 1024.
    pub fn new() -> Self {
        Self {
            num_threads: num_cpus::get().saturating_sub(1).max(1),
            queue_capacity: 1024,
            bind_to_core: None,
            on_thread_start: None,
            on_thread_stop: None,
        }
    }

    #[must_use]
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads.max(1);
        self
    }

    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Installs a core-binding hook. Worker `i` invokes it with
    /// `(i + 1) % available_cores` on startup; without a hook, binding is
    /// skipped.
    #[must_use]
    pub fn bind_to_core(mut self, bind: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.bind_to_core = Some(Box::new(bind));
        self
    }

    /// Runs once on every worker thread before it starts polling.
    #[must_use]
    pub fn on_thread_start(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_thread_start = Some(Box::new(callback));
        self
    }

    /// Runs once on every worker thread right before it exits.
    #[must_use]
    pub fn on_thread_stop(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_thread_stop = Some(Box::new(callback));
        self
    }

    pub fn build<Q: WorkQueue + 'static>(self) -> WorkStealingPool<Q> {
        let num_threads = self.num_threads;
        let shared = Arc::new(Shared {
            pool_queue: Q::with_capacity(self.queue_capacity),
            local_queues: (0..num_threads)
                .map(|_| CachePadded::new(Q::with_capacity(self.queue_capacity)))
                .collect(),
            stop: (0..num_threads)
                .map(|_| CachePadded::new(AtomicBool::new(false)))
                .collect(),
            done: AtomicBool::new(false),
            running: AtomicU32::new(0),
            active: AtomicU32::new(0),
            outstanding: TaskCounter::new(num_threads + 1),
            polling_mutex: Mutex::new(()),
            polling_cond: Condvar::new(),
            bind_to_core: self.bind_to_core,
            on_thread_start: self.on_thread_start,
            on_thread_stop: self.on_thread_stop,
        });

        let threads = (0..num_threads)
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("strata-worker-{index}"))
                    .spawn(move || shared.worker_main(index))
                    .expect("failed to spawn pool worker")
            })
            .collect();

        // wait for every worker to come online so number_threads() and the
        // dispatch targets are stable from here on
        while shared.running.load(Ordering::Relaxed) != num_threads as u32 {
            thread::yield_now();
        }

        WorkStealingPool { shared, threads }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("num_threads", &self.num_threads)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

struct Shared<Q> {
    pool_queue: Q,
    local_queues: Box<[CachePadded<Q>]>,
    stop: Box<[CachePadded<AtomicBool>]>,
    done: AtomicBool,
    running: AtomicU32,
    active: AtomicU32,
    outstanding: TaskCounter,
    polling_mutex: Mutex<()>,
    polling_cond: Condvar,
    bind_to_core: Option<BindFn>,
    on_thread_start: Option<Callback>,
    on_thread_stop: Option<Callback>,
}

/// Worker bookkeeping that must run on every exit path.
struct ExitGuard<'a, Q> {
    shared: &'a Shared<Q>,
}

impl<Q> Drop for ExitGuard<'_, Q> {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::Relaxed);
        self.shared.running.fetch_sub(1, Ordering::Relaxed);
        if let Some(callback) = &self.shared.on_thread_stop {
            callback();
        }
    }
}

// === impl Shared ===

impl<Q: WorkQueue> Shared<Q> {
    fn worker_main(&self, index: usize) {
        let _span = tracing::debug_span!("worker main loop", worker = index).entered();

        if let Some(bind) = &self.bind_to_core {
            bind((index + 1) % num_cpus::get());
        }
        if let Some(callback) = &self.on_thread_start {
            callback();
        }

        self.running.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        let _exit = ExitGuard { shared: self };

        let tid = index as u32 + 1;
        THREAD_ID.set(tid);

        let mut last_stolen = index;
        let mut spincount = 0_u32;
        let mut task = self.poll(index, &mut last_stolen);

        loop {
            if let Some(t) = task.take() {
                self.execute(t, tid);
                if self.stop[index].load(Ordering::Relaxed) {
                    tracing::debug!(worker = index, "stop signal received, shutting down");
                    return;
                }
                spincount = 0;
                task = self.poll(index, &mut last_stolen);
                continue;
            }

            spincount += 1;
            if spincount < SPIN_ROUNDS {
                // yield escalates with the number of empty polls; yielding
                // works better than pause loops for larger payloads
                for _ in 0..spincount * 10 {
                    thread::yield_now();
                }
                if self.stop[index].load(Ordering::Relaxed) {
                    return;
                }
                task = self.poll(index, &mut last_stolen);
            } else {
                self.active.fetch_sub(1, Ordering::Relaxed);
                {
                    let mut guard = self.polling_mutex.lock();
                    loop {
                        task = self.poll(index, &mut last_stolen);
                        if task.is_some()
                            || self.stop[index].load(Ordering::Relaxed)
                            || self.done.load(Ordering::Relaxed)
                        {
                            break;
                        }
                        tracing::trace!(worker = index, "going to sleep");
                        guard = self.polling_cond.wait(guard);
                    }
                }
                self.active.fetch_add(1, Ordering::Relaxed);
                if task.is_none() {
                    tracing::debug!(worker = index, "woke up to shutdown");
                    return;
                }
                spincount = 0;
            }
        }
    }

    /// Local pop, then the shared pool queue, then one round-robin pass over
    /// the peers starting at the previous steal position.
    fn poll(&self, index: usize, last_stolen: &mut usize) -> Option<Task> {
        self.local_queues[index]
            .try_pop()
            .or_else(|| self.pool_queue.try_steal())
            .or_else(|| self.steal_from_peers(last_stolen))
    }

    /// Work sources available to non-owning threads: the pool queue and the
    /// thief end of every worker queue.
    fn pool_or_peer_task(&self, last_stolen: &mut usize) -> Option<Task> {
        self.pool_queue
            .try_steal()
            .or_else(|| self.steal_from_peers(last_stolen))
    }

    fn steal_from_peers(&self, last_stolen: &mut usize) -> Option<Task> {
        let num_queues = self.local_queues.len();
        let mut victim = *last_stolen;
        for _ in 0..num_queues {
            if let Some(task) = self.local_queues[victim].try_steal() {
                tracing::trace!(victim, "stole task");
                *last_stolen = victim;
                return Some(task);
            }
            victim = (victim + 1) % num_queues;
        }
        None
    }

    fn execute(&self, task: Task, tid: u32) {
        if panic::catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
            tracing::debug!("task panicked at the worker boundary; continuing");
        }
        self.outstanding.decrement(tid);
    }

    /// Queue 0 is the pool queue; `1..=N` address the worker queues.
    fn push_to(&self, queue_index: u32, task: Task) -> Result<(), Task> {
        if queue_index == 0 {
            self.pool_queue.try_push(task)
        } else {
            self.local_queues[queue_index as usize - 1].try_push(task)
        }
    }

    /// Wakes one sleeping worker. Passing through the polling mutex closes
    /// the window between a worker's last empty poll and its wait.
    fn wake_one(&self) {
        drop(self.polling_mutex.lock());
        self.polling_cond.notify_one();
    }

    fn set_done(&self) {
        self.done.store(true, Ordering::Relaxed);
        for flag in &self.stop {
            flag.store(true, Ordering::Relaxed);
        }
    }
}

/// A lifetime- and type-erased tile of a `parallel_for`/`parallel_apply`
/// input: raw pointers to the borrowed items and closure plus a
/// monomorphised runner that reconstructs them.
///
/// The erasure is sound because every dispatching call waits for all of its
/// tiles before returning (even when a tile panics), so the borrows outlive
/// the queued tasks; the `Sync` bounds on the public methods make the shared
/// access race-free.
#[derive(Clone, Copy)]
struct Tile {
    items: *const u8,
    f: *const u8,
    start: usize,
    len: usize,
    run: unsafe fn(*const u8, *const u8, usize, usize),
}

// Safety: see the type docs; access to the pointees is `&`-only and the
// public bounds require `Sync`.
unsafe impl Send for Tile {}

impl Tile {
    unsafe fn run_slice<T, F: Fn(&T)>(items: *const u8, f: *const u8, start: usize, len: usize) {
        // Safety: `items` is the base of the dispatched `&[T]` and
        // `start..start + len` lies within it; `f` points at the dispatched
        // closure. Both are kept alive by the waiting caller.
        unsafe {
            let items = core::slice::from_raw_parts(items.cast::<T>().add(start), len);
            let f = &*f.cast::<F>();
            for item in items {
                f(item);
            }
        }
    }

    unsafe fn run_range<F: Fn(usize)>(_items: *const u8, f: *const u8, start: usize, len: usize) {
        // Safety: `f` points at the dispatched closure, kept alive by the
        // waiting caller.
        let f = unsafe { &*f.cast::<F>() };
        for i in start..start + len {
            f(i);
        }
    }

    fn execute(self) {
        // Safety: `run` was instantiated for the pointee types in the same
        // dispatch that erased them.
        unsafe { (self.run)(self.items, self.f, self.start, self.len) }
    }
}

/// Increments a consumed-tile counter when dropped, so a tile counts even
/// if its body unwinds.
struct CountOnDrop {
    counter: *const TaskCounter,
}

// Safety: `TaskCounter` is `Sync`; the dispatching call keeps it alive.
unsafe impl Send for CountOnDrop {}

impl Drop for CountOnDrop {
    fn drop(&mut self) {
        // Safety: the dispatching `parallel_*` call waits for every tile
        // before returning, keeping the counter alive.
        unsafe { (*self.counter).increment(thread_id()) }
    }
}

/// A work-stealing pool of `N` OS worker threads.
///
/// Every worker owns a queue of type `Q`; a shared pool queue takes
/// submissions from outside. See the crate docs for the scheduling policy.
pub struct WorkStealingPool<Q: WorkQueue + 'static = LockedQueue> {
    shared: Arc<Shared<Q>>,
    threads: Vec<thread::JoinHandle<()>>,
}

// === impl WorkStealingPool ===

impl WorkStealingPool<LockedQueue> {
    /// A pool of `num_threads` workers over the default locked queues.
    pub fn new(num_threads: usize) -> Self {
        Builder::new().num_threads(num_threads).build()
    }
}

impl<Q: WorkQueue + 'static> WorkStealingPool<Q> {
    pub fn builder() -> Builder {
        Builder::new()
    }

    fn worker_count(&self) -> usize {
        self.shared.local_queues.len()
    }

    /// The number of workers currently running their main loop.
    pub fn number_threads(&self) -> u32 {
        self.shared.running.load(Ordering::Relaxed)
    }

    pub fn has_outstanding_tasks(&self) -> bool {
        self.shared.outstanding.count() != 0
    }

    /// A biased round-robin queue index in `1..=N`, useful for spreading
    /// explicit submissions over the workers.
    pub fn rnd_queue_index(&self) -> u32 {
        let num_queues = self.worker_count();
        RR_COUNTER.with(|counter| {
            let id = counter.get().wrapping_add(1);
            counter.set(id);
            (id % num_queues + 1) as u32
        })
    }

    /// Submits a task and returns a handle to its result.
    ///
    /// Worker threads enqueue onto their own queue; external submitters go
    /// through the shared pool queue. If the target queue is full the task
    /// runs inline on the calling thread; if the pool has shut down the
    /// handle reports [`Canceled`][crate::JoinError::Canceled].
    pub fn send<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.send_impl(self.caller_queue_index(), f)
    }

    /// Submits a task to an explicit queue: index 0 is the pool queue,
    /// `1..=N` are the worker queues.
    ///
    /// # Panics
    ///
    /// Panics if `queue_index > N`.
    pub fn send_to<T, F>(&self, queue_index: u32, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        assert!(queue_index as usize <= self.worker_count());
        self.send_impl(queue_index, f)
    }

    /// Fire-and-forget submission. The task must not panic; a panic is
    /// caught and dropped at the worker boundary.
    pub fn send_no_future<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.send_no_future_impl(self.caller_queue_index(), f);
    }

    /// Fire-and-forget submission to an explicit queue (see
    /// [`send_to`][Self::send_to]).
    ///
    /// # Panics
    ///
    /// Panics if `queue_index > N`.
    pub fn send_no_future_to<F>(&self, queue_index: u32, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(queue_index as usize <= self.worker_count());
        self.send_no_future_impl(queue_index, f);
    }

    /// A worker of *this* pool targets its own queue; everyone else
    /// (including workers of other pools) targets the pool queue.
    fn caller_queue_index(&self) -> u32 {
        let tid = thread_id();
        if (tid as usize) <= self.worker_count() {
            tid
        } else {
            0
        }
    }

    fn send_impl<T, F>(&self, queue_index: u32, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (promise, handle) = promise::<T>();
        if self.shared.done.load(Ordering::Relaxed) {
            // submission after shutdown is a no-op; dropping the unfulfilled
            // promise rejects the handle
            drop(promise);
            return handle;
        }

        let tid = thread_id();
        self.shared.outstanding.increment(tid);
        let task = Task::new(move || {
            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(value) => promise.complete(value),
                Err(payload) => promise.panicked(payload),
            }
        });

        match self.shared.push_to(queue_index, task) {
            Ok(()) => self.shared.wake_one(),
            Err(task) => {
                // bounded queue full: execute inline on the submitter
                tracing::trace!(queue_index, "queue full, running task inline");
                task.run();
                self.shared.outstanding.decrement(tid);
            }
        }
        handle
    }

    fn send_no_future_impl<F>(&self, queue_index: u32, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.done.load(Ordering::Relaxed) {
            return;
        }

        let tid = thread_id();
        self.shared.outstanding.increment(tid);
        let task = Task::new(move || {
            let _ = panic::catch_unwind(AssertUnwindSafe(f));
        });

        match self.shared.push_to(queue_index, task) {
            Ok(()) => self.shared.wake_one(),
            Err(task) => {
                tracing::trace!(queue_index, "queue full, running task inline");
                task.run();
                self.shared.outstanding.decrement(tid);
            }
        }
    }

    /// Executes queued work on the calling thread until `pred` holds.
    ///
    /// This is the deadlock-free way to wait for pool-internal conditions
    /// from inside a task: the waiter drains the pool queue and steals from
    /// the workers instead of blocking.
    pub fn wait_for(&self, mut pred: impl FnMut() -> bool) {
        let tid = thread_id();
        let mut last_stolen = 0_usize;
        while !pred() {
            if let Some(task) = self.shared.pool_or_peer_task(&mut last_stolen) {
                self.shared.execute(task, tid);
            } else {
                thread::yield_now();
            }
        }
    }

    /// Waits until no submitted task is outstanding, helping with queued
    /// work meanwhile.
    pub fn wait_for_all_tasks(&self) {
        self.wait_for(|| !self.has_outstanding_tasks());
    }

    /// Executes at most one queued task on the calling thread.
    pub fn do_work(&self) {
        let tid = thread_id();
        let mut last_stolen = 0_usize;
        if let Some(task) = self.shared.pool_or_peer_task(&mut last_stolen) {
            self.shared.execute(task, tid);
        }
    }

    /// Blocks until every handle is ready, executing queued work while any
    /// is not. Re-invoking on all-ready handles performs no dequeues.
    pub fn wait_or_work<T>(&self, handles: &[TaskHandle<T>]) {
        let tid = thread_id();
        let mut last_stolen = 0_usize;
        for handle in handles {
            while !handle.is_ready() {
                if let Some(task) = self.shared.pool_or_peer_task(&mut last_stolen) {
                    self.shared.execute(task, tid);
                } else {
                    thread::yield_now();
                }
            }
        }
    }

    fn default_partitions(&self) -> usize {
        let num_threads = self.worker_count();
        num_threads * num_threads
    }

    /// Applies `f` to every element of `items`, tiled across the workers.
    /// The call returns once every tile has run; the calling thread helps
    /// execute queued work while it waits. A panic in `f` is re-raised here
    /// after all tiles have finished.
    pub fn parallel_for<T, F>(&self, items: &[T], f: F)
    where
        T: Sync,
        F: Fn(&T) + Send + Sync,
    {
        self.parallel_for_partitioned(items, f, self.default_partitions());
    }

    pub fn parallel_for_partitioned<T, F>(&self, items: &[T], f: F, npartitions: usize)
    where
        T: Sync,
        F: Fn(&T) + Send + Sync,
    {
        let template = Tile {
            items: items.as_ptr().cast::<u8>(),
            f: (&raw const f).cast::<u8>(),
            start: 0,
            len: 0,
            run: Tile::run_slice::<T, F>,
        };
        self.dispatch_collecting(items.len(), npartitions, template);
    }

    /// Invokes `f(i)` for every `i` in `0..count`, tiled across the workers.
    pub fn parallel_apply<F>(&self, count: usize, f: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        self.parallel_apply_partitioned(count, f, self.default_partitions());
    }

    pub fn parallel_apply_partitioned<F>(&self, count: usize, f: F, npartitions: usize)
    where
        F: Fn(usize) + Send + Sync,
    {
        let template = Tile {
            items: core::ptr::null(),
            f: (&raw const f).cast::<u8>(),
            start: 0,
            len: 0,
            run: Tile::run_range::<F>,
        };
        self.dispatch_collecting(count, npartitions, template);
    }

    /// Futures path shared by `parallel_for` and `parallel_apply`: tile,
    /// dispatch round-robin, wait-or-help, then re-raise the first tile
    /// panic once everything has finished.
    fn dispatch_collecting(&self, total: usize, npartitions: usize, template: Tile) {
        let num_threads = self.worker_count();
        let mut handles = Vec::with_capacity(npartitions.min(total));
        let mut njobs = 0_usize;

        for range in tiles(total, npartitions) {
            njobs += 1;
            let target = (njobs % num_threads + 1) as u32;
            let tile = Tile {
                start: range.start,
                len: range.len(),
                ..template
            };
            handles.push(self.send_to(target, move || tile.execute()));
        }

        self.wait_or_work(&handles);
        for handle in handles {
            if let Err(err) = handle.join()
                && let Some(payload) = err.into_panic()
            {
                panic::resume_unwind(payload);
            }
        }
    }

    /// The fast path for tiles that must not panic: no futures are
    /// allocated, completion is tracked by a sharded consumed counter, and
    /// the caller waits (helping) until every tile has counted itself.
    /// A panicking tile is swallowed at the worker boundary but still
    /// counts, so the wait always terminates.
    pub fn parallel_for_noexcept<T, F>(&self, items: &[T], f: F)
    where
        T: Sync,
        F: Fn(&T) + Send + Sync,
    {
        self.parallel_for_noexcept_partitioned(items, f, self.default_partitions());
    }

    pub fn parallel_for_noexcept_partitioned<T, F>(&self, items: &[T], f: F, npartitions: usize)
    where
        T: Sync,
        F: Fn(&T) + Send + Sync,
    {
        let template = Tile {
            items: items.as_ptr().cast::<u8>(),
            f: (&raw const f).cast::<u8>(),
            start: 0,
            len: 0,
            run: Tile::run_slice::<T, F>,
        };
        self.dispatch_counting(items.len(), npartitions, template);
    }

    /// Index variant of [`parallel_for_noexcept`][Self::parallel_for_noexcept].
    pub fn parallel_apply_noexcept<F>(&self, count: usize, f: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        self.parallel_apply_noexcept_partitioned(count, f, self.default_partitions());
    }

    pub fn parallel_apply_noexcept_partitioned<F>(&self, count: usize, f: F, npartitions: usize)
    where
        F: Fn(usize) + Send + Sync,
    {
        let template = Tile {
            items: core::ptr::null(),
            f: (&raw const f).cast::<u8>(),
            start: 0,
            len: 0,
            run: Tile::run_range::<F>,
        };
        self.dispatch_counting(count, npartitions, template);
    }

    /// Counter-gated fast path shared by the `_noexcept` variants: each tile
    /// bumps the consumed counter through a drop guard (so a panicking tile
    /// still counts) and the caller helps until every tile has reported in.
    fn dispatch_counting(&self, total: usize, npartitions: usize, template: Tile) {
        let num_threads = self.worker_count();
        let consumed = TaskCounter::new(num_threads + 1);
        let counter = &raw const consumed;
        let mut njobs = 0_i64;

        for range in tiles(total, npartitions) {
            njobs += 1;
            let target = (njobs as usize % num_threads + 1) as u32;
            let tile = Tile {
                start: range.start,
                len: range.len(),
                ..template
            };
            let tick = CountOnDrop { counter };
            self.send_no_future_to(target, move || {
                let _tick = tick;
                tile.execute();
            });
        }

        self.wait_for(|| consumed.count() == njobs);
    }
}

impl<Q: WorkQueue + 'static> Drop for WorkStealingPool<Q> {
    fn drop(&mut self) {
        tracing::debug!("shutting down pool");
        {
            let _guard = self.shared.polling_mutex.lock();
            self.shared.set_done();
        }
        self.shared.polling_cond.notify_all();

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        // tasks still queued at this point are dropped with the queues;
        // their promises cancel the associated handles
    }
}

impl<Q: WorkQueue + 'static> fmt::Debug for WorkStealingPool<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkStealingPool")
            .field("workers", &self.worker_count())
            .field("running", &self.shared.running.load(Ordering::Relaxed))
            .field("active", &self.shared.active.load(Ordering::Relaxed))
            .field("outstanding", &self.shared.outstanding.count())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::queue::SegmentQueue;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    fn init_tracing() -> tracing::subscriber::DefaultGuard {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .set_default()
    }

    #[test]
    fn no_lost_updates() {
        let _trace = init_tracing();
        let pool = WorkStealingPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..1_000)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.send(move || {
                    counter.fetch_add(1, AtomicOrdering::Relaxed);
                })
            })
            .collect();

        pool.wait_or_work(&handles);
        pool.wait_for_all_tasks();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 1_000);
    }

    #[test]
    fn send_returns_the_value() {
        let pool = WorkStealingPool::new(2);
        let handle = pool.send(|| 6 * 7);
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn panic_propagates_through_the_handle() {
        let pool = WorkStealingPool::new(2);
        let handle = pool.send(|| -> u32 { panic!("x") });
        let payload = handle.join().unwrap_err().into_panic().unwrap();
        assert_eq!(*payload.downcast::<&str>().unwrap(), "x");
    }

    #[test]
    fn workers_see_their_thread_ids() {
        let pool = WorkStealingPool::new(3);
        assert_eq!(thread_id(), 0, "submitters are id 0");

        let handles: Vec<_> = (0..32).map(|_| pool.send(thread_id)).collect();
        for handle in handles {
            let tid = handle.join().unwrap();
            assert!((1..=3).contains(&tid));
        }
    }

    #[test]
    fn send_to_targets_an_explicit_queue() {
        let pool = WorkStealingPool::new(2);
        // queue 0 is the pool queue, 1..=N the workers; all must execute
        for queue in 0..=2 {
            let handle = pool.send_to(queue, move || queue);
            assert_eq!(handle.join().unwrap(), queue);
        }
    }

    #[test]
    fn parallel_apply_noexcept_counts_every_index() {
        let _trace = init_tracing();
        let pool = WorkStealingPool::new(num_cpus::get().saturating_sub(1).max(2));

        for _ in 0..20 {
            let hits = AtomicUsize::new(0);
            pool.parallel_apply_noexcept(65_536, |_| {
                hits.fetch_add(1, AtomicOrdering::Relaxed);
            });
            assert_eq!(hits.load(AtomicOrdering::Relaxed), 65_536);
        }
    }

    #[test]
    fn parallel_for_visits_each_element_exactly_once() {
        let pool = WorkStealingPool::new(4);
        let items: Vec<AtomicUsize> = (0..10_000).map(|_| AtomicUsize::new(0)).collect();

        pool.parallel_for(&items, |item| {
            item.fetch_add(1, AtomicOrdering::Relaxed);
        });

        assert!(items.iter().all(|i| i.load(AtomicOrdering::Relaxed) == 1));
    }

    #[test]
    fn parallel_for_partitioned_respects_odd_partition_counts() {
        let pool = WorkStealingPool::new(3);
        let items: Vec<AtomicUsize> = (0..1_003).map(|_| AtomicUsize::new(0)).collect();

        pool.parallel_for_partitioned(
            &items,
            |item| {
                item.fetch_add(1, AtomicOrdering::Relaxed);
            },
            7,
        );

        assert!(items.iter().all(|i| i.load(AtomicOrdering::Relaxed) == 1));
    }

    #[test]
    fn parallel_apply_covers_the_range() {
        let pool = WorkStealingPool::new(4);
        let seen: Vec<AtomicUsize> = (0..4_096).map(|_| AtomicUsize::new(0)).collect();
        let seen_ref = &seen;

        pool.parallel_apply(4_096, |i| {
            seen_ref[i].fetch_add(1, AtomicOrdering::Relaxed);
        });

        assert!(seen.iter().all(|s| s.load(AtomicOrdering::Relaxed) == 1));
    }

    #[test]
    fn parallel_for_propagates_tile_panics_after_completion() {
        let pool = WorkStealingPool::new(2);
        let items: Vec<usize> = (0..64).collect();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            pool.parallel_for(&items, |&i| {
                if i == 17 {
                    panic!("tile failure");
                }
            });
        }));
        assert!(result.is_err());
        // the pool stays usable afterwards
        assert_eq!(pool.send(|| 5).join().unwrap(), 5);
    }

    #[test]
    fn wait_or_work_is_idempotent_on_ready_handles() {
        let pool = WorkStealingPool::new(2);
        let handles: Vec<_> = (0..16).map(|i| pool.send(move || i)).collect();

        pool.wait_or_work(&handles);
        pool.wait_or_work(&handles);
        assert!(handles.iter().all(TaskHandle::is_ready));
    }

    #[test]
    fn shutdown_with_outstanding_tasks_joins_cleanly() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkStealingPool::new(2);
        let mut handles = Vec::new();
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            handles.push(pool.send(move || {
                std::thread::sleep(std::time::Duration::from_micros(100));
                counter.fetch_add(1, AtomicOrdering::Relaxed);
            }));
        }
        // drop with work still in flight; the destructor must join without
        // deadlocking, and every handle must resolve one way or the other
        drop(pool);
        for handle in handles {
            let _ = handle.join();
        }
    }

    #[test]
    fn start_stop_callbacks_run_once_per_worker() {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));

        let pool: WorkStealingPool = {
            let starts = Arc::clone(&starts);
            let stops = Arc::clone(&stops);
            Builder::new()
                .num_threads(3)
                .on_thread_start(move || {
                    starts.fetch_add(1, AtomicOrdering::SeqCst);
                })
                .on_thread_stop(move || {
                    stops.fetch_add(1, AtomicOrdering::SeqCst);
                })
                .build()
        };

        assert_eq!(starts.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(pool.number_threads(), 3);
        drop(pool);
        assert_eq!(stops.load(AtomicOrdering::SeqCst), 3);
    }

    #[test]
    fn bind_hook_sees_every_worker() {
        let bound = Arc::new(AtomicUsize::new(0));
        let pool: WorkStealingPool = {
            let bound = Arc::clone(&bound);
            Builder::new()
                .num_threads(2)
                .bind_to_core(move |core| {
                    assert!(core < num_cpus::get());
                    bound.fetch_add(1, AtomicOrdering::SeqCst);
                })
                .build()
        };
        assert_eq!(bound.load(AtomicOrdering::SeqCst), 2);
        drop(pool);
    }

    #[test]
    fn lock_free_queue_variant_works() {
        let pool: WorkStealingPool<SegmentQueue> =
            Builder::new().num_threads(3).build();
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..512)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.send(move || {
                    counter.fetch_add(1, AtomicOrdering::Relaxed);
                })
            })
            .collect();
        pool.wait_or_work(&handles);
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 512);

        let hits = AtomicUsize::new(0);
        pool.parallel_apply_noexcept(10_000, |_| {
            hits.fetch_add(1, AtomicOrdering::Relaxed);
        });
        assert_eq!(hits.load(AtomicOrdering::Relaxed), 10_000);
    }

    #[test]
    fn rnd_queue_index_stays_in_worker_range() {
        let pool = WorkStealingPool::new(3);
        for _ in 0..64 {
            let index = pool.rnd_queue_index();
            assert!((1..=3).contains(&index));
        }
    }
}
