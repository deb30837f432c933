// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deferred node reclamation.
//!
//! Skip-list erasure unlinks a node while other threads may still hold
//! pointers into it (through entries, iterators, or an in-flight search).
//! Instead of destroying the node in place, writers hand it to the
//! [`ScopeManager`], which parks it on a pending list until the number of
//! outstanding *checkouts* drops to zero. A checkout is held for the duration
//! of every container operation and for the lifetime of every entry/iterator,
//! so a reader never observes freed memory.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use parking_lot::Mutex;

/// Implemented by node types that can be destroyed by the [`ScopeManager`].
///
/// # Safety
///
/// `destroy` must drop the node in place and release the exact allocation it
/// was created with, and must be safe to call on any node that has been
/// handed to [`ScopeManager::defer_destroy`] exactly once.
pub(crate) unsafe trait Retire {
    unsafe fn destroy(ptr: NonNull<Self>);
}

/// Tracks reader checkouts and retired nodes for one container.
pub(crate) struct ScopeManager<N: Retire> {
    checkouts: AtomicU32,
    has_pending: AtomicBool,
    pending: Mutex<Vec<NonNull<N>>>,
}

// Safety: the manager only stores raw node pointers; ownership of the nodes
// themselves is governed by the container, which requires Send payloads.
unsafe impl<N: Retire> Send for ScopeManager<N> {}
// Safety: all shared state is behind atomics or the pending-list mutex.
unsafe impl<N: Retire> Sync for ScopeManager<N> {}

// === impl ScopeManager ===

impl<N: Retire> ScopeManager<N> {
    pub(crate) fn new() -> Self {
        Self {
            checkouts: AtomicU32::new(0),
            has_pending: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub(crate) fn add_checkout(&self) {
        self.checkouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Releases a checkout. The releaser that drops the count to zero drains
    /// the pending list and destroys every node on it.
    pub(crate) fn remove_checkout(&self) {
        let prev = self.checkouts.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);

        if prev == 1 && self.has_pending.load(Ordering::Relaxed) {
            let drained = {
                let mut pending = self.pending.lock();
                // Re-check under the lock: a new checkout may have appeared
                // and followed a pointer into the pending set.
                if self.checkouts.load(Ordering::Relaxed) != 0 {
                    return;
                }
                self.has_pending.store(false, Ordering::Relaxed);
                core::mem::take(&mut *pending)
            };

            for node in drained {
                // Safety: nodes on the pending list were unlinked by their
                // eraser and are owned exclusively by this list; the zero
                // checkout count means no reader can still hold a pointer.
                unsafe { N::destroy(node) };
            }
        }
    }

    /// Parks an unlinked node for destruction once all checkouts are gone.
    pub(crate) fn defer_destroy(&self, node: NonNull<N>) {
        let mut pending = self.pending.lock();
        pending.push(node);
        self.has_pending.store(true, Ordering::Relaxed);
    }
}

/// Brackets a container operation with a reader checkout so that no node the
/// operation dereferences can be reclaimed mid-flight.
pub(crate) struct OpGuard<'a, N: Retire> {
    pub(crate) scope: &'a ScopeManager<N>,
}

impl<'a, N: Retire> OpGuard<'a, N> {
    pub(crate) fn enter(scope: &'a ScopeManager<N>) -> Self {
        scope.add_checkout();
        Self { scope }
    }
}

impl<N: Retire> Drop for OpGuard<'_, N> {
    fn drop(&mut self) {
        self.scope.remove_checkout();
    }
}

impl<N: Retire> Drop for ScopeManager<N> {
    fn drop(&mut self) {
        // There should not be any entries or iterators checked out at this
        // point; the container borrow rules guarantee it.
        debug_assert_eq!(self.checkouts.load(Ordering::Relaxed), 0);

        for node in self.pending.get_mut().drain(..) {
            // Safety: exclusive access; pending nodes are unlinked and owned
            // by this list.
            unsafe { N::destroy(node) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    static DESTROYED: AtomicUsize = AtomicUsize::new(0);

    struct TestNode(#[allow(dead_code)] u64);

    unsafe impl Retire for TestNode {
        unsafe fn destroy(ptr: NonNull<Self>) {
            DESTROYED.fetch_add(1, Ordering::SeqCst);
            // Safety: created via Box::into_raw below
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        }
    }

    fn leak_node(v: u64) -> NonNull<TestNode> {
        NonNull::new(Box::into_raw(Box::new(TestNode(v)))).unwrap()
    }

    #[test]
    fn defers_until_last_checkout() {
        DESTROYED.store(0, Ordering::SeqCst);
        let mgr = ScopeManager::<TestNode>::new();

        mgr.add_checkout();
        mgr.add_checkout();
        mgr.defer_destroy(leak_node(1));
        mgr.defer_destroy(leak_node(2));

        mgr.remove_checkout();
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);

        mgr.remove_checkout();
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn drop_drains_pending() {
        DESTROYED.store(0, Ordering::SeqCst);
        {
            let mgr = ScopeManager::<TestNode>::new();
            mgr.defer_destroy(leak_node(3));
        }
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn checkout_during_drain_window_blocks_reclaim() {
        DESTROYED.store(0, Ordering::SeqCst);
        let mgr = ScopeManager::<TestNode>::new();

        mgr.add_checkout();
        mgr.defer_destroy(leak_node(4));
        mgr.add_checkout();
        mgr.remove_checkout();
        // one checkout still live
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);
        mgr.remove_checkout();
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
    }
}
