// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::marker::PhantomData;
use core::mem::{self, ManuallyDrop, MaybeUninit};
use static_assertions::const_assert;

/// Inline payload capacity in words. Together with the vtable pointer this
/// keeps a `Task` within a single (64-byte) cache line on 64-bit targets.
const INLINE_WORDS: usize = 7;

type Storage = MaybeUninit<[usize; INLINE_WORDS]>;

const_assert!(mem::size_of::<Storage>() + mem::size_of::<usize>() <= 64);

/// A type-erased, move-only callable.
///
/// Closures whose size and alignment fit the inline storage are stored in
/// place; larger ones fall back to a single heap allocation. Dispatch goes
/// through a per-closure-type vtable, so running or dropping a task is one
/// indirect call either way.
#[repr(C)]
pub struct Task {
    storage: Storage,
    vtable: &'static VTable,
}

// Safety: `Task::new` requires the erased closure to be `Send`, and the
// storage is never aliased.
unsafe impl Send for Task {}

struct VTable {
    /// Consumes the payload: moves the closure out of the storage and calls
    /// it. The storage must not be touched again afterwards.
    call: unsafe fn(*mut Storage),
    /// Drops the payload without calling it.
    drop: unsafe fn(*mut Storage),
}

struct Harness<F>(PhantomData<F>);

impl<F: FnOnce() + Send + 'static> Harness<F> {
    const fn fits_inline() -> bool {
        mem::size_of::<F>() <= mem::size_of::<Storage>()
            && mem::align_of::<F>() <= mem::align_of::<Storage>()
    }

    const INLINE: VTable = VTable {
        call: Self::call_inline,
        drop: Self::drop_inline,
    };

    const BOXED: VTable = VTable {
        call: Self::call_boxed,
        drop: Self::drop_boxed,
    };

    unsafe fn call_inline(storage: *mut Storage) {
        // Safety: the storage was initialised with an `F` in `Task::new` and
        // is consumed exactly once.
        let f = unsafe { storage.cast::<F>().read() };
        f();
    }

    unsafe fn drop_inline(storage: *mut Storage) {
        // Safety: as in `call_inline`; dropped exactly once, never called.
        unsafe { storage.cast::<F>().drop_in_place() }
    }

    unsafe fn call_boxed(storage: *mut Storage) {
        // Safety: the storage holds a `Box<F>` raw pointer written in
        // `Task::new`; it is consumed exactly once.
        let f = unsafe { Box::from_raw(storage.cast::<*mut F>().read()) };
        f();
    }

    unsafe fn drop_boxed(storage: *mut Storage) {
        // Safety: as in `call_boxed`.
        drop(unsafe { Box::from_raw(storage.cast::<*mut F>().read()) });
    }
}

// === impl Task ===

impl Task {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut storage = Storage::uninit();
        let fits_inline = const { Harness::<F>::fits_inline() };

        let vtable = if fits_inline {
            // Safety: size and alignment were checked; the storage is
            // exclusively owned.
            unsafe { storage.as_mut_ptr().cast::<F>().write(f) };
            &Harness::<F>::INLINE
        } else {
            let raw = Box::into_raw(Box::new(f));
            // Safety: a thin pointer always fits the first storage word.
            unsafe { storage.as_mut_ptr().cast::<*mut F>().write(raw) };
            &Harness::<F>::BOXED
        };

        Self { storage, vtable }
    }

    /// Runs the erased closure, consuming the task.
    pub fn run(self) {
        let mut this = ManuallyDrop::new(self);
        // Safety: `ManuallyDrop` suppresses the destructor, so the payload
        // is consumed exactly once by `call`.
        unsafe { (this.vtable.call)(&raw mut this.storage) }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // Safety: the payload is still live (run() suppresses this drop).
        unsafe { (self.vtable.drop)(&raw mut self.storage) }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Task { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn small_closure_runs_inline() {
        let ran = Arc::new(AtomicUsize::new(0));
        let task = {
            let ran = Arc::clone(&ran);
            Task::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        };
        task.run();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn large_closure_is_boxed_and_runs() {
        let payload = [7_u8; 256];
        let ran = Arc::new(AtomicUsize::new(0));
        let task = {
            let ran = Arc::clone(&ran);
            Task::new(move || {
                assert!(payload.iter().all(|&b| b == 7));
                ran.fetch_add(1, Ordering::SeqCst);
            })
        };
        task.run();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_an_unran_task_drops_the_closure() {
        struct Canary(Arc<AtomicUsize>);
        impl Drop for Canary {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));

        // inline payload
        let canary = Canary(Arc::clone(&drops));
        drop(Task::new(move || drop(canary)));
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        // boxed payload
        let canary = Canary(Arc::clone(&drops));
        let ballast = [0_u8; 256];
        drop(Task::new(move || {
            let _ = ballast;
            drop(canary);
        }));
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }
}
