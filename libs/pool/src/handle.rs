// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::loom::sync::{Condvar, Mutex};
use core::any::Any;
use core::fmt;
use std::sync::Arc;

/// Creates a connected promise/handle pair for one task outcome.
pub(crate) fn promise<T>() -> (Promise<T>, TaskHandle<T>) {
    let inner = Arc::new(Inner {
        slot: Mutex::new(None),
        ready: AtomicBool::new(false),
        cond: Condvar::new(),
    });

    (
        Promise {
            inner: Some(Arc::clone(&inner)),
        },
        TaskHandle { inner },
    )
}

struct Inner<T> {
    slot: Mutex<Option<Result<T, JoinError>>>,
    ready: AtomicBool,
    cond: Condvar,
}

/// Why a task produced no value.
pub enum JoinError {
    /// The task panicked; the payload is what `panic!` carried.
    Panicked(Box<dyn Any + Send + 'static>),
    /// The task was discarded before it ran (the pool shut down, or the
    /// submission was rejected after shutdown).
    Canceled,
}

// === impl JoinError ===

impl JoinError {
    /// The panic payload, if the task panicked.
    pub fn into_panic(self) -> Option<Box<dyn Any + Send + 'static>> {
        match self {
            JoinError::Panicked(payload) => Some(payload),
            JoinError::Canceled => None,
        }
    }
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Panicked(_) => f.pad("Panicked(..)"),
            JoinError::Canceled => f.pad("Canceled"),
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Panicked(_) => f.pad("task panicked"),
            JoinError::Canceled => f.pad("task was canceled before running"),
        }
    }
}

impl core::error::Error for JoinError {}

/// The producing end of a [`TaskHandle`].
///
/// Dropping an unfulfilled promise cancels the handle, which is how queued
/// tasks that are discarded at pool teardown report [`JoinError::Canceled`].
pub(crate) struct Promise<T> {
    inner: Option<Arc<Inner<T>>>,
}

// === impl Promise ===

impl<T> Promise<T> {
    pub(crate) fn complete(mut self, value: T) {
        self.fulfil(Ok(value));
    }

    pub(crate) fn panicked(mut self, payload: Box<dyn Any + Send + 'static>) {
        self.fulfil(Err(JoinError::Panicked(payload)));
    }

    fn fulfil(&mut self, outcome: Result<T, JoinError>) {
        let inner = self.inner.take().expect("promise already fulfilled");
        {
            let mut slot = inner.slot.lock();
            *slot = Some(outcome);
            inner.ready.store(true, Ordering::Release);
        }
        inner.cond.notify_all();
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.fulfil(Err(JoinError::Canceled));
        }
    }
}

/// The consuming end of a submitted task: a future supporting a
/// non-blocking readiness check, a blocking wait, and a one-shot `join`.
pub struct TaskHandle<T> {
    inner: Arc<Inner<T>>,
}

// === impl TaskHandle ===

impl<T> TaskHandle<T> {
    /// Whether the outcome is available without blocking.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Blocks until the outcome is available.
    pub fn wait(&self) {
        if self.is_ready() {
            return;
        }
        let mut slot = self.inner.slot.lock();
        while slot.is_none() {
            slot = self.inner.cond.wait(slot);
        }
    }

    /// Blocks until the task finishes and returns its result. A panicking
    /// task surfaces as [`JoinError::Panicked`], a discarded one as
    /// [`JoinError::Canceled`].
    pub fn join(self) -> Result<T, JoinError> {
        self.wait();
        let mut slot = self.inner.slot.lock();
        slot.take().expect("task outcome already taken")
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;

    #[test]
    fn complete_then_join() {
        loom::model(|| {
            let (promise, handle) = promise::<u32>();
            assert!(!handle.is_ready());

            let producer = loom::thread::spawn(move || promise.complete(42));
            assert_eq!(handle.join().unwrap(), 42);
            producer.join().unwrap();
        });
    }

    #[test]
    fn dropped_promise_cancels() {
        loom::model(|| {
            let (promise, handle) = promise::<u32>();
            drop(promise);
            assert!(handle.is_ready());
            assert!(matches!(handle.join(), Err(JoinError::Canceled)));
        });
    }

    #[test]
    fn panic_payload_is_transported() {
        loom::model(|| {
            let (promise, handle) = promise::<u32>();
            promise.panicked(Box::new("boom"));
            let payload = handle.join().unwrap_err().into_panic().unwrap();
            assert_eq!(*payload.downcast::<&str>().unwrap(), "boom");
        });
    }
}
