// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Facade over the sync primitives so the same sources compile against
//! `std`/`parking_lot` in normal builds and against `loom`'s model checker
//! under `--cfg loom`.
//!
//! Both branches expose the consuming `Condvar::wait(guard) -> guard` shape;
//! the non-loom branch adapts `parking_lot`'s borrowing API to it.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(loom)] {
        #[cfg(test)]
        pub(crate) use loom::thread;
        #[cfg(test)]
        pub(crate) use loom::model;

        pub(crate) mod sync {
            pub(crate) use loom::sync::atomic;

            pub(crate) struct Mutex<T>(loom::sync::Mutex<T>);

            pub(crate) type MutexGuard<'a, T> = loom::sync::MutexGuard<'a, T>;

            impl<T> Mutex<T> {
                pub(crate) fn new(value: T) -> Self {
                    Self(loom::sync::Mutex::new(value))
                }

                pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
                    self.0.lock().expect("mutex poisoned")
                }
            }

            pub(crate) struct Condvar(loom::sync::Condvar);

            impl Condvar {
                pub(crate) fn new() -> Self {
                    Self(loom::sync::Condvar::new())
                }

                pub(crate) fn notify_one(&self) {
                    self.0.notify_one();
                }

                pub(crate) fn notify_all(&self) {
                    self.0.notify_all();
                }

                pub(crate) fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
                    self.0.wait(guard).expect("mutex poisoned")
                }
            }
        }
    } else {
        #[cfg(test)]
        pub(crate) use std::thread;

        #[cfg(test)]
        #[inline(always)]
        pub(crate) fn model<R>(f: impl FnOnce() -> R) -> R {
            f()
        }

        pub(crate) mod sync {
            pub(crate) use core::sync::atomic;

            pub(crate) struct Mutex<T>(parking_lot::Mutex<T>);

            pub(crate) type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

            impl<T> Mutex<T> {
                pub(crate) fn new(value: T) -> Self {
                    Self(parking_lot::Mutex::new(value))
                }

                #[inline]
                pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
                    self.0.lock()
                }
            }

            pub(crate) struct Condvar(parking_lot::Condvar);

            impl Condvar {
                pub(crate) fn new() -> Self {
                    Self(parking_lot::Condvar::new())
                }

                #[inline]
                pub(crate) fn notify_one(&self) {
                    self.0.notify_one();
                }

                #[inline]
                pub(crate) fn notify_all(&self) {
                    self.0.notify_all();
                }

                #[inline]
                pub(crate) fn wait<'a, T>(&self, mut guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
                    self.0.wait(&mut guard);
                    guard
                }
            }
        }
    }
}
