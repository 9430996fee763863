// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::util::Backoff;

/// A spin lock for the short critical sections of the engine's cold paths (wait list links,
/// the work-stealing overflow queue, consumer sleep bookkeeping).
///
/// Critical sections guarded by this lock never suspend and never call into user code.
pub(crate) type SpinMutex<T> = lock_api::Mutex<RawSpinMutex, T>;
pub(crate) type SpinMutexGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinMutex, T>;

pub(crate) struct RawSpinMutex {
    lock: AtomicBool,
}

// Safety: `lock` only returns once the `false -> true` transition of the flag succeeded with
// `Acquire` ordering and `unlock` publishes with `Release`, so the lock is exclusive.
unsafe impl lock_api::RawMutex for RawSpinMutex {
    type GuardMarker = lock_api::GuardSend;

    #[expect(clippy::declare_interior_mutable_const, reason = "required by lock_api")]
    const INIT: Self = Self {
        lock: AtomicBool::new(false),
    };

    fn lock(&self) {
        let mut boff = Backoff::default();
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.is_locked() {
                boff.snooze();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }
}
