// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;

use crate::deadline::Deadline;
use crate::sync::{Mutex, MutexGuard, WaitList, Waiters};
use crate::task::{CancellationBlocker, Suspend, WakeupSource, context};

/// A condition variable for tasks, used together with a [`Mutex`].
///
/// Waiting suspends the task and releases the mutex, but only *after* the task was registered
/// as a waiter, so a notification sent by a task that acquires the mutex right after the
/// release is never lost. The mutex is always re-acquired before a wait returns, even when the
/// wait ended because of a timeout or cancellation.
///
/// Notifications are not stored. Spurious wakeups are possible, prefer the predicate variants
/// ([`wait_pred`](Self::wait_pred), [`wait_until_pred`](Self::wait_until_pred)).
#[derive(Default)]
pub struct ConditionVariable {
    waiters: WaitList,
}

/// Why a [`ConditionVariable`] wait returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CvStatus {
    /// The task was notified (or woken spuriously).
    NoTimeout,
    /// The deadline was reached.
    Timeout,
    /// Cancellation of the waiting task was requested.
    Cancelled,
}

/// Holds the mutex across a condvar suspension and tracks whether it is currently released.
struct Relock<'a, T: ?Sized, W: Waiters> {
    mutex: &'a Mutex<T, W>,
    owner: u64,
    held: AtomicBool,
}

// === impl ConditionVariable ===

impl ConditionVariable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake one waiting task.
    pub fn notify_one(&self) {
        self.waiters.wakeup_one();
    }

    /// Wake all waiting tasks.
    pub fn notify_all(&self) {
        self.waiters.wakeup_all();
    }

    /// Release the mutex and suspend until notified.
    ///
    /// Returns [`CvStatus::Cancelled`] when the task is asked to cancel.
    pub async fn wait<'a, T: ?Sized, W: Waiters>(
        &self,
        guard: MutexGuard<'a, T, W>,
    ) -> (MutexGuard<'a, T, W>, CvStatus) {
        self.wait_until(guard, Deadline::unreachable()).await
    }

    /// Like [`ConditionVariable::wait_until`] with a deadline `timeout` from now.
    pub async fn wait_for<'a, T: ?Sized, W: Waiters>(
        &self,
        guard: MutexGuard<'a, T, W>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T, W>, CvStatus) {
        self.wait_until(guard, Deadline::from_duration(timeout)).await
    }

    /// Release the mutex and suspend until notified, until `deadline` or until the task is
    /// asked to cancel, whichever comes first.
    ///
    /// A deadline that already passed (or a pending cancellation) returns right away without
    /// ever releasing the mutex.
    pub async fn wait_until<'a, T: ?Sized, W: Waiters>(
        &self,
        guard: MutexGuard<'a, T, W>,
        deadline: Deadline,
    ) -> (MutexGuard<'a, T, W>, CvStatus) {
        let relock = Relock {
            owner: context::current_owner_id(),
            mutex: MutexGuard::leak(guard),
            held: AtomicBool::new(true),
        };

        let source = Suspend::new(
            self.waiters.wait(),
            || {
                // we are registered now, notifications can no longer get lost
                relock.release();
                false
            },
            deadline,
        )
        .await;

        relock.reacquire().await;

        let status = match source {
            WakeupSource::DeadlineTimer => CvStatus::Timeout,
            WakeupSource::CancelRequest => CvStatus::Cancelled,
            WakeupSource::WaitList | WakeupSource::None => CvStatus::NoTimeout,
        };
        tracing::trace!(?status, "ConditionVariable::wait_until");

        (relock.into_guard(), status)
    }

    /// Wait until `pred` returns `true`.
    ///
    /// Returns the predicate's last result, which is `false` only if the task was asked to
    /// cancel.
    pub async fn wait_pred<'a, T: ?Sized, W: Waiters>(
        &self,
        guard: MutexGuard<'a, T, W>,
        pred: impl FnMut(&mut T) -> bool,
    ) -> (MutexGuard<'a, T, W>, bool) {
        self.wait_until_pred(guard, Deadline::unreachable(), pred)
            .await
    }

    /// Wait until `pred` returns `true`, giving up at `deadline` or when the task is asked to
    /// cancel.
    ///
    /// The predicate is always evaluated with the mutex held. Returns its last result.
    pub async fn wait_until_pred<'a, T: ?Sized, W: Waiters>(
        &self,
        mut guard: MutexGuard<'a, T, W>,
        deadline: Deadline,
        mut pred: impl FnMut(&mut T) -> bool,
    ) -> (MutexGuard<'a, T, W>, bool) {
        loop {
            if pred(&mut *guard) {
                return (guard, true);
            }

            let (g, status) = self.wait_until(guard, deadline).await;
            guard = g;

            if status != CvStatus::NoTimeout {
                let res = pred(&mut *guard);
                return (guard, res);
            }
        }
    }
}

impl fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("waiters", &self.waiters)
            .finish()
    }
}

// === impl Relock ===

impl<'a, T: ?Sized, W: Waiters> Relock<'a, T, W> {
    fn release(&self) {
        self.held.store(false, Ordering::Relaxed);
        self.mutex.release(self.owner);
    }

    async fn reacquire(&self) {
        if self.held.load(Ordering::Relaxed) {
            return;
        }

        let _blocker = CancellationBlocker::new();
        while self
            .mutex
            .acquire_until(self.owner, Deadline::unreachable())
            .await
            .is_err()
        {}
        self.held.store(true, Ordering::Relaxed);
    }

    fn into_guard(self) -> MutexGuard<'a, T, W> {
        debug_assert!(self.held.load(Ordering::Relaxed));
        let guard = MutexGuard::assume_locked(self.mutex);
        // ownership moved into the guard
        self.held.store(false, Ordering::Relaxed);
        guard
    }
}

impl<T: ?Sized, W: Waiters> Drop for Relock<'_, T, W> {
    fn drop(&mut self) {
        // the wait was abandoned with the lock held and no guard left to release it
        if self.held.load(Ordering::Relaxed) {
            self.mutex.release(self.owner);
        }
    }
}
