// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::UnsafeCell;
use core::{fmt, mem};
use core::ops::{Deref, DerefMut};
use core::time::Duration;

use crate::deadline::Deadline;
use crate::error::WaitError;
use crate::loom::sync::atomic::{AtomicU64, Ordering};
use crate::sync::{WaitList, Waiters};
use crate::task::{CancellationBlocker, Suspend, context};
use crate::util::Backoff;

/// A mutual exclusion lock that suspends the waiting *task* instead of blocking its worker
/// thread.
///
/// The lock records its owner: the id of the task holding it, or a per-thread pseudo id when
/// it is taken from a plain OS thread. Locking a mutex the caller already holds is a
/// programming error and panics, as does releasing it from anywhere but the owner.
///
/// Waiters are parked on `W`, which defaults to [`WaitList`]. A mutex that is only ever
/// contended by a single task at a time can use [`WaitListLight`](super::WaitListLight)
/// instead.
///
/// Wakeups do not hand over ownership: a woken task retries to acquire the lock and may lose
/// against a task arriving on the fast path. This favours throughput over fairness.
pub struct Mutex<T: ?Sized, W: Waiters = WaitList> {
    /// 0 when unlocked, the owner id otherwise.
    owner: AtomicU64,
    waiters: W,
    data: UnsafeCell<T>,
}

/// An RAII guard releasing the [`Mutex`] when dropped.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized, W: Waiters = WaitList> {
    mutex: &'a Mutex<T, W>,
}

// Safety: the lock serializes all access to `data`
unsafe impl<T: ?Sized + Send, W: Waiters> Send for Mutex<T, W> {}
// Safety: the lock serializes all access to `data`
unsafe impl<T: ?Sized + Send, W: Waiters> Sync for Mutex<T, W> {}

// === impl Mutex ===

impl<T, W: Waiters> Mutex<T, W> {
    pub fn new(data: T) -> Self {
        Self {
            owner: AtomicU64::new(0),
            waiters: W::default(),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes the mutex, returning the protected data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized, W: Waiters> Mutex<T, W> {
    /// Attempts to acquire the lock without suspending.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, W>> {
        self.try_acquire(context::current_owner_id())
            .then(|| MutexGuard { mutex: self })
    }

    /// Acquires the lock, suspending the current task until it is available.
    ///
    /// This wait can not be cancelled and has no deadline: the task's own deadline and
    /// cancellation requests are ignored while waiting, a cancelled task keeps waiting and
    /// gets the lock once it is released. A task that should give up on cancellation locks
    /// with `lock_until(Deadline::unreachable())` instead, see [`Mutex::lock_until`].
    ///
    /// # Panics
    ///
    /// Panics if the caller already holds the lock.
    pub async fn lock(&self) -> MutexGuard<'_, T, W> {
        let _blocker = CancellationBlocker::new();
        let owner = context::current_owner_id();
        loop {
            if self.acquire_until(owner, Deadline::unreachable()).await.is_ok() {
                return MutexGuard { mutex: self };
            }
        }
    }

    /// Acquires the lock, giving up once `deadline` is reached or the current task is asked to
    /// cancel.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Timeout`] when the deadline passed and [`WaitError::Cancelled`]
    /// when cancellation was requested before the lock could be taken. If both apply
    /// cancellation wins.
    ///
    /// # Panics
    ///
    /// Panics if the caller already holds the lock.
    pub async fn lock_until(&self, deadline: Deadline) -> Result<MutexGuard<'_, T, W>, WaitError> {
        self.acquire_until(context::current_owner_id(), deadline)
            .await?;
        Ok(MutexGuard { mutex: self })
    }

    /// Like [`Mutex::lock_until`] but returns `None` on timeout and on cancellation.
    ///
    /// # Panics
    ///
    /// Panics if the caller already holds the lock.
    pub async fn try_lock_until(&self, deadline: Deadline) -> Option<MutexGuard<'_, T, W>> {
        self.lock_until(deadline).await.ok()
    }

    /// Like [`Mutex::try_lock_until`] with a deadline `timeout` from now.
    ///
    /// # Panics
    ///
    /// Panics if the caller already holds the lock.
    pub async fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, T, W>> {
        self.try_lock_until(Deadline::from_duration(timeout)).await
    }

    /// Acquires the lock from a plain OS thread, blocking it until the lock becomes available.
    ///
    /// Spins with exponential backoff first and then yields the thread between attempts.
    ///
    /// # Panics
    ///
    /// Panics if the caller already holds the lock.
    pub fn lock_blocking(&self) -> MutexGuard<'_, T, W> {
        let owner = context::current_owner_id();
        let mut boff = Backoff::new();
        while !self.try_acquire(owner) {
            self.assert_not_owner(owner);
            boff.snooze();
        }
        MutexGuard { mutex: self }
    }

    /// Returns `true` if the lock is currently held.
    ///
    /// The answer may be stale by the time the caller looks at it.
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }

    /// Returns a mutable reference to the protected data.
    ///
    /// The exclusive borrow statically guarantees no lock is held.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub(crate) async fn acquire_until(&self, owner: u64, deadline: Deadline) -> Result<(), WaitError> {
        loop {
            if self.try_acquire(owner) {
                return Ok(());
            }
            self.assert_not_owner(owner);

            let source = Suspend::new(
                self.waiters.wait(),
                || self.owner.load(Ordering::SeqCst) == 0,
                deadline,
            )
            .await;

            if let Some(err) = WaitError::from_wakeup(source) {
                // we might have consumed the wakeup meant for the next waiter
                if !self.is_locked() {
                    self.waiters.wakeup_one();
                }
                return Err(err);
            }
        }
    }

    fn try_acquire(&self, owner: u64) -> bool {
        self.owner
            .compare_exchange(0, owner, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    fn assert_not_owner(&self, owner: u64) {
        assert_ne!(
            self.owner.load(Ordering::Relaxed),
            owner,
            "attempted to lock a Mutex that is already held by the current task"
        );
    }

    /// Releases the lock held by `owner` and wakes a waiter.
    pub(crate) fn release(&self, owner: u64) {
        if let Err(actual) =
            self.owner
                .compare_exchange(owner, 0, Ordering::SeqCst, Ordering::Relaxed)
        {
            panic!("Mutex unlocked by {owner} but it is owned by {actual}");
        }
        self.waiters.wakeup_one();
    }
}

impl<T: Default, W: Waiters> Default for Mutex<T, W> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T, W: Waiters> From<T> for Mutex<T, W> {
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

impl<T: ?Sized + fmt::Debug, W: Waiters> fmt::Debug for Mutex<T, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish_non_exhaustive()
    }
}

// === impl MutexGuard ===

impl<'a, T: ?Sized, W: Waiters> MutexGuard<'a, T, W> {
    /// Temporarily releases the lock while `fut` runs, re-acquiring it afterwards.
    ///
    /// Re-acquiring ignores cancellation, so the guard is always valid again once this returns.
    pub async fn unlocked<F: Future>(guard: &mut Self, fut: F) -> F::Output {
        let owner = context::current_owner_id();
        guard.mutex.release(owner);
        let out = fut.await;

        let _blocker = CancellationBlocker::new();
        while guard
            .mutex
            .acquire_until(owner, Deadline::unreachable())
            .await
            .is_err()
        {}
        out
    }

    /// The mutex this guard belongs to.
    pub fn mutex(guard: &Self) -> &'a Mutex<T, W> {
        guard.mutex
    }

    /// Forgets the guard without releasing the lock.
    pub(crate) fn leak(guard: Self) -> &'a Mutex<T, W> {
        let mutex = guard.mutex;
        mem::forget(guard);
        mutex
    }

    /// Wraps a lock the current task acquired through [`Mutex::acquire_until`].
    pub(crate) fn assume_locked(mutex: &'a Mutex<T, W>) -> Self {
        debug_assert!(mutex.is_locked());
        Self { mutex }
    }
}

impl<T: ?Sized, W: Waiters> Deref for MutexGuard<'_, T, W> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves we hold the lock
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized, W: Waiters> DerefMut for MutexGuard<'_, T, W> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves we hold the lock
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized, W: Waiters> Drop for MutexGuard<'_, T, W> {
    fn drop(&mut self) {
        self.mutex.release(context::current_owner_id());
    }
}

impl<T: ?Sized + fmt::Debug, W: Waiters> fmt::Debug for MutexGuard<'_, T, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + fmt::Display, W: Waiters> fmt::Display for MutexGuard<'_, T, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::WaitListLight;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready, task};
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn uncontended() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let mutex: Mutex<u32> = Mutex::new(1);
        let mut lock = task::spawn(mutex.lock());
        let mut guard = assert_ready!(lock.poll());
        *guard += 1;
        drop(guard);
        drop(lock);

        assert!(!mutex.is_locked());
        assert_eq!(mutex.into_inner(), 2);
    }

    #[test]
    fn try_lock_is_exclusive() {
        let mutex: Mutex<()> = Mutex::new(());
        let guard = mutex.try_lock().unwrap();
        assert!(mutex.is_locked());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn contended_lock_is_woken_on_unlock() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let mutex: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let guard = mutex.lock_blocking();

        let (parked_tx, parked_rx) = std::sync::mpsc::channel();
        let (go_tx, go_rx) = std::sync::mpsc::channel();

        // the waiter needs an owner id different from the test thread's
        let waiter = std::thread::spawn({
            let mutex = mutex.clone();
            move || {
                let mut waiter = task::spawn(async {
                    let mut guard = mutex.lock().await;
                    *guard += 1;
                });
                assert_pending!(waiter.poll());
                parked_tx.send(()).unwrap();

                go_rx.recv().unwrap();
                assert!(waiter.is_woken());
                assert_ready!(waiter.poll());
            }
        });

        parked_rx.recv().unwrap();
        drop(guard);
        go_tx.send(()).unwrap();
        waiter.join().unwrap();

        assert_eq!(*mutex.lock_blocking(), 1);
    }

    #[test]
    fn passed_deadline_times_out_immediately() {
        let mutex: Mutex<()> = Mutex::new(());
        let _guard = mutex.lock_blocking();

        std::thread::scope(|s| {
            s.spawn(|| {
                let mut lock = task::spawn(mutex.try_lock_until(Deadline::passed()));
                assert!(assert_ready!(lock.poll()).is_none());

                let mut lock = task::spawn(mutex.lock_until(Deadline::passed()));
                assert_eq!(assert_ready!(lock.poll()).unwrap_err(), WaitError::Timeout);
            });
        });
    }

    #[test]
    #[should_panic = "already held by the current task"]
    fn reentrant_lock_panics() {
        let mutex: Mutex<()> = Mutex::new(());
        let _guard = mutex.lock_blocking();
        let _again = mutex.lock_blocking();
    }

    #[test]
    #[should_panic = "Mutex unlocked by"]
    fn unlock_by_non_owner_panics() {
        let mutex: Mutex<()> = Mutex::new(());
        let guard = mutex.lock_blocking();
        std::thread::scope(|s| {
            if let Err(payload) = s.spawn(move || drop(guard)).join() {
                std::panic::resume_unwind(payload);
            }
        });
    }

    #[test]
    fn light_waiters() {
        let mutex: Mutex<u32, WaitListLight> = Mutex::new(0);
        let mut lock = task::spawn(mutex.lock());
        let mut guard = assert_ready!(lock.poll());
        *guard = 7;
        drop(guard);
        assert_eq!(*mutex.lock_blocking(), 7);
    }

    #[test]
    fn unlocked_releases_temporarily() {
        let mutex: Mutex<u32> = Mutex::new(0);
        let mut task = task::spawn(async {
            let mut guard = mutex.lock().await;
            MutexGuard::unlocked(&mut guard, async {
                assert!(!mutex.is_locked());
            })
            .await;
            assert!(mutex.is_locked());
            *guard += 1;
        });
        assert_ready!(task.poll());
        assert_eq!(*mutex.lock_blocking(), 1);
    }
}
