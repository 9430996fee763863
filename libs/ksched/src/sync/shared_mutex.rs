// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::time::Duration;

use crate::deadline::Deadline;
use crate::error::WaitError;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::WaitList;
use crate::task::{CancellationBlocker, Suspend};

/// The high bit marks an exclusive holder, the remaining bits count shared holders.
const WRITER: usize = 1 << (usize::BITS - 1);
const READERS: usize = !WRITER;

/// A reader-writer lock for tasks.
///
/// Any number of tasks may hold the lock shared, or exactly one task exclusively. Waiting
/// writers take precedence: once a writer waits, new shared acquisitions wait as well so a
/// steady stream of readers can not starve writers.
pub struct SharedMutex<T: ?Sized> {
    state: AtomicUsize,
    /// Number of tasks waiting for exclusive access.
    waiting_writers: AtomicUsize,
    readers: WaitList,
    writers: WaitList,
    data: UnsafeCell<T>,
}

/// RAII guard for shared access, returned by [`SharedMutex::lock_shared`].
#[must_use = "if unused the SharedMutex will immediately unlock"]
pub struct SharedMutexReadGuard<'a, T: ?Sized> {
    lock: &'a SharedMutex<T>,
}

/// RAII guard for exclusive access, returned by [`SharedMutex::lock`].
#[must_use = "if unused the SharedMutex will immediately unlock"]
pub struct SharedMutexWriteGuard<'a, T: ?Sized> {
    lock: &'a SharedMutex<T>,
}

// Safety: the lock serializes writers and only hands out `&T` to concurrent readers
unsafe impl<T: ?Sized + Send> Send for SharedMutex<T> {}
// Safety: see above, shared holders observe `&T` from several threads so `T: Sync` is required
unsafe impl<T: ?Sized + Send + Sync> Sync for SharedMutex<T> {}

// === impl SharedMutex ===

impl<T> SharedMutex<T> {
    pub fn new(data: T) -> Self {
        Self {
            state: AtomicUsize::new(0),
            waiting_writers: AtomicUsize::new(0),
            readers: WaitList::new(),
            writers: WaitList::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SharedMutex<T> {
    pub fn try_lock(&self) -> Option<SharedMutexWriteGuard<'_, T>> {
        self.try_acquire_exclusive()
            .then(|| SharedMutexWriteGuard { lock: self })
    }

    /// Acquire exclusive access. The wait ignores cancellation and has no deadline.
    pub async fn lock(&self) -> SharedMutexWriteGuard<'_, T> {
        let _blocker = CancellationBlocker::new();
        loop {
            if self.acquire_exclusive(Deadline::unreachable()).await.is_ok() {
                return SharedMutexWriteGuard { lock: self };
            }
        }
    }

    /// Acquire exclusive access, giving up at `deadline` or when the task is asked to cancel.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Timeout`] or [`WaitError::Cancelled`] if the lock could not be
    /// acquired in time.
    pub async fn lock_until(
        &self,
        deadline: Deadline,
    ) -> Result<SharedMutexWriteGuard<'_, T>, WaitError> {
        self.acquire_exclusive(deadline).await?;
        Ok(SharedMutexWriteGuard { lock: self })
    }

    pub async fn try_lock_until(&self, deadline: Deadline) -> Option<SharedMutexWriteGuard<'_, T>> {
        self.lock_until(deadline).await.ok()
    }

    pub async fn try_lock_for(&self, timeout: Duration) -> Option<SharedMutexWriteGuard<'_, T>> {
        self.try_lock_until(Deadline::from_duration(timeout)).await
    }

    pub fn try_lock_shared(&self) -> Option<SharedMutexReadGuard<'_, T>> {
        self.try_acquire_shared()
            .then(|| SharedMutexReadGuard { lock: self })
    }

    /// Acquire shared access. The wait ignores cancellation and has no deadline.
    pub async fn lock_shared(&self) -> SharedMutexReadGuard<'_, T> {
        let _blocker = CancellationBlocker::new();
        loop {
            if self.acquire_shared(Deadline::unreachable()).await.is_ok() {
                return SharedMutexReadGuard { lock: self };
            }
        }
    }

    /// Acquire shared access, giving up at `deadline` or when the task is asked to cancel.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Timeout`] or [`WaitError::Cancelled`] if the lock could not be
    /// acquired in time.
    pub async fn lock_shared_until(
        &self,
        deadline: Deadline,
    ) -> Result<SharedMutexReadGuard<'_, T>, WaitError> {
        self.acquire_shared(deadline).await?;
        Ok(SharedMutexReadGuard { lock: self })
    }

    pub async fn try_lock_shared_until(
        &self,
        deadline: Deadline,
    ) -> Option<SharedMutexReadGuard<'_, T>> {
        self.lock_shared_until(deadline).await.ok()
    }

    pub async fn try_lock_shared_for(
        &self,
        timeout: Duration,
    ) -> Option<SharedMutexReadGuard<'_, T>> {
        self.try_lock_shared_until(Deadline::from_duration(timeout))
            .await
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Number of tasks currently holding shared access.
    pub fn readers(&self) -> usize {
        self.state.load(Ordering::Acquire) & READERS
    }

    pub fn is_locked_exclusive(&self) -> bool {
        self.state.load(Ordering::Acquire) & WRITER != 0
    }

    fn try_acquire_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    fn try_acquire_shared(&self) -> bool {
        let mut state = self.state.load(Ordering::SeqCst);
        loop {
            if state & WRITER != 0 || self.waiting_writers.load(Ordering::SeqCst) != 0 {
                return false;
            }
            assert!(state & READERS != READERS, "SharedMutex reader count overflow");

            match self.state.compare_exchange_weak(
                state,
                state + 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    async fn acquire_exclusive(&self, deadline: Deadline) -> Result<(), WaitError> {
        if self.try_acquire_exclusive() {
            return Ok(());
        }

        // from here on new readers queue up behind us
        self.waiting_writers.fetch_add(1, Ordering::SeqCst);
        let res = loop {
            if self.try_acquire_exclusive() {
                break Ok(());
            }

            let source = Suspend::new(
                self.writers.wait(),
                || self.state.load(Ordering::SeqCst) == 0,
                deadline,
            )
            .await;

            if let Some(err) = WaitError::from_wakeup(source) {
                break Err(err);
            }
        };

        if self.waiting_writers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.readers.wakeup_all();
        }
        if res.is_err() && self.state.load(Ordering::SeqCst) == 0 {
            // pass on a wakeup we may have swallowed
            self.writers.wakeup_one();
        }
        res
    }

    async fn acquire_shared(&self, deadline: Deadline) -> Result<(), WaitError> {
        loop {
            if self.try_acquire_shared() {
                return Ok(());
            }

            let source = Suspend::new(
                self.readers.wait(),
                || {
                    self.state.load(Ordering::SeqCst) & WRITER == 0
                        && self.waiting_writers.load(Ordering::SeqCst) == 0
                },
                deadline,
            )
            .await;

            if let Some(err) = WaitError::from_wakeup(source) {
                return Err(err);
            }
        }
    }

    fn release_exclusive(&self) {
        let prev = self.state.swap(0, Ordering::SeqCst);
        debug_assert_eq!(prev, WRITER);

        if self.waiting_writers.load(Ordering::SeqCst) > 0 {
            self.writers.wakeup_one();
        } else {
            self.readers.wakeup_all();
        }
    }

    fn release_shared(&self) {
        let prev = self.state.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev & READERS > 0);

        if prev & READERS == 1 {
            self.writers.wakeup_one();
        }
    }
}

impl<T: Default> Default for SharedMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SharedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("SharedMutex");
        match self.try_lock_shared() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.field("waiting_writers", &self.waiting_writers.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// === impl SharedMutexReadGuard ===

impl<T: ?Sized> Deref for SharedMutexReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: shared access is held, no exclusive holder exists
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedMutexReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_shared();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SharedMutexReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

// === impl SharedMutexWriteGuard ===

impl<T: ?Sized> Deref for SharedMutexWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: exclusive access is held
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SharedMutexWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: exclusive access is held
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedMutexWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SharedMutexWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn readers_share() {
        let lock = SharedMutex::new(5);
        let a = lock.try_lock_shared().unwrap();
        let b = lock.try_lock_shared().unwrap();
        assert_eq!(*a + *b, 10);
        assert_eq!(lock.readers(), 2);
        assert!(lock.try_lock().is_none());
        drop((a, b));
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = SharedMutex::new(0);
        let mut writer = lock.try_lock().unwrap();
        *writer = 1;

        let mut reader = task::spawn(lock.lock_shared());
        assert_pending!(reader.poll());

        drop(writer);
        assert!(reader.is_woken());
        assert_eq!(*assert_ready!(reader.poll()), 1);
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        let lock = SharedMutex::new(());
        let first = lock.try_lock_shared().unwrap();

        let mut writer = task::spawn(lock.lock());
        assert_pending!(writer.poll());

        // a writer is queued, new readers have to wait
        assert!(lock.try_lock_shared().is_none());
        let mut reader = task::spawn(lock.lock_shared());
        assert_pending!(reader.poll());

        drop(first);
        assert!(writer.is_woken());
        let guard = assert_ready!(writer.poll());
        assert!(lock.is_locked_exclusive());

        drop(guard);
        assert!(reader.is_woken());
        assert_ready!(reader.poll());
    }

    #[test]
    fn timed_out_writer_lets_readers_in() {
        let lock = SharedMutex::new(());
        let _first = lock.try_lock_shared().unwrap();

        let mut writer = task::spawn(lock.lock_until(Deadline::passed()));
        assert_eq!(assert_ready!(writer.poll()).unwrap_err(), WaitError::Timeout);
        assert!(lock.try_lock_shared().is_some());
    }
}
