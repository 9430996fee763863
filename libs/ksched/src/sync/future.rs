// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::error::Error;
use core::fmt;
use core::time::Duration;
use std::sync::PoisonError;

use crate::deadline::Deadline;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::loom::sync::{Arc, Condvar, Mutex as OsMutex};
use crate::sync::WaitList;
use crate::task::{CancellationBlocker, Suspend, WakeupSource};
use crate::util::SpinMutex;

/// Errors reported by [`BlockingFutureState`], [`Promise`] and [`Future`].
#[derive(Debug)]
#[non_exhaustive]
pub enum FutureError {
    /// A value or error was already stored.
    PromiseAlreadySatisfied,
    /// The value was already taken out.
    FutureAlreadyRetrieved,
    /// The [`Promise`] was dropped without storing a value.
    BrokenPromise,
    /// The value was requested before one was stored.
    NoState,
    /// The producer stored an error instead of a value.
    Exception(Box<dyn Error + Send + Sync>),
}

/// The result of a deadline-aware wait on a [`BlockingFutureState`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FutureStatus {
    /// The value is available.
    Ready,
    /// The deadline passed first.
    Timeout,
    /// The waiting task was asked to cancel first.
    Cancelled,
}

/// A single-producer, single-consumer result slot.
///
/// The producer stores exactly one value (or error), the consumer takes it out at most once.
/// Waiting works both from tasks, which are suspended, and from plain OS threads, which block
/// on an OS mutex and condition variable.
pub struct BlockingFutureState<T> {
    ready: AtomicBool,
    satisfied: AtomicBool,
    retrieved: AtomicBool,
    value: SpinMutex<Option<Result<T, FutureError>>>,
    /// Wakes suspended tasks.
    waiters: WaitList,
    /// Wakes blocked OS threads.
    os_lock: OsMutex<()>,
    os_cond: Condvar,
}

// === impl FutureError ===

impl FutureError {
    /// Wraps an arbitrary error for [`Promise::set_exception`].
    pub fn exception(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self::Exception(err.into())
    }
}

impl fmt::Display for FutureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FutureError::PromiseAlreadySatisfied => f.write_str("promise already satisfied"),
            FutureError::FutureAlreadyRetrieved => f.write_str("future already retrieved"),
            FutureError::BrokenPromise => f.write_str("broken promise"),
            FutureError::NoState => f.write_str("no associated state"),
            FutureError::Exception(err) => write!(f, "promise failed: {err}"),
        }
    }
}

impl Error for FutureError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FutureError::Exception(err) => Some(&**err),
            _ => None,
        }
    }
}

// === impl BlockingFutureState ===

impl<T> BlockingFutureState<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            satisfied: AtomicBool::new(false),
            retrieved: AtomicBool::new(false),
            value: SpinMutex::new(None),
            waiters: WaitList::new(),
            os_lock: OsMutex::new(()),
            os_cond: Condvar::new(),
        }
    }

    /// Returns `true` once a value or error was stored.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Store the value and wake the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`FutureError::PromiseAlreadySatisfied`] if a value or error was stored before.
    pub fn set_value(&self, value: T) -> Result<(), FutureError> {
        self.set(Ok(value))
    }

    /// Store an error and wake the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`FutureError::PromiseAlreadySatisfied`] if a value or error was stored before.
    pub fn set_exception(&self, err: FutureError) -> Result<(), FutureError> {
        self.set(Err(err))
    }

    fn set(&self, value: Result<T, FutureError>) -> Result<(), FutureError> {
        if self.satisfied.swap(true, Ordering::AcqRel) {
            return Err(FutureError::PromiseAlreadySatisfied);
        }

        *self.value.lock() = Some(value);
        self.ready.store(true, Ordering::SeqCst);

        self.waiters.wakeup_all();
        // taking the lock orders us after a blocked thread's check of `ready`
        drop(self.os_lock.lock().unwrap_or_else(PoisonError::into_inner));
        self.os_cond.notify_all();

        Ok(())
    }

    /// Take the stored value out.
    ///
    /// # Errors
    ///
    /// Returns [`FutureError::NoState`] if no value was stored yet,
    /// [`FutureError::FutureAlreadyRetrieved`] if the value was taken before and the stored
    /// error if the producer failed.
    pub fn take(&self) -> Result<T, FutureError> {
        if !self.is_ready() {
            return Err(FutureError::NoState);
        }
        if self.retrieved.swap(true, Ordering::AcqRel) {
            return Err(FutureError::FutureAlreadyRetrieved);
        }

        self.value
            .lock()
            .take()
            .unwrap_or(Err(FutureError::FutureAlreadyRetrieved))
    }

    /// Wait until a value is stored.
    ///
    /// The wait ignores cancellation of the calling task.
    pub async fn wait(&self) {
        let _blocker = CancellationBlocker::new();
        while !self.is_ready() {
            Suspend::new(self.waiters.wait(), || self.is_ready(), Deadline::unreachable()).await;
        }
    }

    /// Wait until a value is stored, `deadline` passed or the task is asked to cancel.
    pub async fn wait_until(&self, deadline: Deadline) -> FutureStatus {
        loop {
            if self.is_ready() {
                return FutureStatus::Ready;
            }

            let source =
                Suspend::new(self.waiters.wait(), || self.is_ready(), deadline).await;

            match source {
                WakeupSource::DeadlineTimer if !self.is_ready() => return FutureStatus::Timeout,
                WakeupSource::CancelRequest if !self.is_ready() => {
                    return FutureStatus::Cancelled;
                }
                _ => {}
            }
        }
    }

    /// Block the calling OS thread until a value is stored.
    ///
    /// Must not be called from inside a task, it would block the worker thread.
    pub fn blocking_wait(&self) {
        if self.is_ready() {
            return;
        }

        let mut guard = self.os_lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.is_ready() {
            guard = self
                .os_cond
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block the calling OS thread until a value is stored or `deadline` passed.
    ///
    /// Returns [`FutureStatus::Ready`] or [`FutureStatus::Timeout`].
    pub fn blocking_wait_until(&self, deadline: Deadline) -> FutureStatus {
        if self.is_ready() {
            return FutureStatus::Ready;
        }

        let mut guard = self.os_lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.is_ready() {
                return FutureStatus::Ready;
            }

            match deadline.time_left() {
                None => {
                    guard = self
                        .os_cond
                        .wait(guard)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(left) if left.is_zero() => return FutureStatus::Timeout,
                Some(left) => {
                    guard = self
                        .os_cond
                        .wait_timeout(guard, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }
}

impl<T> Default for BlockingFutureState<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BlockingFutureState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingFutureState")
            .field("ready", &self.is_ready())
            .field("retrieved", &self.retrieved.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// The producing half of a [`Promise`]/[`Future`] pair.
///
/// Dropping a promise that never stored a value makes the consumer see
/// [`FutureError::BrokenPromise`].
pub struct Promise<T> {
    state: Arc<BlockingFutureState<T>>,
    future_retrieved: bool,
}

/// The consuming half of a [`Promise`]/[`Future`] pair.
///
/// A future is *valid* until its value was retrieved with [`get`](Future::get) or
/// [`blocking_get`](Future::blocking_get).
pub struct Future<T> {
    state: Option<Arc<BlockingFutureState<T>>>,
}

// === impl Promise ===

impl<T> Promise<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(BlockingFutureState::new()),
            future_retrieved: false,
        }
    }

    /// Returns the future connected to this promise.
    ///
    /// # Errors
    ///
    /// Returns [`FutureError::FutureAlreadyRetrieved`] on every call after the first.
    pub fn get_future(&mut self) -> Result<Future<T>, FutureError> {
        if self.future_retrieved {
            return Err(FutureError::FutureAlreadyRetrieved);
        }
        self.future_retrieved = true;
        Ok(Future {
            state: Some(self.state.clone()),
        })
    }

    /// # Errors
    ///
    /// Returns [`FutureError::PromiseAlreadySatisfied`] if a value or error was stored before.
    pub fn set_value(&self, value: T) -> Result<(), FutureError> {
        self.state.set_value(value)
    }

    /// # Errors
    ///
    /// Returns [`FutureError::PromiseAlreadySatisfied`] if a value or error was stored before.
    pub fn set_exception(&self, err: impl Into<Box<dyn Error + Send + Sync>>) -> Result<(), FutureError> {
        self.state.set_exception(FutureError::exception(err))
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.state.satisfied.load(Ordering::Acquire) {
            let _ = self.state.set_exception(FutureError::BrokenPromise);
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state)
            .field("future_retrieved", &self.future_retrieved)
            .finish()
    }
}

// === impl Future ===

impl<T> Future<T> {
    /// Returns `true` until the value was retrieved.
    pub fn is_valid(&self) -> bool {
        self.state.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Wait for the value. The wait ignores cancellation of the calling task.
    ///
    /// # Panics
    ///
    /// Panics if the future is no longer [valid](Future::is_valid).
    pub async fn wait(&self) {
        self.state().wait().await;
    }

    /// Wait for the value until `deadline`, or until the task is asked to cancel.
    ///
    /// # Panics
    ///
    /// Panics if the future is no longer [valid](Future::is_valid).
    pub async fn wait_until(&self, deadline: Deadline) -> FutureStatus {
        self.state().wait_until(deadline).await
    }

    /// # Panics
    ///
    /// Panics if the future is no longer [valid](Future::is_valid).
    pub async fn wait_for(&self, timeout: Duration) -> FutureStatus {
        self.wait_until(Deadline::from_duration(timeout)).await
    }

    /// Block the calling OS thread until the value is available.
    ///
    /// # Panics
    ///
    /// Panics if the future is no longer [valid](Future::is_valid).
    pub fn blocking_wait(&self) {
        self.state().blocking_wait();
    }

    /// Wait for the value and take it out, invalidating the future.
    ///
    /// # Errors
    ///
    /// Returns the error stored by the producer, or [`FutureError::BrokenPromise`].
    ///
    /// # Panics
    ///
    /// Panics if the future is no longer [valid](Future::is_valid).
    pub async fn get(&mut self) -> Result<T, FutureError> {
        // stays valid while suspended, dropping this future keeps the value retrievable
        self.state().wait().await;
        self.take_state().take()
    }

    /// Block the calling OS thread until the value is available and take it out, invalidating
    /// the future.
    ///
    /// # Errors
    ///
    /// Returns the error stored by the producer, or [`FutureError::BrokenPromise`].
    ///
    /// # Panics
    ///
    /// Panics if the future is no longer [valid](Future::is_valid).
    pub fn blocking_get(&mut self) -> Result<T, FutureError> {
        self.state().blocking_wait();
        self.take_state().take()
    }

    fn state(&self) -> &BlockingFutureState<T> {
        match &self.state {
            Some(state) => state,
            None => panic!("Future used after its value was retrieved"),
        }
    }

    fn take_state(&mut self) -> Arc<BlockingFutureState<T>> {
        match self.state.take() {
            Some(state) => state,
            None => panic!("Future used after its value was retrieved"),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::thread;
    use tokio_test::{assert_pending, assert_ready, assert_ready_eq, task};

    #[test]
    fn set_once_take_once() {
        let state = BlockingFutureState::new();
        assert!(matches!(state.take(), Err(FutureError::NoState)));

        state.set_value(1).unwrap();
        assert!(state.is_ready());
        assert!(matches!(
            state.set_value(2),
            Err(FutureError::PromiseAlreadySatisfied)
        ));

        assert_eq!(state.take().unwrap(), 1);
        assert!(matches!(
            state.take(),
            Err(FutureError::FutureAlreadyRetrieved)
        ));
    }

    #[test]
    fn task_waiter_is_woken() {
        let state = BlockingFutureState::new();
        let mut wait = task::spawn(state.wait());
        assert_pending!(wait.poll());

        state.set_value(()).unwrap();
        assert!(wait.is_woken());
        assert_ready!(wait.poll());
    }

    #[test]
    fn wait_until_passed_deadline() {
        let state = BlockingFutureState::<()>::new();
        let mut wait = task::spawn(state.wait_until(Deadline::passed()));
        assert_ready_eq!(wait.poll(), FutureStatus::Timeout);

        state.set_value(()).unwrap();
        let mut wait = task::spawn(state.wait_until(Deadline::passed()));
        assert_ready_eq!(wait.poll(), FutureStatus::Ready);
    }

    #[test]
    fn blocking_wait_from_os_thread() {
        let mut promise = Promise::new();
        let mut future = promise.get_future().unwrap();

        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            promise.set_value(42).unwrap();
        });

        assert_eq!(future.blocking_get().unwrap(), 42);
        assert!(!future.is_valid());
        producer.join().unwrap();
    }

    #[test]
    fn blocking_wait_until_times_out() {
        let state = BlockingFutureState::<()>::new();
        assert_eq!(
            state.blocking_wait_until(Deadline::from_duration(Duration::from_millis(5))),
            FutureStatus::Timeout
        );
    }

    #[test]
    fn broken_promise() {
        let mut promise = Promise::<u32>::new();
        let mut future = promise.get_future().unwrap();
        assert!(matches!(
            promise.get_future(),
            Err(FutureError::FutureAlreadyRetrieved)
        ));
        drop(promise);

        assert!(future.is_ready());
        assert!(matches!(
            future.blocking_get(),
            Err(FutureError::BrokenPromise)
        ));
    }

    #[test]
    fn exception_is_reported() {
        let mut promise = Promise::<u32>::new();
        let mut future = promise.get_future().unwrap();
        promise.set_exception("boom").unwrap();

        let mut get = task::spawn(future.get());
        let err = assert_ready!(get.poll()).unwrap_err();
        assert_eq!(err.to_string(), "promise failed: boom");
    }

    #[test]
    fn abandoned_get_keeps_the_value() {
        let mut promise = Promise::<u32>::new();
        let mut future = promise.get_future().unwrap();

        {
            let mut get = task::spawn(future.get());
            assert_pending!(get.poll());
        }
        assert!(future.is_valid());

        promise.set_value(7).unwrap();
        let mut get = task::spawn(future.get());
        assert_eq!(assert_ready!(get.poll()).unwrap(), 7);
        drop(get);
        assert!(!future.is_valid());
    }

    #[test]
    #[should_panic = "after its value was retrieved"]
    fn invalid_future_panics() {
        let mut promise = Promise::new();
        let mut future = promise.get_future().unwrap();
        promise.set_value(()).unwrap();
        future.blocking_get().unwrap();
        future.blocking_wait();
    }
}
