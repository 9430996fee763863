// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::panic::{RefUnwindSafe, UnwindSafe};
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use core::fmt;

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::error::Closed;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::Waiters;
use crate::util::{CachePadded, loom_const_fn};

/// A wait list for exactly one waiting task.
///
/// Instead of a locked list this stores the [`Waker`] of the single waiter next to an atomic
/// state word. Unlike [`WaitList`](super::WaitList), a wakeup issued while nobody waits is
/// *remembered*: the next registration completes immediately. Callers re-check their condition
/// after every wakeup anyway, so a remembered wakeup only costs one extra check.
///
/// Registering a second waiter while the first one is still waiting is a programming error and
/// reported as [`PollWaitError::Busy`].
pub struct WaitListLight {
    state: CachePadded<AtomicUsize>,
    waker: UnsafeCell<Option<Waker>>,
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    struct State: usize {
        const WAITING = 0b0000;
        const REGISTERING = 0b0001;
        const WAKING = 0b0010;
        const WOKEN = 0b0100;
        const CLOSED = 0b1000;
    }
}
// WAITING MUST be zero
const_assert_eq!(State::WAITING.bits(), 0);

/// Future returned from [`WaitListLight::wait()`].
///
/// Completes once the list was woken or closed. Dropping a registered `Wait` removes its
/// waker from the list.
#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Wait<'a> {
    list: &'a WaitListLight,
    registered: bool,
    done: bool,
}

/// An error indicating that a [`WaitListLight`] was closed or busy while
/// attempting register a [`Waker`].
///
/// This error is returned by the [`WaitListLight::poll_wait`] method.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PollWaitError {
    /// The [`Waker`] was not registered because the list has been
    /// [closed](WaitListLight::close).
    Closed,
    /// The [`Waker`] was not registered because another task is already waiting
    /// or concurrently storing its own [`Waker`].
    Busy,
}

// === impl WaitListLight ===

impl WaitListLight {
    loom_const_fn! {
        #[must_use]
        pub const fn new() -> Self {
            Self {
                state: CachePadded(AtomicUsize::new(State::WAITING.bits())),
                waker: UnsafeCell::new(None),
            }
        }
    }

    /// Register the current task to be woken by this list.
    ///
    /// Returns `Ready(Ok(()))` right away if a wakeup was issued since the last registration,
    /// `Pending` once the waker was stored. Re-polling from the same task just refreshes the
    /// stored waker.
    ///
    /// # Errors
    ///
    /// Returns [`PollWaitError::Closed`] once the list was closed and [`PollWaitError::Busy`]
    /// if another task is registering concurrently.
    pub fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<Result<(), PollWaitError>> {
        self.register(cx.waker(), false)
    }

    fn register(&self, waker: &Waker, exclusive: bool) -> Poll<Result<(), PollWaitError>> {
        // this is based on tokio's AtomicWaker synchronization strategy
        match self.compare_exchange(State::WAITING, State::REGISTERING, Ordering::Acquire) {
            Err(actual) if actual.contains(State::CLOSED) => {
                return Poll::Ready(Err(PollWaitError::Closed));
            }
            Err(actual) if actual.contains(State::WOKEN) => {
                // take the wakeup
                self.fetch_and(!State::WOKEN, Ordering::Release);
                return Poll::Ready(Ok(()));
            }
            // someone else is notifying, so don't wait!
            Err(actual) if actual.contains(State::WAKING) => {
                return Poll::Ready(Ok(()));
            }
            Err(_) => return Poll::Ready(Err(PollWaitError::Busy)),
            Ok(_) => {}
        }

        tracing::trace!(list = ?self, ?waker, "registering waker");

        // Safety: we hold the REGISTERING bit, no one else is touching the waker right now
        let prev_waker = self.waker.with_mut(|slot| unsafe {
            match &mut *slot {
                Some(old_waker) if waker.will_wake(old_waker) => Ok(None),
                Some(_) if exclusive => Err(()),
                old => Ok(old.replace(waker.clone())),
            }
        });

        let prev_waker = match prev_waker {
            Ok(prev) => prev,
            Err(()) => {
                // a different task is parked here, leave its registration alone
                if self
                    .compare_exchange(State::REGISTERING, State::WAITING, Ordering::AcqRel)
                    .is_err()
                {
                    // a wakeup raced with us and skipped the parked waker, deliver it
                    // Safety: we still hold the REGISTERING bit
                    let waker = self.waker.with_mut(|slot| unsafe { (*slot).take() });
                    self.fetch_and(State::CLOSED, Ordering::AcqRel);
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                }
                return Poll::Ready(Err(PollWaitError::Busy));
            }
        };

        if let Some(prev_waker) = prev_waker {
            tracing::trace!("replaced an old waker, waking");
            prev_waker.wake();
        }

        if let Err(actual) =
            self.compare_exchange(State::REGISTERING, State::WAITING, Ordering::AcqRel)
        {
            // We were notified while registering: either woken or closed.
            tracing::trace!(state = ?actual, "was notified");
            // Safety: we still hold the REGISTERING bit
            let waker = self.waker.with_mut(|slot| unsafe { (*slot).take() });

            // Reset to the WAITING state by clearing everything *except*
            // the closed bit (which must remain set).
            let state = self.fetch_and(State::CLOSED, Ordering::AcqRel);
            debug_assert!(
                state == actual || state == actual | State::CLOSED,
                "state changed unexpectedly while parking!"
            );

            if let Some(waker) = waker {
                waker.wake();
            }

            if state.contains(State::CLOSED) {
                return Poll::Ready(Err(PollWaitError::Closed));
            }

            return Poll::Ready(Ok(()));
        }

        // Waker registered, time to yield!
        Poll::Pending
    }

    /// Wait to be woken up by this list.
    ///
    /// The task is registered when the returned future is first polled. Completes once woken,
    /// or once the list is closed.
    ///
    /// # Panics
    ///
    /// Polling the future panics if another task is already waiting on this list.
    pub fn wait(&self) -> Wait<'_> {
        Wait {
            list: self,
            registered: false,
            done: false,
        }
    }

    /// Wake the waiting task.
    ///
    /// Returns `true` if a task was woken. Otherwise the wakeup is stored and consumed by the
    /// next registration.
    pub fn wakeup_one(&self) -> bool {
        self.wake()
    }

    fn wake(&self) -> bool {
        if let Some(waker) = self.take_waker(false) {
            waker.wake();
            true
        } else {
            false
        }
    }

    /// Close the list, waking the waiting task.
    ///
    /// Every following registration fails with [`PollWaitError::Closed`]. Returns `true` if a
    /// task was woken.
    pub fn close(&self) -> bool {
        if let Some(waker) = self.take_waker(true) {
            waker.wake();
            true
        } else {
            false
        }
    }

    /// Returns `true` if this list was [closed](Self::close).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.current_state().contains(State::CLOSED)
    }

    /// Wait until `f` returns `true`, re-checking it after every wakeup.
    ///
    /// The waiter is registered *before* `f` runs, so a wakeup issued between a failed check
    /// and the suspension is never lost.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the list was closed before `f` returned `true`.
    ///
    /// # Panics
    ///
    /// Panics if another task is already waiting on this list.
    pub async fn wait_for<F: FnMut() -> bool>(&self, mut f: F) -> Result<(), Closed> {
        loop {
            let mut wait = core::pin::pin!(self.wait());
            // register first
            let registered =
                core::future::poll_fn(|cx| Poll::Ready(wait.as_mut().poll(cx))).await;
            if f() {
                return Ok(());
            }
            if self.is_closed() {
                return Err(Closed::new());
            }
            if registered.is_pending() {
                wait.await;
            }
        }
    }

    fn take_waker(&self, close: bool) -> Option<Waker> {
        // Set the WAKING bit (to indicate that we're touching the waker) and
        // the WOKEN bit (to indicate that we intend to wake it up).
        let state = {
            let mut bits = State::WAKING | State::WOKEN;
            if close {
                bits |= State::CLOSED;
            }
            self.fetch_or(bits, Ordering::AcqRel)
        };

        // Is anyone else touching the waker?
        if !state.intersects(State::WAKING | State::REGISTERING | State::CLOSED) {
            // Safety: we hold the WAKING bit, no one else is touching the waker right now
            let waker = self.waker.with_mut(|slot| unsafe { (*slot).take() });

            // Release the lock.
            self.fetch_and(!State::WAKING, Ordering::Release);

            if let Some(waker) = waker {
                tracing::trace!(list = ?self, ?close, ?waker, "notified");
                return Some(waker);
            }
        }

        None
    }

    /// Remove a registered waker without consuming a stored wakeup.
    fn unregister(&self) {
        if self
            .compare_exchange(State::WAITING, State::REGISTERING, Ordering::Acquire)
            .is_err()
        {
            // woken, closed or being woken: the waker is (being) taken by someone else
            return;
        }

        // Safety: we hold the REGISTERING bit
        let waker = self.waker.with_mut(|slot| unsafe { (*slot).take() });

        if self
            .compare_exchange(State::REGISTERING, State::WAITING, Ordering::AcqRel)
            .is_err()
        {
            // a wakeup arrived while we held the slot, keep it stored for the next waiter
            self.fetch_and(State::CLOSED | State::WOKEN, Ordering::AcqRel);
        }

        drop(waker);
    }

    #[inline(always)]
    fn compare_exchange(&self, curr: State, new: State, success: Ordering) -> Result<State, State> {
        self.state
            .0
            .compare_exchange(curr.bits(), new.bits(), success, Ordering::Acquire)
            .map(State::from_bits_retain)
            .map_err(State::from_bits_retain)
    }

    #[inline(always)]
    fn fetch_and(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.0.fetch_and(state.bits(), order))
    }

    #[inline(always)]
    fn fetch_or(&self, state: State, order: Ordering) -> State {
        State::from_bits_retain(self.state.0.fetch_or(state.bits(), order))
    }

    #[inline(always)]
    fn current_state(&self) -> State {
        State::from_bits_retain(self.state.0.load(Ordering::Acquire))
    }
}

impl Default for WaitListLight {
    fn default() -> Self {
        WaitListLight::new()
    }
}

impl RefUnwindSafe for WaitListLight {}
impl UnwindSafe for WaitListLight {}

// Safety: `WaitListLight` synchronizes all accesses through atomic operations
unsafe impl Send for WaitListLight {}
// Safety: `WaitListLight` synchronizes all accesses through atomic operations
unsafe impl Sync for WaitListLight {}

impl fmt::Debug for WaitListLight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitListLight")
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

impl Drop for WaitListLight {
    fn drop(&mut self) {
        self.close();
    }
}

impl Waiters for WaitListLight {
    type Wait<'a> = Wait<'a>;

    fn wait(&self) -> Self::Wait<'_> {
        WaitListLight::wait(self)
    }

    fn wakeup_one(&self) {
        WaitListLight::wakeup_one(self);
    }

    fn wakeup_all(&self) {
        WaitListLight::wakeup_one(self);
    }
}

// === impl Wait ===

impl Future for Wait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.done {
            return Poll::Ready(());
        }

        let exclusive = !self.registered;
        let Poll::Ready(res) = self.list.register(cx.waker(), exclusive) else {
            self.registered = true;
            return Poll::Pending;
        };
        self.registered = false;
        self.done = true;

        match res {
            Ok(()) | Err(PollWaitError::Closed) => Poll::Ready(()),
            Err(PollWaitError::Busy) => {
                panic!("a WaitListLight supports a single waiter, but another task is waiting")
            }
        }
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        // `register` returning `Pending` is the only way to end up with a stored waker
        if self.registered {
            self.list.unregister();
        }
    }
}

#[cfg(all(not(loom), test))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use tokio_test::{assert_pending, assert_ready, assert_ready_eq, task};
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn wait_smoke() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let list = Arc::new(WaitListLight::new());

        let mut task = task::spawn({
            let list = list.clone();
            async move { list.wait().await }
        });

        assert_pending!(task.poll());
        assert!(list.wakeup_one());
        assert!(task.is_woken());
        assert_ready!(task.poll());
    }

    #[test]
    fn wakeup_is_remembered() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let list = WaitListLight::new();
        assert!(!list.wakeup_one());

        let mut task = task::spawn(list.wait());
        assert_ready!(task.poll());

        // consumed
        let mut task = task::spawn(list.wait());
        assert_pending!(task.poll());
    }

    #[test]
    fn spurious_poll() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let list = Arc::new(WaitListLight::new());
        let mut task = task::spawn({
            let list = list.clone();
            async move { list.wait().await }
        });

        assert_pending!(task.poll(), "first poll should be pending");
        assert_pending!(task.poll(), "second poll should be pending");

        list.wakeup_one();

        assert_ready!(task.poll(), "should have been woken");
    }

    #[test]
    fn close_wakes_and_sticks() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let list = WaitListLight::new();
        let mut task = task::spawn(list.wait());
        assert_pending!(task.poll());

        assert!(list.close());
        assert!(list.is_closed());
        assert!(task.is_woken());
        assert_ready!(task.poll());

        let mut task = task::spawn(list.wait());
        assert_ready!(task.poll());

        let mut task = task::spawn(list.wait_for(|| false));
        assert_ready_eq!(task.poll(), Err(Closed::new()));
    }

    #[test]
    #[should_panic = "single waiter"]
    fn second_waiter_is_busy() {
        let list = WaitListLight::new();
        let mut first = task::spawn(list.wait());
        assert_pending!(first.poll());

        let mut second = task::spawn(list.wait());
        let _ = second.poll();
    }

    #[test]
    fn poll_wait_reports_busy() {
        let list = WaitListLight::new();
        let mut first = task::spawn(list.wait());
        assert_pending!(first.poll());

        let mut second = task::spawn(core::future::poll_fn(|cx| {
            Poll::Ready(list.register(cx.waker(), true))
        }));
        assert_ready_eq!(second.poll(), Poll::Ready(Err(PollWaitError::Busy)));

        // the first waiter is still registered
        assert!(list.wakeup_one());
        assert!(first.is_woken());
    }

    #[test]
    fn dropped_waiter_frees_the_slot() {
        let list = WaitListLight::new();
        let mut first = task::spawn(list.wait());
        assert_pending!(first.poll());
        drop(first);

        let mut second = task::spawn(list.wait());
        assert_pending!(second.poll());
        assert!(list.wakeup_one());
        assert_ready!(second.poll());
    }

    #[test]
    fn wait_for_checks_after_registering() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        let list = Arc::new(WaitListLight::new());
        let flag = Arc::new(AtomicBool::new(false));

        let mut task = task::spawn({
            let list = list.clone();
            let flag = flag.clone();
            async move {
                list.wait_for(|| flag.load(std::sync::atomic::Ordering::SeqCst))
                    .await
            }
        });

        assert_pending!(task.poll());
        assert!(!task.is_woken());

        // spurious wakeup, condition still false
        list.wakeup_one();
        assert!(task.is_woken());
        assert_pending!(task.poll());

        flag.store(true, std::sync::atomic::Ordering::SeqCst);
        list.wakeup_one();
        assert!(task.is_woken());
        assert_ready_eq!(task.poll(), Ok(()));
    }
}

#[cfg(all(loom, test))]
mod loom {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::sync::atomic::AtomicBool;
    use crate::loom::thread;

    #[test]
    fn wake_is_not_lost() {
        crate::loom::model(|| {
            let list = Arc::new(WaitListLight::new());
            let flag = Arc::new(AtomicBool::new(false));

            let t = thread::spawn({
                let list = list.clone();
                let flag = flag.clone();
                move || {
                    flag.store(true, Ordering::SeqCst);
                    list.wakeup_one();
                }
            });

            let res = ::loom::future::block_on(list.wait_for(|| flag.load(Ordering::SeqCst)));
            assert_eq!(res, Ok(()));

            t.join().unwrap();
        });
    }

    #[test]
    fn close_wakes_waiter() {
        crate::loom::model(|| {
            let list = Arc::new(WaitListLight::new());

            let t = thread::spawn({
                let list = list.clone();
                move || {
                    list.close();
                }
            });

            let res = ::loom::future::block_on(list.wait_for(|| false));
            assert_eq!(res, Err(Closed::new()));

            t.join().unwrap();
        });
    }
}
