// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![expect(
    impl_trait_overcaptures,
    reason = "mycelium_bitfield is not updated to edition 2024 yet"
)]

use core::fmt;

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::util::loom_const_fn;

/// Task state. The task stores its state in an atomic `usize` with various bitfields for the
/// necessary information. The state has the following layout:
///
/// ```text
/// | 5       | 4       | 3         | 2     | 1        | 0       |
/// | aborted | started | cancelled | woken | complete | polling |
/// ```
///
/// Reference counting is not part of the state word, tasks are kept alive by the `Arc` they are
/// allocated in.
pub(crate) struct State {
    val: AtomicUsize,
}

mycelium_bitfield::bitfield! {
    /// A snapshot of a task's current state.
    #[derive(PartialEq, Eq)]
    pub(crate) struct Snapshot<usize> {
        /// If set, this task is currently being polled.
        pub(crate) const POLLING: bool;
        /// If set, this task reached a terminal state and its future has been (or is about to
        /// be) dropped.
        pub(crate) const COMPLETE: bool;
        /// If set, this task's `Waker` has been woken and the task sits in a ready queue (or
        /// will be pushed into one at the end of the current poll).
        pub(crate) const WOKEN: bool;
        /// If set, cancellation of this task has been requested.
        pub(crate) const CANCELLED: bool;
        /// If set, this task has been polled at least once.
        pub(crate) const STARTED: bool;
        /// If set, this task terminated without its future running to completion (it was
        /// cancelled before it ever ran, or the processor shut down underneath it).
        pub(crate) const ABORTED: bool;
    }
}

/// The externally observable lifecycle state of a task.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TaskState {
    /// The task has been created but not yet handed to a processor.
    New,
    /// The task sits in a ready queue waiting for a worker.
    Queued,
    /// A worker is currently executing the task.
    Running,
    /// The task is waiting for a wakeup (a wait list, a timer, the reactor).
    Suspended,
    /// The task's future ran to completion (or panicked).
    Completed,
    /// The task terminated without running to completion.
    Cancelled,
}

#[must_use]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum StartPollAction {
    /// Successful transition, it's okay to poll the task.
    Poll,
    /// The task is already completed or (which should never happen) running on another thread,
    /// either way we must not touch it.
    DontPoll,
    /// The task was cancelled before it ever ran. It has been transitioned to its terminal
    /// state and the caller must drop its future without polling it.
    Cancelled,
}

/// Outcome of polling a task, telling the worker what to do with its `TaskRef`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PollResult {
    /// The task has reached a terminal state, the worker drops its reference.
    Ready,
    /// The task is suspended. Whoever intends to wake it later holds a clone of its `Waker`,
    /// so the worker drops its reference.
    Pending,
    /// The task has been woken during the poll and must be pushed back onto a ready queue
    /// by the worker, reusing its reference.
    PendingSchedule,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum WakeAction {
    /// The task should be enqueued.
    Enqueue,
    /// The task does not need to be enqueued.
    None,
}

// === impl State ===

impl State {
    loom_const_fn! {
        /// Returns a task's initial state.
        pub(super) const fn new() -> State {
            State {
                val: AtomicUsize::new(0),
            }
        }
    }

    pub(crate) fn load(&self, ordering: Ordering) -> Snapshot {
        Snapshot(self.val.load(ordering))
    }

    /// Attempt to transition the task to `POLLING`, the returned enum indicates what to do
    /// with the task.
    ///
    /// A successful transition must always be followed by a call to [`Self::end_poll`].
    pub(super) fn start_poll(&self) -> StartPollAction {
        self.transition(|s| {
            // cannot start polling a task which is being polled on another
            // thread, or a task which has completed
            if s.get(Snapshot::POLLING) || s.get(Snapshot::COMPLETE) {
                return StartPollAction::DontPoll;
            }

            // tasks cancelled before they ever ran are not polled at all
            if s.get(Snapshot::CANCELLED) && !s.get(Snapshot::STARTED) {
                s.set(Snapshot::COMPLETE, true)
                    .set(Snapshot::ABORTED, true)
                    .set(Snapshot::WOKEN, false);
                return StartPollAction::Cancelled;
            }

            s.set(Snapshot::POLLING, true)
                .set(Snapshot::STARTED, true)
                // consume the wakeup.
                .set(Snapshot::WOKEN, false);

            StartPollAction::Poll
        })
    }

    /// Transition the task from `POLLING` back to idle. `completed` must be set when the
    /// polled future returned `Poll::Ready` (or panicked).
    pub(super) fn end_poll(&self, completed: bool) -> PollResult {
        self.transition(|s| {
            debug_assert!(s.get(Snapshot::POLLING));
            debug_assert!(!s.get(Snapshot::COMPLETE));

            s.set(Snapshot::POLLING, false)
                .set(Snapshot::COMPLETE, completed);

            if completed {
                s.set(Snapshot::WOKEN, false);
                PollResult::Ready
            } else if s.get(Snapshot::WOKEN) {
                // the WOKEN bit stays set, the worker re-enqueues the task
                PollResult::PendingSchedule
            } else {
                PollResult::Pending
            }
        })
    }

    pub(super) fn wake(&self) -> WakeAction {
        self.transition(|s| {
            if s.get(Snapshot::COMPLETE) || s.get(Snapshot::WOKEN) {
                return WakeAction::None;
            }

            s.set(Snapshot::WOKEN, true);

            // If the task was woken *during* a poll, it will be re-queued by the
            // worker at the end of the poll, so don't enqueue it now.
            if s.get(Snapshot::POLLING) {
                WakeAction::None
            } else {
                WakeAction::Enqueue
            }
        })
    }

    /// Request cancellation of the task.
    ///
    /// Returns `true` if this call transitioned the task to cancelled, `false` if cancellation
    /// was already requested or the task has completed.
    pub(super) fn cancel(&self) -> bool {
        self.transition(|s| {
            if s.get(Snapshot::CANCELLED) || s.get(Snapshot::COMPLETE) {
                return false;
            }

            s.set(Snapshot::CANCELLED, true);
            true
        })
    }

    /// Forcibly transition the task into its terminal state.
    ///
    /// Returns `true` if the caller is now responsible for dropping the task's future. Used
    /// when a processor shuts down, at which point no worker may poll the task anymore.
    pub(super) fn shutdown(&self) -> bool {
        self.transition(|s| {
            if s.get(Snapshot::COMPLETE) {
                return false;
            }

            debug_assert!(
                !s.get(Snapshot::POLLING),
                "tried to shut down a task that is being polled"
            );

            s.set(Snapshot::COMPLETE, true)
                .set(Snapshot::ABORTED, true)
                .set(Snapshot::CANCELLED, true)
                .set(Snapshot::WOKEN, false);
            true
        })
    }

    pub(crate) fn task_state(&self) -> TaskState {
        let s = self.load(Ordering::Acquire);

        if s.get(Snapshot::ABORTED) {
            TaskState::Cancelled
        } else if s.get(Snapshot::COMPLETE) {
            TaskState::Completed
        } else if s.get(Snapshot::POLLING) {
            TaskState::Running
        } else if s.get(Snapshot::WOKEN) {
            TaskState::Queued
        } else if !s.get(Snapshot::STARTED) {
            TaskState::New
        } else {
            TaskState::Suspended
        }
    }

    fn transition<T>(&self, mut transition: impl FnMut(&mut Snapshot) -> T) -> T {
        let mut current = self.load(Ordering::Acquire);
        loop {
            let mut next = current;
            // Run the transition function.
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            tracing::trace!("State::transition; current:\n{}\nnext:\n{}", current, next);
            match self.val.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Snapshot(actual),
            }
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let state = State::new();
        assert_eq!(state.task_state(), TaskState::New);

        assert_eq!(state.wake(), WakeAction::Enqueue);
        assert_eq!(state.task_state(), TaskState::Queued);
        // a second wakeup must not enqueue the task twice
        assert_eq!(state.wake(), WakeAction::None);

        assert_eq!(state.start_poll(), StartPollAction::Poll);
        assert_eq!(state.task_state(), TaskState::Running);
        assert_eq!(state.end_poll(false), PollResult::Pending);
        assert_eq!(state.task_state(), TaskState::Suspended);

        assert_eq!(state.wake(), WakeAction::Enqueue);
        assert_eq!(state.start_poll(), StartPollAction::Poll);
        assert_eq!(state.end_poll(true), PollResult::Ready);
        assert_eq!(state.task_state(), TaskState::Completed);

        // completed tasks are never enqueued or polled again
        assert_eq!(state.wake(), WakeAction::None);
        assert_eq!(state.start_poll(), StartPollAction::DontPoll);
    }

    #[test]
    fn wake_while_polling_reschedules() {
        let state = State::new();
        assert_eq!(state.wake(), WakeAction::Enqueue);
        assert_eq!(state.start_poll(), StartPollAction::Poll);

        assert_eq!(state.wake(), WakeAction::None);
        assert_eq!(state.end_poll(false), PollResult::PendingSchedule);
        assert_eq!(state.task_state(), TaskState::Queued);
    }

    #[test]
    fn cancel_before_start() {
        let state = State::new();
        assert_eq!(state.wake(), WakeAction::Enqueue);
        assert!(state.cancel());
        assert!(!state.cancel(), "cancellation is only requested once");

        assert_eq!(state.start_poll(), StartPollAction::Cancelled);
        assert_eq!(state.task_state(), TaskState::Cancelled);
    }

    #[test]
    fn cancel_after_start_still_polls() {
        let state = State::new();
        assert_eq!(state.wake(), WakeAction::Enqueue);
        assert_eq!(state.start_poll(), StartPollAction::Poll);
        assert_eq!(state.end_poll(false), PollResult::Pending);

        assert!(state.cancel());
        assert_eq!(state.wake(), WakeAction::Enqueue);
        assert_eq!(state.start_poll(), StartPollAction::Poll);
        assert_eq!(state.end_poll(true), PollResult::Ready);
        assert_eq!(state.task_state(), TaskState::Completed);
    }

    #[test]
    fn shutdown_is_terminal() {
        let state = State::new();
        assert_eq!(state.wake(), WakeAction::Enqueue);
        assert!(state.shutdown());
        assert!(!state.shutdown());
        assert_eq!(state.task_state(), TaskState::Cancelled);
        assert_eq!(state.start_poll(), StartPollAction::DontPoll);
        assert!(!state.cancel());
    }
}
