// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::pin::Pin;
use core::task::{Context, Poll};

use pin_project::pin_project;

use crate::deadline::Deadline;
use crate::ev::{EventThreadPool, Timer};
use crate::task::context;

/// What ended a suspension.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum WakeupSource {
    /// The task was woken through the wait list it registered on.
    WaitList,
    /// The deadline of the wait was reached.
    DeadlineTimer,
    /// Cancellation of the task was requested (or its own deadline was reached).
    CancelRequest,
    /// No suspension took place because the early wakeup check succeeded.
    None,
}

/// The single suspension point every blocking primitive goes through.
///
/// `wait` is the wait strategy: a future that registers the current task as a waiter when it is
/// first polled and resolves once it has been woken. `early` runs exactly once, right after that
/// registration. If it returns `true` the condition the caller waits for already holds and the
/// suspension completes immediately with [`WakeupSource::None`].
///
/// A `Suspend` that is dropped before completing unregisters its waiter (by dropping `wait`) and
/// disarms its deadline timer.
#[pin_project]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub(crate) struct Suspend<W, F> {
    #[pin]
    wait: W,
    early: Option<F>,
    deadline: Deadline,
    timer: Option<Timer>,
}

impl<W, F> Suspend<W, F>
where
    W: Future<Output = ()>,
    F: FnOnce() -> bool,
{
    pub(crate) fn new(wait: W, early: F, deadline: Deadline) -> Self {
        Self {
            wait,
            early: Some(early),
            deadline,
            timer: None,
        }
    }
}

impl<W, F> Future for Suspend<W, F>
where
    W: Future<Output = ()>,
    F: FnOnce() -> bool,
{
    type Output = WakeupSource;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        // cancellation takes precedence over the deadline and a pending wakeup
        if crate::task::should_cancel() {
            return Poll::Ready(WakeupSource::CancelRequest);
        }

        if this.deadline.is_reached() {
            return Poll::Ready(WakeupSource::DeadlineTimer);
        }

        if this.wait.poll(cx).is_ready() {
            return Poll::Ready(WakeupSource::WaitList);
        }

        if let Some(early) = this.early.take() {
            if early() {
                tracing::trace!("Suspend::poll early wakeup");
                return Poll::Ready(WakeupSource::None);
            }
        }

        if this.timer.is_none() {
            // the task deadline only matters while cancellation is not blocked
            let task_deadline = context::with_current(|header| match header {
                Some(header) if !header.is_cancellation_blocked() => header.deadline(),
                _ => Deadline::unreachable(),
            });
            let deadline = (*this.deadline).min(task_deadline);

            if deadline.is_reachable() {
                let waker = cx.waker().clone();
                let control = EventThreadPool::default_pool().next_thread();
                *this.timer = Some(Timer::start(control, move || waker.wake(), deadline));
            }
        }

        Poll::Pending
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use core::time::Duration;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[test]
    fn early_wakeup_skips_suspension() {
        let mut suspend = task::spawn(Suspend::new(
            core::future::pending::<()>(),
            || true,
            Deadline::unreachable(),
        ));
        assert_ready_eq!(suspend.poll(), WakeupSource::None);
    }

    #[test]
    fn ready_wait_reports_wait_list() {
        let mut suspend = task::spawn(Suspend::new(
            core::future::ready(()),
            || panic!("the early check must not run after a wakeup"),
            Deadline::unreachable(),
        ));
        assert_ready_eq!(suspend.poll(), WakeupSource::WaitList);
    }

    #[test]
    fn passed_deadline() {
        let mut suspend = task::spawn(Suspend::new(
            core::future::pending::<()>(),
            || false,
            Deadline::passed(),
        ));
        assert_ready_eq!(suspend.poll(), WakeupSource::DeadlineTimer);
    }

    #[test]
    fn early_check_runs_once() {
        let ran = Arc::new(AtomicBool::new(false));
        let mut suspend = task::spawn(Suspend::new(
            core::future::pending::<()>(),
            {
                let ran = ran.clone();
                move || {
                    assert!(!ran.swap(true, Ordering::Relaxed));
                    false
                }
            },
            Deadline::unreachable(),
        ));
        assert_pending!(suspend.poll());
        assert_pending!(suspend.poll());
        assert!(ran.load(Ordering::Relaxed));
    }

    #[test]
    fn deadline_timer_wakes() {
        let mut suspend = task::spawn(Suspend::new(
            core::future::pending::<()>(),
            || false,
            Deadline::from_duration(Duration::from_millis(20)),
        ));
        assert_pending!(suspend.poll());

        let start = std::time::Instant::now();
        while !suspend.is_woken() {
            assert!(start.elapsed() < Duration::from_secs(5), "timer never fired");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_ready_eq!(suspend.poll(), WakeupSource::DeadlineTimer);
    }
}
