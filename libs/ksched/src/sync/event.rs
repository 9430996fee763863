// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::time::Duration;

use crate::deadline::Deadline;
use crate::error::WaitError;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::sync::WaitListLight;
use crate::task::Suspend;

/// What a successful wait does to the signal of a [`SingleConsumerEvent`].
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResetPolicy {
    /// A successful wait consumes the signal.
    #[default]
    Auto,
    /// The signal stays set until [`SingleConsumerEvent::reset`] is called.
    Manual,
}

/// A binary signal awaited by a single consumer task.
///
/// Any number of producers may [`send`](Self::send), but at most one task may wait at a time.
/// A second concurrent waiter is a programming error and panics.
pub struct SingleConsumerEvent {
    signal: AtomicBool,
    policy: ResetPolicy,
    waiters: WaitListLight,
}

// === impl SingleConsumerEvent ===

impl SingleConsumerEvent {
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(ResetPolicy::Auto)
    }

    #[must_use]
    pub fn with_policy(policy: ResetPolicy) -> Self {
        Self {
            signal: AtomicBool::new(false),
            policy,
            waiters: WaitListLight::new(),
        }
    }

    /// Set the signal and wake the waiting task, if any.
    pub fn send(&self) {
        self.signal.store(true, Ordering::SeqCst);
        self.waiters.wakeup_one();
    }

    /// Clear the signal.
    pub fn reset(&self) {
        self.signal.store(false, Ordering::SeqCst);
    }

    /// Returns `true` if the signal is currently set.
    pub fn is_ready(&self) -> bool {
        self.signal.load(Ordering::SeqCst)
    }

    /// Wait for the signal, giving up at `deadline` or when the task is asked to cancel.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Timeout`] or [`WaitError::Cancelled`] if the signal did not
    /// arrive in time. A signal that is already set is consumed even if the deadline already
    /// passed.
    ///
    /// # Panics
    ///
    /// Panics if another task is waiting on this event at the same time.
    pub async fn wait_until(&self, deadline: Deadline) -> Result<(), WaitError> {
        loop {
            if self.try_consume() {
                return Ok(());
            }

            let source = Suspend::new(self.waiters.wait(), || self.is_ready(), deadline).await;

            if let Some(err) = WaitError::from_wakeup(source) {
                // the signal may have arrived together with the timeout/cancellation
                return if self.try_consume() { Ok(()) } else { Err(err) };
            }
        }
    }

    /// Wait for the signal until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Cancelled`] if the task was asked to cancel first.
    ///
    /// # Panics
    ///
    /// Panics if another task is waiting on this event at the same time.
    pub async fn wait(&self) -> Result<(), WaitError> {
        self.wait_until(Deadline::unreachable()).await
    }

    /// Like [`SingleConsumerEvent::wait_until`] with a deadline `timeout` from now.
    ///
    /// # Errors
    ///
    /// See [`SingleConsumerEvent::wait_until`].
    ///
    /// # Panics
    ///
    /// Panics if another task is waiting on this event at the same time.
    pub async fn wait_for(&self, timeout: Duration) -> Result<(), WaitError> {
        self.wait_until(Deadline::from_duration(timeout)).await
    }

    fn try_consume(&self) -> bool {
        match self.policy {
            ResetPolicy::Auto => self.signal.swap(false, Ordering::SeqCst),
            ResetPolicy::Manual => self.signal.load(Ordering::SeqCst),
        }
    }
}

impl Default for SingleConsumerEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SingleConsumerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleConsumerEvent")
            .field("signal", &self.is_ready())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[test]
    fn auto_reset() {
        let event = SingleConsumerEvent::new();
        event.send();
        assert!(event.is_ready());

        let mut wait = task::spawn(event.wait());
        assert_ready_eq!(wait.poll(), Ok(()));
        assert!(!event.is_ready());

        let mut wait = task::spawn(event.wait());
        assert_pending!(wait.poll());
        event.send();
        assert!(wait.is_woken());
        assert_ready_eq!(wait.poll(), Ok(()));
    }

    #[test]
    fn manual_reset() {
        let event = SingleConsumerEvent::with_policy(ResetPolicy::Manual);
        event.send();

        for _ in 0..3 {
            let mut wait = task::spawn(event.wait());
            assert_ready_eq!(wait.poll(), Ok(()));
        }

        event.reset();
        let mut wait = task::spawn(event.wait_until(Deadline::passed()));
        assert_ready_eq!(wait.poll(), Err(WaitError::Timeout));
    }

    #[test]
    fn set_signal_wins_over_passed_deadline() {
        let event = SingleConsumerEvent::new();
        event.send();
        let mut wait = task::spawn(event.wait_until(Deadline::passed()));
        assert_ready_eq!(wait.poll(), Ok(()));
    }

    #[test]
    #[should_panic = "single waiter"]
    fn second_consumer_panics() {
        let event = SingleConsumerEvent::new();
        let mut a = task::spawn(event.wait());
        assert_pending!(a.poll());
        let mut b = task::spawn(event.wait());
        let _ = b.poll();
    }
}
