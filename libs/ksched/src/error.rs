// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::task::WakeupSource;

/// Errors returned by [`TaskProcessor::try_spawn`](crate::processor::TaskProcessor::try_spawn)
/// and [`TaskBuilder::try_spawn`](crate::task::TaskBuilder::try_spawn).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum SpawnError {
    /// The task processor has been shut down and no longer accepts tasks.
    Closed,
}

impl From<Closed> for SpawnError {
    fn from(_: Closed) -> Self {
        Self::Closed
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::Closed => f.write_str("task processor was shut down"),
        }
    }
}

impl core::error::Error for SpawnError {}

/// The resource (an event loop, a wait cell) was closed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Closed(pub(crate) ());

impl Closed {
    pub(crate) const fn new() -> Self {
        Self(())
    }
}

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("closed")
    }
}

impl core::error::Error for Closed {}

/// Why a deadline-aware wait returned without the awaited condition becoming true.
///
/// Timeouts and cancellation happen routinely, so they are ordinary return values and never
/// panics.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum WaitError {
    /// The deadline passed before the condition became true.
    Timeout,
    /// The waiting task was asked to cancel.
    Cancelled,
}

impl WaitError {
    /// Maps the outcome of a suspension that did *not* end because of a wakeup.
    ///
    /// Returns `None` for [`WakeupSource::WaitList`] and [`WakeupSource::None`] since the caller
    /// has to re-check its condition in those cases.
    pub(crate) fn from_wakeup(source: WakeupSource) -> Option<Self> {
        match source {
            WakeupSource::DeadlineTimer => Some(Self::Timeout),
            WakeupSource::CancelRequest => Some(Self::Cancelled),
            WakeupSource::WaitList | WakeupSource::None => None,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Timeout => f.write_str("deadline reached while waiting"),
            WaitError::Cancelled => f.write_str("wait interrupted by a cancellation request"),
        }
    }
}

impl core::error::Error for WaitError {}
