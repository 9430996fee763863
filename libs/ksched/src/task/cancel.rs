// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::task::context;
use crate::task::{Header, Id, TaskRef};

/// Why a task was asked to cancel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CancellationReason {
    /// Cancellation was requested through [`TaskHandle::request_cancel`](crate::task::TaskHandle::request_cancel)
    /// or [`request_cancel_current`].
    User,
    /// The deadline the task was spawned with has been reached.
    Deadline,
    /// The processor running the task is shutting down.
    Shutdown,
}

impl CancellationReason {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            CancellationReason::User => 1,
            CancellationReason::Deadline => 2,
            CancellationReason::Shutdown => 3,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(CancellationReason::User),
            2 => Some(CancellationReason::Deadline),
            3 => Some(CancellationReason::Shutdown),
            _ => None,
        }
    }
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancellationReason::User => f.write_str("user request"),
            CancellationReason::Deadline => f.write_str("task deadline reached"),
            CancellationReason::Shutdown => f.write_str("processor shutdown"),
        }
    }
}

/// Suppresses cancellation of the current task while alive.
///
/// Suspension points of a task holding at least one blocker ignore cancellation requests (and
/// the task's own deadline) and behave as if none was made. Blockers nest. Created outside of a
/// task the blocker does nothing.
///
/// The blocker keeps its task allocated, it may outlive the task (e.g. when returned as the
/// task's output).
#[must_use = "cancellation is only blocked while the blocker is alive"]
pub struct CancellationBlocker {
    task: Option<TaskRef>,
}

impl CancellationBlocker {
    pub fn new() -> Self {
        let task = context::current_task_ref();
        if let Some(task) = &task {
            task.header().add_blocker();
        }
        Self { task }
    }
}

impl Default for CancellationBlocker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancellationBlocker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.header().remove_blocker();
        }
    }
}

impl fmt::Debug for CancellationBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationBlocker")
            .field("task", &self.task.as_ref().map(TaskRef::id))
            .finish()
    }
}

/// Returns `true` if cancellation of the current task has been requested.
///
/// Unlike [`should_cancel`] this ignores [`CancellationBlocker`]s. Always `false` outside of a
/// task.
pub fn is_cancel_requested() -> bool {
    context::with_current(|header| header.is_some_and(Header::is_cancel_requested))
}

/// Returns `true` if the current task should stop what it's doing: cancellation was requested
/// (or the task deadline has been reached) and no [`CancellationBlocker`] is alive.
pub fn should_cancel() -> bool {
    context::with_current(|header| header.is_some_and(Header::should_cancel))
}

/// Returns the reason cancellation of the current task was requested with.
pub fn current_cancellation_reason() -> Option<CancellationReason> {
    context::with_current(|header| header.and_then(Header::cancellation_reason))
}

/// Requests cancellation of the current task.
///
/// The task keeps running, its next suspension point returns a cancellation result. Does nothing
/// outside of a task.
pub fn request_cancel_current() {
    context::with_current(|header| {
        if let Some(header) = header {
            header.request_cancel(CancellationReason::User);
        }
    });
}

/// Returns the [`Id`] of the currently running task, or `None` outside of a task.
pub fn current_id() -> Option<Id> {
    context::with_current(|header| header.map(Header::id))
}

/// Returns `true` when called from inside a task running on the engine.
pub fn is_in_task() -> bool {
    context::current_task_ptr().is_some()
}
