// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread-local bookkeeping of what the current thread is doing: which task it polls and which
//! processor worker it is.

use core::cell::Cell;
use core::mem::ManuallyDrop;
use core::ptr::NonNull;

use crate::loom::thread_local;
use crate::task::{Header, Id, TaskRef};

/// The task running on this thread.
#[derive(Copy, Clone)]
struct Current {
    header: NonNull<Header>,
    /// `false` while the task allocation itself is being torn down, its reference count is
    /// zero then and must not be raised again.
    retainable: bool,
}

thread_local! {
    static CURRENT_TASK: Cell<Option<Current>> = Cell::new(None);
    static CURRENT_WORKER: Cell<Option<(usize, usize)>> = Cell::new(None);
    static THREAD_OWNER_ID: Cell<u64> = Cell::new(0);
}

/// Restores the previously running task when dropped.
#[must_use]
pub(crate) struct EnterTask {
    prev: Option<Current>,
}

/// Restores the previous worker identity when dropped.
#[must_use]
pub(crate) struct EnterWorker {
    prev: Option<(usize, usize)>,
}

/// Mark the task behind `header` as the one running on this thread until the guard is dropped.
pub(crate) fn enter_task(header: NonNull<Header>) -> EnterTask {
    enter(Current {
        header,
        retainable: true,
    })
}

/// Like [`enter_task`], for code running while the task allocation is deallocated.
pub(crate) fn enter_dying_task(header: NonNull<Header>) -> EnterTask {
    enter(Current {
        header,
        retainable: false,
    })
}

fn enter(task: Current) -> EnterTask {
    let prev = CURRENT_TASK.with(|current| current.replace(Some(task)));
    EnterTask { prev }
}

impl Drop for EnterTask {
    fn drop(&mut self) {
        CURRENT_TASK.with(|current| current.set(self.prev));
    }
}

/// Call `f` with the header of the task running on this thread, if any.
pub(crate) fn with_current<R>(f: impl FnOnce(Option<&Header>) -> R) -> R {
    let current = CURRENT_TASK.with(Cell::get);
    // Safety: the pointer is only installed while the task is being polled or dropped, during
    // which the task allocation is kept alive by the caller of `enter_task`.
    f(current.map(|task| unsafe { task.header.as_ref() }))
}

pub(crate) fn current_task_ptr() -> Option<NonNull<Header>> {
    CURRENT_TASK.with(Cell::get).map(|task| task.header)
}

/// A new reference to the task running on this thread.
///
/// `None` outside of a task and while the task's allocation is being torn down.
pub(crate) fn current_task_ref() -> Option<TaskRef> {
    let task = CURRENT_TASK.with(Cell::get).filter(|task| task.retainable)?;
    // Safety: a retainable task is kept alive by whoever entered it, the `ManuallyDrop` makes
    // sure we only add a reference and never give up the borrowed one
    let borrowed = ManuallyDrop::new(unsafe { TaskRef::from_raw(task.header) });
    Some(TaskRef::clone(&borrowed))
}

/// Mark this thread as worker `index` of the processor identified by `processor`.
pub(crate) fn enter_worker(processor: usize, index: usize) -> EnterWorker {
    let prev = CURRENT_WORKER.with(|current| current.replace(Some((processor, index))));
    EnterWorker { prev }
}

impl Drop for EnterWorker {
    fn drop(&mut self) {
        CURRENT_WORKER.with(|current| current.set(self.prev));
    }
}

/// Returns the worker index of this thread if it is a worker of the processor `processor`.
pub(crate) fn current_worker(processor: usize) -> Option<usize> {
    CURRENT_WORKER.with(|current| match current.get() {
        Some((id, index)) if id == processor => Some(index),
        _ => None,
    })
}

/// The identity used for ownership tracking (e.g. by [`Mutex`](crate::sync::Mutex)).
///
/// Inside a task this is the task's id. Plain OS threads get a pseudo id drawn from the same
/// counter the first time they ask, so the two never collide.
pub(crate) fn current_owner_id() -> u64 {
    if let Some(id) = with_current(|header| header.map(Header::id)) {
        return id.as_u64();
    }

    THREAD_OWNER_ID.with(|owner| {
        if owner.get() == 0 {
            owner.set(Id::next().as_u64());
        }
        owner.get()
    })
}
