// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod builder;
mod cancel;
pub(crate) mod context;
mod handle;
mod id;
mod state;
mod suspend;
mod yield_now;

use core::any::type_name;
use core::mem::ManuallyDrop;
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::ptr::NonNull;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use core::{fmt, mem};
use std::panic;
use std::sync::Arc;

use crate::deadline::Deadline;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use crate::sync::BlockingFutureState;
use crate::task_local::Storage;

pub use builder::TaskBuilder;
pub use cancel::{
    CancellationBlocker, CancellationReason, current_cancellation_reason, current_id,
    is_cancel_requested, is_in_task, request_cancel_current, should_cancel,
};
pub use handle::{Join, JoinError, TaskHandle};
pub use id::Id;
pub(crate) use state::PollResult;
pub use state::TaskState;
use state::{StartPollAction, State, WakeAction};
pub(crate) use suspend::Suspend;
pub use suspend::WakeupSource;
pub use yield_now::yield_now;

/// The output channel shared between a task and its [`TaskHandle`].
pub(crate) type Output<T> = Arc<BlockingFutureState<Result<T, JoinError>>>;

/// The scheduler a task is bound to for its entire life.
pub(crate) trait Schedule: Send + Sync + 'static {
    /// Hand a task that became ready to the scheduler, consuming the reference.
    fn schedule(&self, task: TaskRef);

    /// Notify the scheduler that the task with the given id reached a terminal state.
    fn release(&self, id: Id);
}

/// A type-erased, reference-counted pointer to a spawned `Task`.
///
/// Spawned tasks are pinned in memory (a requirement of [`Future`]), so instead of moving tasks
/// around the processor we move `TaskRef`s which are just pointers to the pinned `Task`. `TaskRef`s
/// interact with the allocated task through its `VTable`, this way every spawned future is treated
/// the same regardless of its concrete type and the processor is only monomorphized once.
///
/// Tasks are allocated inside an `Arc`, every `TaskRef` and every `Waker` owns one strong count.
#[doc(hidden)]
#[derive(Eq, PartialEq)]
pub struct TaskRef(NonNull<Header>);

#[repr(C)]
pub(crate) struct Task<F: Future, S> {
    /// This must be the first field of the `Task` struct!
    header: Header,
    scheduler: S,
    /// The future that the task is running, `None` once the task reached a terminal state.
    ///
    /// While `COMPLETE` is zero the `POLLING` bit functions as a lock for this field, it can only
    /// be accessed by the thread that set `POLLING`. Once `COMPLETE` is set, whoever performed
    /// that transition gets to drop the future.
    stage: UnsafeCell<Option<F>>,
    output: Output<F::Output>,
}

#[doc(hidden)]
pub struct Header {
    /// The task's state.
    ///
    /// This field is accessed with atomic instructions, so it's always safe to access it.
    state: State,
    /// The task vtable for this task.
    vtable: &'static VTable,
    /// The task's ID.
    id: Id,
    /// Why cancellation was requested, `0` while it was not.
    cancel_reason: AtomicU8,
    /// Number of live [`CancellationBlocker`]s created by this task.
    blockers: AtomicU32,
    /// The deadline the task was spawned with.
    deadline: Deadline,
    /// Task-local values. Only ever accessed by the thread currently polling the task, or by
    /// whoever drops the task's future.
    storage: UnsafeCell<Storage>,
    /// The tracing span associated with this task, for debugging purposes.
    span: tracing::Span,
}

struct VTable {
    /// Poll the future, returning a [`PollResult`] that indicates what the
    /// worker should do with the polled task.
    poll: unsafe fn(NonNull<Header>) -> PollResult,
    /// Forcibly complete the task, dropping its future without polling it again.
    shutdown: unsafe fn(NonNull<Header>),
    /// Hand the task to its scheduler, consuming one reference.
    schedule: unsafe fn(TaskRef),
    clone_ref: unsafe fn(NonNull<Header>),
    drop_ref: unsafe fn(NonNull<Header>),
}

// `Waker::will_wake` compares the data pointer *and* the vtable pointer, a single static keeps
// every waker of a task identical.
static WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(clone_waker, wake_by_val, wake_by_ref, drop_waker);

// === impl TaskRef ===

impl TaskRef {
    /// Returns the tasks unique identifier.
    pub(crate) fn id(&self) -> Id {
        self.header().id
    }

    pub(crate) fn task_state(&self) -> TaskState {
        self.header().state.task_state()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.header()
            .state
            .load(Ordering::Acquire)
            .get(state::Snapshot::COMPLETE)
    }

    /// Requests cancellation of the task and wakes it so it can observe the request.
    pub(crate) fn cancel(&self, reason: CancellationReason) -> bool {
        let cancelled = self.header().request_cancel(reason);

        // if the task was successfully cancelled, wake it so that it can clean
        // up after itself.
        if cancelled {
            tracing::trace!(task.id = %self.id(), ?reason, "woke cancelled task");
            self.wake_by_ref();
        }

        cancelled
    }

    /// Mark the task as scheduled and report whether the caller has to enqueue it.
    ///
    /// Used for the very first schedule of a freshly spawned task.
    pub(crate) fn mark_scheduled(&self) -> bool {
        self.header().state.wake() == WakeAction::Enqueue
    }

    pub(crate) fn wake_by_ref(&self) {
        if self.header().state.wake() == WakeAction::Enqueue {
            let schedule = self.header().vtable.schedule;
            // Safety: called through our vtable, the clone hands an owned reference to the scheduler
            unsafe { schedule(self.clone()) }
        }
    }

    pub(crate) fn poll(&self) -> PollResult {
        let poll_fn = self.header().vtable.poll;
        // Safety: Called through our Vtable so this access should be fine
        unsafe { poll_fn(self.0) }
    }

    /// Forcibly complete the task without polling it again, dropping its future.
    ///
    /// The task must not be polled concurrently, callers make sure every worker has stopped.
    pub(crate) fn shutdown(&self) {
        let shutdown_fn = self.header().vtable.shutdown;
        // Safety: Called through our Vtable so this access should be fine
        unsafe { shutdown_fn(self.0) }
    }

    /// Consume the reference and return the raw header pointer.
    pub(crate) fn into_raw(self) -> NonNull<Header> {
        let ptr = self.0;
        // the pointer carries the reference count from here on.
        mem::forget(self);
        ptr
    }

    /// # Safety
    ///
    /// `ptr` must originate from [`TaskRef::into_raw`] and the reference it carries must not be
    /// used anymore.
    pub(crate) unsafe fn from_raw(ptr: NonNull<Header>) -> Self {
        Self(ptr)
    }

    pub(crate) fn header(&self) -> &Header {
        // Safety: constructor ensures the pointer is always valid
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id())
            .field("addr", &self.0)
            .finish()
    }
}

impl fmt::Pointer for TaskRef {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.0, f)
    }
}

impl Clone for TaskRef {
    #[inline]
    fn clone(&self) -> Self {
        tracing::trace!(task.addr=?self.0, task.id=%self.id(), "TaskRef::clone");
        let clone_ref = self.header().vtable.clone_ref;
        // Safety: called through our vtable with a live task pointer
        unsafe { clone_ref(self.0) };
        Self(self.0)
    }
}

impl Drop for TaskRef {
    #[inline]
    fn drop(&mut self) {
        tracing::trace!(task.addr=?self.0, "TaskRef::drop");
        let drop_ref = self.header().vtable.drop_ref;
        // Safety: as long as we're constructed from a NonNull<Header> this is safe
        unsafe { drop_ref(self.0) }
    }
}

// Safety: The state protocol ensured synchronized access to the inner task
unsafe impl Send for TaskRef {}
// Safety: The state protocol ensured synchronized access to the inner task
unsafe impl Sync for TaskRef {}

// === impl Task ===

impl<F, S> Task<F, S>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    S: Schedule,
{
    const TASK_VTABLE: VTable = VTable {
        poll: Self::poll,
        shutdown: Self::shutdown,
        schedule: Self::schedule,
        clone_ref: Self::clone_ref,
        drop_ref: Self::drop_ref,
    };

    /// Allocate a new task, returning the reference the caller uses to schedule it and the
    /// handle that observes its completion.
    pub(crate) fn new(
        future: F,
        scheduler: S,
        id: Id,
        deadline: Deadline,
        storage: Storage,
        span: tracing::Span,
    ) -> (TaskRef, TaskHandle<F::Output>) {
        let output: Output<F::Output> = Arc::new(BlockingFutureState::new());

        let task = Arc::new(Self {
            header: Header {
                state: State::new(),
                vtable: &Self::TASK_VTABLE,
                id,
                cancel_reason: AtomicU8::new(0),
                blockers: AtomicU32::new(0),
                deadline,
                storage: UnsafeCell::new(storage),
                span,
            },
            scheduler,
            stage: UnsafeCell::new(Some(future)),
            output: output.clone(),
        });

        // Safety: `Arc::into_raw` never returns null and `Header` is the first field of the
        // `#[repr(C)]` task
        let task = TaskRef(unsafe { NonNull::new_unchecked(Arc::into_raw(task).cast_mut()) }.cast());
        let handle = TaskHandle::new(task.clone(), output);

        (task, handle)
    }

    /// Poll the future, returning a [`PollResult`] that indicates what the
    /// worker should do with the polled task.
    ///
    /// This is a type-erased function called through the task's [`VTable`].
    ///
    /// # Safety
    ///
    /// - `ptr` must point to the [`Header`] of a task of type `Self` (i.e. the
    ///   pointed header must have the same `F`, and `S` type parameters
    ///   as `Self`).
    unsafe fn poll(ptr: NonNull<Header>) -> PollResult {
        // Safety: ensured by caller
        let this = unsafe { ptr.cast::<Self>().as_ref() };

        tracing::trace!(
            task.addr=?ptr,
            task.output=type_name::<F::Output>(),
            task.id=%this.header.id,
            "Task::poll",
        );

        match this.header.state.start_poll() {
            // Successfully to transitioned to `POLLING` all is good!
            StartPollAction::Poll => {}
            // Something isn't right, we shouldn't poll the task right now...
            StartPollAction::DontPoll => {
                tracing::warn!(task.addr=?ptr, "failed to transition to polling");
                return PollResult::Ready;
            }
            StartPollAction::Cancelled => {
                tracing::trace!(task.addr=?ptr, "task cancelled before it ran");
                // Safety: the transition to `COMPLETE` handed us exclusive access to the stage
                unsafe { this.abort() };
                this.scheduler.release(this.header.id);
                return PollResult::Ready;
            }
        }

        // wrap the waker in `ManuallyDrop` because we're converting it from an
        // existing task ref, rather than incrementing the task ref count. if
        // this waker is consumed during the poll, we don't want to decrement
        // its ref count when the poll ends.
        // Safety: `raw_waker` produces a waker backed by our vtable
        let waker = ManuallyDrop::new(unsafe { Waker::from_raw(raw_waker(ptr)) });

        // actually poll the task
        let poll = {
            let mut cx = Context::from_waker(&waker);
            // Safety: we hold the `POLLING` bit, granting us exclusive access to the stage
            unsafe { this.poll_inner(&mut cx) }
        };

        match poll {
            Poll::Pending => this.header.state.end_poll(false),
            Poll::Ready(output) => {
                this.clear_storage();
                let result = this.header.state.end_poll(true);
                this.complete(output);
                this.scheduler.release(this.header.id);
                result
            }
        }
    }

    /// This is a type-erased function called through the task's [`VTable`].
    ///
    /// # Safety
    ///
    /// - `ptr` must point to the [`Header`] of a task of type `Self`.
    unsafe fn shutdown(ptr: NonNull<Header>) {
        // Safety: ensured by caller
        let this = unsafe { ptr.cast::<Self>().as_ref() };

        if this.header.state.shutdown() {
            tracing::trace!(task.addr=?ptr, task.id=%this.header.id, "Task::shutdown");
            // Safety: the transition to `COMPLETE` handed us exclusive access to the stage
            unsafe { this.abort() };
        }
    }

    /// # Safety
    ///
    /// - `this` must be a task of type `Self`, the passed reference is handed to the scheduler.
    unsafe fn schedule(this: TaskRef) {
        // Safety: ensured by caller
        let task = unsafe { this.0.cast::<Self>().as_ref() };
        task.scheduler.schedule(this);
    }

    unsafe fn clone_ref(ptr: NonNull<Header>) {
        // Safety: every `TaskRef` and `Waker` owns a strong count of the `Arc` the task lives in
        unsafe { Arc::increment_strong_count(ptr.cast::<Self>().as_ptr()) }
    }

    unsafe fn drop_ref(ptr: NonNull<Header>) {
        // Safety: every `TaskRef` and `Waker` owns a strong count of the `Arc` the task lives in
        unsafe { Arc::decrement_strong_count(ptr.cast::<Self>().as_ptr()) }
    }

    /// Polls the future. If the future completes (or panics), it is dropped before this method
    /// returns.
    ///
    /// # Safety
    ///
    /// The caller has to ensure this thread has exclusive mutable access to the tasks `stage` field.
    unsafe fn poll_inner(&self, cx: &mut Context<'_>) -> Poll<Result<F::Output, JoinError>> {
        struct Guard<'a, T> {
            stage: &'a mut Option<T>,
        }
        impl<T> Drop for Guard<'_, T> {
            fn drop(&mut self) {
                // If the future panics on poll, we drop it inside the panic
                // guard.
                *self.stage = None;
            }
        }

        let _span = self.header.span.enter();
        let _task = context::enter_task(NonNull::from(&self.header));
        let id = self.header.id;

        self.stage.with_mut(|stage| {
            // Safety: ensured by caller
            let stage = unsafe { &mut *stage };

            let poll = AssertUnwindSafe(|| -> Poll<F::Output> {
                let guard = Guard { stage };

                let Some(future) = guard.stage.as_mut() else {
                    unreachable!("polled a task without a future");
                };

                // Safety: The future lives inside the `Arc` allocation and never moves.
                let future = unsafe { Pin::new_unchecked(future) };
                let res = future.poll(cx);

                if res.is_pending() {
                    mem::forget(guard);
                }
                res
            });

            match panic::catch_unwind(poll) {
                Ok(Poll::Pending) => Poll::Pending,
                Ok(Poll::Ready(ready)) => Poll::Ready(Ok(ready)),
                Err(payload) => {
                    tracing::warn!(task.id = %id, "task panicked");
                    Poll::Ready(Err(JoinError::panic(id, payload)))
                }
            }
        })
    }

    /// Drop the future without running it to completion and report the task as cancelled.
    ///
    /// # Safety
    ///
    /// The caller must have performed the transition to `COMPLETE`.
    unsafe fn abort(&self) {
        {
            let _span = self.header.span.enter();
            let _task = context::enter_task(NonNull::from(&self.header));
            self.stage.with_mut(|stage| {
                // Safety: ensured by caller
                drop(unsafe { (*stage).take() });
            });
        }
        self.clear_storage();
        self.complete(Err(JoinError::cancelled(self.header.id)));
    }

    /// Drop the task-local values. Their destructors still run as part of the task.
    fn clear_storage(&self) {
        let _span = self.header.span.enter();
        let _task = context::enter_task(NonNull::from(&self.header));
        self.header.drop_storage();
    }

    fn complete(&self, output: Result<F::Output, JoinError>) {
        if self.output.set_value(output).is_err() {
            tracing::warn!(task.id = %self.header.id, "task output was already set");
        }
    }
}

impl<F: Future, S> Drop for Task<F, S> {
    fn drop(&mut self) {
        // the future is normally dropped when the task completes, but a task that never got the
        // chance to (its processor went away) still holds it.
        let future = self.stage.with_mut(|stage| {
            // Safety: we have exclusive access in `drop`
            unsafe { (*stage).take() }
        });

        // nothing may take a new reference to the task from here on
        let _task = context::enter_dying_task(NonNull::from(&self.header));
        if let Some(future) = future {
            drop(future);
            let _ = self.output.set_value(Err(JoinError::cancelled(self.header.id)));
        }
        self.header.drop_storage();
    }
}

// === impl Header ===

impl Header {
    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.state
            .load(Ordering::Acquire)
            .get(state::Snapshot::CANCELLED)
    }

    pub(crate) fn cancellation_reason(&self) -> Option<CancellationReason> {
        CancellationReason::from_u8(self.cancel_reason.load(Ordering::Acquire))
    }

    /// Record a cancellation request. The first reason wins.
    ///
    /// Returns `false` if cancellation was already requested or the task completed.
    pub(crate) fn request_cancel(&self, reason: CancellationReason) -> bool {
        // the reason must be visible before the CANCELLED bit is
        let _ = self.cancel_reason.compare_exchange(
            0,
            reason.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.state.cancel()
    }

    /// Whether a suspension point in this task should bail out because of cancellation.
    ///
    /// Reaching the task's deadline counts as a cancellation request with reason
    /// [`CancellationReason::Deadline`].
    pub(crate) fn should_cancel(&self) -> bool {
        if self.blockers.load(Ordering::Acquire) > 0 {
            return false;
        }

        if self.is_cancel_requested() {
            return true;
        }

        if self.deadline.is_reached() {
            tracing::trace!(task.id = %self.id, "task deadline reached");
            self.request_cancel(CancellationReason::Deadline);
            return true;
        }

        false
    }

    pub(crate) fn is_cancellation_blocked(&self) -> bool {
        self.blockers.load(Ordering::Acquire) > 0
    }

    pub(crate) fn add_blocker(&self) {
        self.blockers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_blocker(&self) {
        let prev = self.blockers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "cancellation blocker count underflow");
    }

    /// Drop the task-local values in reverse registration order.
    ///
    /// Only called by the thread that transitions the task out of polling, or from `Drop`.
    fn drop_storage(&self) {
        loop {
            let slot = self.storage.with_mut(|storage| {
                // Safety: see above, nobody else touches the storage at this point
                unsafe { (*storage).pop_last() }
            });
            // dropped outside the borrow, the destructor may access task-locals
            match slot {
                Some(slot) => drop(slot),
                None => break,
            }
        }
    }

    /// # Safety
    ///
    /// The caller must be the thread currently polling this task.
    pub(crate) unsafe fn with_storage<R>(&self, f: impl FnOnce(&mut Storage) -> R) -> R {
        // Safety: ensured by caller
        self.storage.with_mut(|storage| f(unsafe { &mut *storage }))
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("state", &self.state)
            .field("id", &self.id)
            .field("cancel_reason", &self.cancellation_reason())
            .field("blockers", &self.blockers)
            .field("deadline", &self.deadline)
            .field("span", &self.span)
            .finish_non_exhaustive()
    }
}

// === Waker vtable methods ===

// `Waker::will_wake` is used all over the place to optimize waker code (e.g. only update wakers
// if they have a different wake target). The `inline(never)` keeps the data pointer and vtable
// identical for every waker created from the same task.
#[inline(never)]
fn raw_waker(ptr: NonNull<Header>) -> RawWaker {
    RawWaker::new(ptr.as_ptr().cast_const().cast::<()>(), &WAKER_VTABLE)
}

unsafe fn clone_waker(ptr: *const ()) -> RawWaker {
    // Safety: called through RawWakerVtable
    unsafe {
        let ptr = NonNull::new_unchecked(ptr.cast::<Header>().cast_mut());
        tracing::trace!(
            target: "scheduler:waker",
            {
                task.addr = ?ptr,
                task.id = ptr.as_ref().id.as_u64()
            },
            "Task::clone_waker"
        );

        (ptr.as_ref().vtable.clone_ref)(ptr);
        raw_waker(ptr)
    }
}

unsafe fn wake_by_val(ptr: *const ()) {
    // Safety: called through RawWakerVtable
    unsafe {
        let ptr = NonNull::new_unchecked(ptr.cast::<Header>().cast_mut());
        tracing::trace!(
            target: "scheduler:waker",
            {
                task.addr = ?ptr,
                task.id = ptr.as_ref().id.as_u64()
            },
            "Task::wake_by_val"
        );

        // the waker's own reference is handed to the scheduler when the task gets enqueued,
        // otherwise it is dropped.
        let this = TaskRef(ptr);
        if this.header().state.wake() == WakeAction::Enqueue {
            (this.header().vtable.schedule)(this);
        }
    }
}

unsafe fn wake_by_ref(ptr: *const ()) {
    // Safety: called through RawWakerVtable
    unsafe {
        let ptr = NonNull::new_unchecked(ptr.cast::<Header>().cast_mut());
        tracing::trace!(
            target: "scheduler:waker",
            {
                task.addr = ?ptr,
                task.id = ptr.as_ref().id.as_u64()
            },
            "Task::wake_by_ref"
        );

        let this = ManuallyDrop::new(TaskRef(ptr));
        this.wake_by_ref();
    }
}

unsafe fn drop_waker(ptr: *const ()) {
    // Safety: called through RawWakerVtable
    unsafe {
        let ptr = NonNull::new_unchecked(ptr.cast::<Header>().cast_mut());
        tracing::trace!(
            target: "scheduler:waker",
            {
                task.addr = ?ptr,
            },
            "Task::drop_waker"
        );

        (ptr.as_ref().vtable.drop_ref)(ptr);
    }
}
