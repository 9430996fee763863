// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::any::Any;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::panic;

use crate::deadline::Deadline;
use crate::error::WaitError;
use crate::sync::FutureStatus;
use crate::task::{CancellationReason, Id, Output, TaskRef, TaskState};

/// An owned permission to observe and control a spawned task.
///
/// Dropping a `TaskHandle` *detaches* the task: it keeps running, but there is no longer a way
/// to observe its output.
pub struct TaskHandle<T> {
    task: TaskRef,
    output: Output<T>,
}

/// Future returned by [`TaskHandle::join`], resolving to the output of the task.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Join<T> {
    inner: Pin<Box<dyn Future<Output = Result<T, JoinError>> + Send>>,
}

/// The task did not run to completion.
pub struct JoinError {
    id: Id,
    kind: JoinErrorKind,
}

enum JoinErrorKind {
    Cancelled,
    Panic(Box<dyn Any + Send + 'static>),
}

// === impl TaskHandle ===

impl<T> TaskHandle<T> {
    pub(crate) fn new(task: TaskRef, output: Output<T>) -> Self {
        Self { task, output }
    }

    /// Returns the id of the task.
    pub fn id(&self) -> Id {
        self.task.id()
    }

    /// Returns `true` once the task reached a terminal state and its output is available.
    pub fn is_finished(&self) -> bool {
        self.output.is_ready()
    }

    pub fn state(&self) -> TaskState {
        self.task.task_state()
    }

    /// Requests cancellation of the task.
    ///
    /// Cancellation is cooperative: the task keeps running until its next suspension point,
    /// which then returns a cancellation result. A task that has not started yet is never polled.
    pub fn request_cancel(&self) {
        self.task.cancel(CancellationReason::User);
    }

    /// Waits for the task to finish.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Cancelled`] if the *calling* task was cancelled while waiting.
    pub async fn wait(&self) -> Result<(), WaitError> {
        self.wait_until(Deadline::unreachable()).await
    }

    /// Waits for the task to finish for at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Timeout`] if the task did not finish in time and
    /// [`WaitError::Cancelled`] if the calling task was cancelled while waiting.
    pub async fn wait_for(&self, timeout: Duration) -> Result<(), WaitError> {
        self.wait_until(Deadline::from_duration(timeout)).await
    }

    /// Waits for the task to finish until `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Timeout`] if the task did not finish in time and
    /// [`WaitError::Cancelled`] if the calling task was cancelled while waiting.
    pub async fn wait_until(&self, deadline: Deadline) -> Result<(), WaitError> {
        match self.output.wait_until(deadline).await {
            FutureStatus::Ready => Ok(()),
            FutureStatus::Timeout => Err(WaitError::Timeout),
            FutureStatus::Cancelled => Err(WaitError::Cancelled),
        }
    }

    /// Blocks the calling OS thread until the task finished.
    ///
    /// Must not be called from inside a task, it would block the worker thread.
    pub fn blocking_wait(&self) {
        self.output.blocking_wait();
    }

    /// Detach the task, letting it run to completion in the background.
    pub fn detach(self) {}

    fn take_output(&self) -> Result<T, JoinError> {
        match self.output.take() {
            Ok(output) => output,
            Err(err) => {
                // the handle is the only consumer of the output, so this is unreachable in
                // practice. Report it as a cancellation rather than losing the error.
                tracing::warn!(task.id = %self.id(), %err, "failed to retrieve task output");
                Err(JoinError::cancelled(self.id()))
            }
        }
    }

    /// Blocks the calling OS thread until the task finished and returns its output.
    ///
    /// # Errors
    ///
    /// Returns a [`JoinError`] if the task was cancelled or panicked.
    pub fn blocking_join(self) -> Result<T, JoinError> {
        self.output.blocking_wait();
        self.take_output()
    }

    /// Blocks the calling OS thread until the task finished and returns its output, resuming
    /// the task's panic on this thread if it panicked.
    ///
    /// # Errors
    ///
    /// Returns a [`JoinError`] if the task was cancelled.
    pub fn blocking_get(self) -> Result<T, JoinError> {
        resume_panic(self.blocking_join())
    }
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Waits for the task to finish and returns its output.
    ///
    /// Unlike [`TaskHandle::get`] the panic of a task is returned as an error.
    pub fn join(self) -> Join<T> {
        Join {
            inner: Box::pin(async move {
                self.output.wait().await;
                self.take_output()
            }),
        }
    }

    /// Waits for the task to finish and returns its output, resuming the task's panic in the
    /// caller if it panicked.
    ///
    /// The wait itself is not interrupted by cancellation of the calling task.
    ///
    /// # Errors
    ///
    /// Returns a [`JoinError`] if the task was cancelled.
    pub async fn get(self) -> Result<T, JoinError> {
        resume_panic(self.join().await)
    }
}

fn resume_panic<T>(res: Result<T, JoinError>) -> Result<T, JoinError> {
    match res {
        Ok(value) => Ok(value),
        Err(err) => match err.try_into_panic() {
            Ok(payload) => panic::resume_unwind(payload),
            Err(err) => Err(err),
        },
    }
}

impl<T: Send + 'static> IntoFuture for TaskHandle<T> {
    type Output = Result<T, JoinError>;
    type IntoFuture = Join<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.join()
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task", &self.task)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// === impl Join ===

impl<T> Future for Join<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for Join<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Join").finish_non_exhaustive()
    }
}

// === impl JoinError ===

impl JoinError {
    pub(crate) fn cancelled(id: Id) -> Self {
        Self {
            id,
            kind: JoinErrorKind::Cancelled,
        }
    }

    pub(crate) fn panic(id: Id, payload: Box<dyn Any + Send + 'static>) -> Self {
        Self {
            id,
            kind: JoinErrorKind::Panic(payload),
        }
    }

    /// Returns the id of the task that failed.
    pub fn id(&self) -> Id {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, JoinErrorKind::Cancelled)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self.kind, JoinErrorKind::Panic(_))
    }

    /// Consumes the error, returning the object with which the task panicked.
    ///
    /// # Panics
    ///
    /// Panics if the error does not represent a panicked task.
    #[track_caller]
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        self.try_into_panic()
            .expect("`JoinError` reason is not a panic.")
    }

    /// Consumes the error, returning the object with which the task panicked if the task
    /// terminated due to a panic. Otherwise, `self` is returned.
    ///
    /// # Errors
    ///
    /// Returns `self` if the task was cancelled.
    pub fn try_into_panic(self) -> Result<Box<dyn Any + Send + 'static>, JoinError> {
        match self.kind {
            JoinErrorKind::Panic(payload) => Ok(payload),
            JoinErrorKind::Cancelled => Err(self),
        }
    }
}

fn panic_payload_as_str(payload: &(dyn Any + Send)) -> Option<&str> {
    if let Some(s) = payload.downcast_ref::<String>() {
        return Some(s);
    }

    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return Some(s);
    }

    None
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            JoinErrorKind::Cancelled => write!(f, "task {} was cancelled", self.id),
            JoinErrorKind::Panic(payload) => match panic_payload_as_str(payload.as_ref()) {
                Some(msg) => write!(f, "task {} panicked with message {msg:?}", self.id),
                None => write!(f, "task {} panicked", self.id),
            },
        }
    }
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            JoinErrorKind::Cancelled => write!(f, "JoinError::Cancelled({:?})", self.id),
            JoinErrorKind::Panic(payload) => match panic_payload_as_str(payload.as_ref()) {
                Some(msg) => write!(f, "JoinError::Panic({:?}, {msg:?}, ...)", self.id),
                None => write!(f, "JoinError::Panic({:?}, ...)", self.id),
            },
        }
    }
}

impl core::error::Error for JoinError {}
