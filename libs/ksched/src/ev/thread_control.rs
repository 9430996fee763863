// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crate::error::Closed;
use crate::ev::reactor::{EvLoop, Job, Shared};
use crate::sync::{Future, FutureError, Promise};

/// A handle to one event loop thread.
///
/// All state owned by an event loop (timers, readiness watchers) is only ever touched from the
/// loop's own thread. Everybody else posts closures through this handle. Cloning is cheap.
#[derive(Clone)]
pub struct ThreadControl {
    shared: Arc<Shared>,
}

impl ThreadControl {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Run `f` on the event loop thread without waiting for it.
    ///
    /// A panic inside `f` is caught and logged by the loop.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the event loop was stopped.
    pub fn run_in_ev_loop_async<F>(&self, f: F) -> Result<(), Closed>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(Box::new(move |_| f()))
    }

    /// Run `f` on the event loop thread and wait for its result.
    ///
    /// Called from the loop thread itself, `f` runs inline. Otherwise the calling *thread*
    /// blocks until the loop ran `f`, so keep `f` short. Tasks should prefer
    /// [`run_in_ev_loop`](Self::run_in_ev_loop), which only suspends the task.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the event loop was stopped before it ran `f`.
    ///
    /// # Panics
    ///
    /// A panic inside `f` is resumed on the calling thread.
    pub fn run_in_ev_loop_sync<F, R>(&self, f: F) -> Result<R, Closed>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_in_ev_loop() {
            return Ok(f());
        }
        self.call(move |_| f())
    }

    /// Run `f` on the event loop thread and wait for its result without blocking the thread.
    ///
    /// The async counterpart of [`run_in_ev_loop_sync`](Self::run_in_ev_loop_sync) for tasks:
    /// only the calling task is suspended. The wait ignores cancellation, `f` has been handed to
    /// the loop already.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the event loop was stopped before it ran `f`.
    ///
    /// # Panics
    ///
    /// A panic inside `f` is resumed in the calling task.
    pub async fn run_in_ev_loop<F, R>(&self, f: F) -> Result<R, Closed>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_in_ev_loop() {
            return Ok(f());
        }
        let mut future = self.submit(move |_| f())?;
        finish(future.get().await)
    }

    /// Returns `true` if the calling thread is this event loop's thread.
    pub fn is_in_ev_loop(&self) -> bool {
        self.shared.is_current()
    }

    /// Run `f` with the loop state and block the calling thread until it returned.
    ///
    /// Must not be called from the loop thread itself, that would never finish.
    pub(crate) fn call<F, R>(&self, f: F) -> Result<R, Closed>
    where
        F: FnOnce(&mut EvLoop) -> R + Send + 'static,
        R: Send + 'static,
    {
        debug_assert!(!self.is_in_ev_loop());

        let mut future = self.submit(f)?;
        finish(future.blocking_get())
    }

    /// Post `f`, returning the future its result (or panic) is delivered through.
    fn submit<F, R>(&self, f: F) -> Result<Future<thread::Result<R>>, Closed>
    where
        F: FnOnce(&mut EvLoop) -> R + Send + 'static,
        R: Send + 'static,
    {
        let mut promise = Promise::new();
        let future = promise.get_future().map_err(|_| Closed::new())?;

        self.post(Box::new(move |ev| {
            let res = panic::catch_unwind(AssertUnwindSafe(|| f(ev)));
            // the future is still waiting on the other side, this can not fail
            let _ = promise.set_value(res);
        }))?;

        Ok(future)
    }

    pub(crate) fn post(&self, job: Job) -> Result<(), Closed> {
        self.shared.post(job)
    }

    pub(crate) fn stop(&self) {
        self.shared.stop();
    }
}

fn finish<R>(res: Result<thread::Result<R>, FutureError>) -> Result<R, Closed> {
    match res {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(payload)) => panic::resume_unwind(payload),
        // the job was dropped unrun because the loop stopped
        Err(FutureError::BrokenPromise) => Err(Closed::new()),
        Err(err) => {
            tracing::error!(%err, "unexpected result from event loop");
            Err(Closed::new())
        }
    }
}

impl fmt::Debug for ThreadControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadControl")
            .field("loop", &Arc::as_ptr(&self.shared))
            .field("stopped", &self.shared.is_stopped())
            .finish()
    }
}

impl PartialEq for ThreadControl {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for ThreadControl {}
