// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Blocking-style synchronization primitives that suspend the calling *task* instead of the
//! OS thread.

mod condvar;
mod event;
mod future;
mod mutex;
mod shared_mutex;
mod wait_list;
mod wait_list_light;
mod wake_batch;

pub use condvar::{ConditionVariable, CvStatus};
pub use event::{ResetPolicy, SingleConsumerEvent};
pub use future::{BlockingFutureState, Future, FutureError, FutureStatus, Promise};
pub use mutex::{Mutex, MutexGuard};
pub use shared_mutex::{SharedMutex, SharedMutexReadGuard, SharedMutexWriteGuard};
pub use wait_list::{WaitList, WaitListGuard};
pub use wait_list_light::{PollWaitError, WaitListLight};

/// A list of suspended tasks that can be woken.
///
/// This is the seam that makes [`Mutex`] generic over how it parks contending tasks:
/// [`WaitList`] supports any number of waiters, [`WaitListLight`] exactly one.
pub trait Waiters: Default + Send + Sync {
    /// Future returned by [`Waiters::wait`].
    type Wait<'a>: core::future::Future<Output = ()>
    where
        Self: 'a;

    /// Returns a future that registers the polling task as a waiter when first polled and
    /// completes once it was woken. Dropping the future unregisters the waiter.
    fn wait(&self) -> Self::Wait<'_>;

    /// Wake one registered waiter, if any.
    fn wakeup_one(&self);

    /// Wake all registered waiters.
    fn wakeup_all(&self);
}
