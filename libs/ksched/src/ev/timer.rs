// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::deadline::Deadline;
use crate::ev::ThreadControl;
use crate::ev::reactor::next_key;
use crate::util::SpinMutex;

/// A one-shot timer running its callback on an event loop thread.
///
/// The timer is bound to one [`ThreadControl`] for its whole life, (re)arming and stopping it
/// posts closures to that loop. After [`stop`](Timer::stop) returned the callback is
/// guaranteed not to run anymore, no matter which thread called it. Dropping the timer stops
/// it.
///
/// A timer with an unreachable deadline is armed but never fires.
pub struct Timer {
    control: ThreadControl,
    state: Arc<TimerState>,
    /// Key of the armed loop entry.
    armed: Option<u64>,
}

struct TimerState {
    /// Bumped by every stop, callbacks of older generations are discarded.
    generation: AtomicU64,
    /// Held by the loop while a callback runs.
    firing: SpinMutex<()>,
}

impl Timer {
    /// Arm a new timer on `control` that calls `callback` once `deadline` is reached.
    pub fn start<F>(control: &ThreadControl, callback: F, deadline: Deadline) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut timer = Self {
            control: control.clone(),
            state: Arc::new(TimerState {
                generation: AtomicU64::new(0),
                firing: SpinMutex::new(()),
            }),
            armed: None,
        };
        timer.arm(callback, deadline);
        timer
    }

    /// Stop the timer and arm it again with a new callback and deadline.
    pub fn restart<F>(&mut self, callback: F, deadline: Deadline)
    where
        F: FnOnce() + Send + 'static,
    {
        self.stop();
        self.arm(callback, deadline);
    }

    /// Stop the timer. Once this returns the callback will not run (anymore).
    pub fn stop(&mut self) {
        let Some(key) = self.armed.take() else {
            return;
        };

        self.state.generation.fetch_add(1, Ordering::SeqCst);
        // wait out a callback that is running right now, unless we are that callback
        if !self.control.is_in_ev_loop() {
            drop(self.state.firing.lock());
        }

        // release the callback (and whatever it captured) promptly
        let _ = self.control.post(Box::new(move |ev| ev.cancel_timer(key)));
        tracing::trace!(key, "timer stopped");
    }

    /// Returns `true` while the timer is armed, i.e. between start and stop.
    pub fn is_valid(&self) -> bool {
        self.armed.is_some()
    }

    /// The event loop this timer is bound to.
    pub fn thread_control(&self) -> &ThreadControl {
        &self.control
    }

    fn arm<F>(&mut self, callback: F, deadline: Deadline)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(at) = deadline.as_instant() else {
            // never fires, nothing to register
            self.armed = Some(next_key());
            return;
        };

        let key = next_key();
        let generation = self.state.generation.load(Ordering::SeqCst);
        let state = self.state.clone();

        let fire = move || {
            let _firing = state.firing.lock();
            if state.generation.load(Ordering::SeqCst) == generation {
                callback();
            }
        };

        match self
            .control
            .post(Box::new(move |ev| ev.add_timer(key, at.max(Instant::now()), Box::new(fire))))
        {
            Ok(()) => {
                tracing::trace!(key, ?deadline, "timer armed");
                self.armed = Some(key);
            }
            Err(_) => tracing::warn!("failed to arm timer, the event loop was stopped"),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("control", &self.control)
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}
