// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::deadline::Deadline;
use crate::error::{Closed, WaitError};
use crate::ev::reactor::{EvLoop, Interest, Readiness, next_key};
use crate::ev::{EventThreadPool, ThreadControl};
use crate::sync::WaitListLight;
use crate::task::Suspend;
use crate::util::SpinMutex;

/// What a [`Poller`] observed on a file descriptor.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EventKind {
    /// The descriptor is readable. A hang-up of the peer is reported as `Read` too, the next
    /// read will return end-of-file.
    Read,
    /// The descriptor is writable.
    Write,
    /// The descriptor is in an error state (or was closed while being watched).
    Error,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Event {
    pub fd: RawFd,
    pub kind: EventKind,
}

/// Readiness notifications for a set of file descriptors, consumed by a single task.
///
/// Watchers are *one-shot*: after an event was reported for a descriptor/direction it has to be
/// added again to receive the next one. The poller does not own the descriptors it watches,
/// callers must [`remove`](Self::remove) a descriptor before closing it.
pub struct Poller {
    control: ThreadControl,
    /// Identifies this poller's watchers on the event loop.
    id: u64,
    shared: Arc<Shared>,
}

struct Shared {
    state: SpinMutex<State>,
    waiters: WaitListLight,
}

/// Queued events plus the generations that decide whether a firing watcher still counts.
///
/// A watcher remembers the generation of its descriptor (and the poller-wide epoch) it was added
/// under. Removing bumps them, so a watcher that fires after its removal is ignored without
/// waiting for the loop to drop it.
#[derive(Default)]
struct State {
    events: VecDeque<Event>,
    epoch: u64,
    generations: HashMap<RawFd, u64>,
}

#[derive(Copy, Clone)]
struct Ticket {
    epoch: u64,
    generation: u64,
}

// === impl Poller ===

impl Poller {
    /// A poller bound to the next thread of the [default pool](EventThreadPool::default_pool).
    ///
    /// # Panics
    ///
    /// Panics if the default event thread pool could not be started.
    #[must_use]
    pub fn new() -> Self {
        Self::with_thread_control(EventThreadPool::default_pool().next_thread().clone())
    }

    #[must_use]
    pub fn with_thread_control(control: ThreadControl) -> Self {
        Self {
            control,
            id: next_key(),
            shared: Arc::new(Shared {
                state: SpinMutex::new(State::default()),
                waiters: WaitListLight::new(),
            }),
        }
    }

    /// Watch `fd` for readability, once.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the event loop was stopped.
    pub fn add_read(&self, fd: RawFd) -> Result<(), Closed> {
        self.add(fd, Interest::Read)
    }

    /// Watch `fd` for writability, once.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the event loop was stopped.
    pub fn add_write(&self, fd: RawFd) -> Result<(), Closed> {
        self.add(fd, Interest::Write)
    }

    /// Stop watching `fd` and discard its queued events.
    ///
    /// Once this returned no event for `fd` is reported anymore (until it is added again). This
    /// never waits for the event loop, it is fine to call from a task.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the event loop was stopped.
    pub fn remove(&self, fd: RawFd) -> Result<(), Closed> {
        self.remove_watchers(Some(fd))
    }

    /// Stop watching every descriptor and discard all queued events.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the event loop was stopped.
    pub fn reset(&self) -> Result<(), Closed> {
        self.remove_watchers(None)
    }

    /// Wait for the next event, giving up at `deadline` or when the task is asked to cancel.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::Timeout`] or [`WaitError::Cancelled`] if no event arrived in
    /// time. An event that is already queued is returned even if the deadline passed.
    ///
    /// # Panics
    ///
    /// A poller is consumed by one task at a time, waiting from two tasks at once panics.
    pub async fn next_event(&mut self, deadline: Deadline) -> Result<Event, WaitError> {
        loop {
            if let Some(event) = self.next_event_noblock() {
                return Ok(event);
            }

            let source = Suspend::new(
                self.shared.waiters.wait(),
                || !self.shared.state.lock().events.is_empty(),
                deadline,
            )
            .await;

            if let Some(err) = WaitError::from_wakeup(source) {
                return self.next_event_noblock().ok_or(err);
            }
        }
    }

    /// Returns the next queued event without suspending.
    pub fn next_event_noblock(&mut self) -> Option<Event> {
        self.shared.state.lock().events.pop_front()
    }

    /// The event loop this poller's watchers live on.
    pub fn thread_control(&self) -> &ThreadControl {
        &self.control
    }

    fn remove_watchers(&self, fd: Option<RawFd>) -> Result<(), Closed> {
        // invalidate first, watchers firing from here on are ignored
        self.shared.invalidate(fd);

        // the loop drops the callbacks (and their `shared` references) later on
        let id = self.id;
        self.control
            .post(Box::new(move |ev: &mut EvLoop| ev.remove_watchers(id, fd)))
    }

    fn add(&self, fd: RawFd, interest: Interest) -> Result<(), Closed> {
        let id = self.id;
        let shared = self.shared.clone();
        let ticket = self.shared.ticket(fd);
        tracing::trace!(id, fd, ?interest, "Poller::add");

        self.control.post(Box::new(move |ev| {
            ev.add_watcher(
                id,
                fd,
                interest,
                Box::new(move |readiness| {
                    let kind = match readiness {
                        Readiness::Read => EventKind::Read,
                        Readiness::Write => EventKind::Write,
                        Readiness::Error => EventKind::Error,
                    };
                    if shared.push(ticket, Event { fd, kind }) {
                        shared.waiters.wakeup_one();
                    }
                }),
            );
        }))
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // watcher callbacks hold on to `shared`, release them
        let id = self.id;
        let _ = self
            .control
            .post(Box::new(move |ev| ev.remove_watchers(id, None)));
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("control", &self.control)
            .field("id", &self.id)
            .field("queued", &self.shared.state.lock().events.len())
            .finish()
    }
}

impl Shared {
    fn ticket(&self, fd: RawFd) -> Ticket {
        let state = self.state.lock();
        Ticket {
            epoch: state.epoch,
            generation: state.generations.get(&fd).copied().unwrap_or(0),
        }
    }

    /// Queue `event` unless its watcher was removed in the meantime.
    fn push(&self, ticket: Ticket, event: Event) -> bool {
        let mut state = self.state.lock();
        let generation = state.generations.get(&event.fd).copied().unwrap_or(0);
        if ticket.epoch != state.epoch || ticket.generation != generation {
            tracing::trace!(fd = event.fd, "dropping event of a removed watcher");
            return false;
        }
        state.events.push_back(event);
        true
    }

    /// Invalidate the watchers and drop the queued events, either all of them or those of `fd`.
    fn invalidate(&self, fd: Option<RawFd>) {
        let mut state = self.state.lock();
        match fd {
            Some(fd) => {
                *state.generations.entry(fd).or_insert(0) += 1;
                state.events.retain(|event| event.fd != fd);
            }
            None => {
                // every old ticket carries an older epoch, the per-fd counters can start over
                state.epoch += 1;
                state.generations.clear();
                state.events.clear();
            }
        }
    }
}
