// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-thread event loop: a `poll(2)` readiness loop with an ordered timer map, woken through a
//! self-pipe whenever work is posted from another thread.

use core::cell::Cell;
use core::mem;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crate::error::Closed;
use crate::util::SpinMutex;

/// Work posted into an event loop, run on the loop's thread.
pub(crate) type Job = Box<dyn FnOnce(&mut EvLoop) + Send>;

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-wide unique key for timers and watcher owners.
pub(crate) fn next_key() -> u64 {
    NEXT_KEY.fetch_add(1, Ordering::Relaxed)
}

std::thread_local! {
    static CURRENT_LOOP: Cell<*const Shared> = const { Cell::new(core::ptr::null()) };
}

/// The part of an event loop other threads talk to.
pub(crate) struct Shared {
    jobs: SpinMutex<Vec<Job>>,
    /// Set while a wakeup byte is in flight, so bursts of posts write the pipe once.
    notified: AtomicBool,
    stopped: AtomicBool,
    wake_write: OwnedFd,
}

/// Loop-thread-only state.
pub(crate) struct EvLoop {
    wake_read: OwnedFd,
    /// Pending timers ordered by deadline, the key breaks ties.
    timers: BTreeMap<(Instant, u64), Box<dyn FnOnce() + Send>>,
    /// Deadline of every pending timer, so it can be cancelled by key alone.
    timer_deadlines: HashMap<u64, Instant>,
    watchers: Vec<Watcher>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Interest {
    Read,
    Write,
}

/// What a one-shot watcher observed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Readiness {
    Read,
    Write,
    Error,
}

struct Watcher {
    owner: u64,
    fd: RawFd,
    interest: Interest,
    callback: Box<dyn FnOnce(Readiness) + Send>,
}

/// Creates the two halves of a new event loop.
pub(crate) fn new() -> io::Result<(Arc<Shared>, EvLoop)> {
    let mut fds = [0; 2];
    // Safety: `fds` is a valid array of two file descriptors
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    // Safety: `pipe2` succeeded, so both descriptors are open and owned by nobody else
    let (wake_read, wake_write) =
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    let shared = Arc::new(Shared {
        jobs: SpinMutex::new(Vec::new()),
        notified: AtomicBool::new(false),
        stopped: AtomicBool::new(false),
        wake_write,
    });

    let ev = EvLoop {
        wake_read,
        timers: BTreeMap::new(),
        timer_deadlines: HashMap::new(),
        watchers: Vec::new(),
    };

    Ok((shared, ev))
}

// === impl Shared ===

impl Shared {
    /// Queue `job` to run on the loop thread.
    pub(crate) fn post(&self, job: Job) -> Result<(), Closed> {
        {
            let mut jobs = self.jobs.lock();
            // checked under the lock, the loop drains the queue one last time after stopping
            if self.stopped.load(Ordering::Acquire) {
                return Err(Closed::new());
            }
            jobs.push(job);
        }

        if !self.is_current() && !self.notified.swap(true, Ordering::AcqRel) {
            self.wake();
        }
        Ok(())
    }

    /// Returns `true` if called from this loop's thread.
    pub(crate) fn is_current(&self) -> bool {
        CURRENT_LOOP.with(|current| core::ptr::eq(current.get(), self))
    }

    /// Ask the loop to exit once it drained the queued jobs.
    pub(crate) fn stop(&self) {
        {
            let _jobs = self.jobs.lock();
            self.stopped.store(true, Ordering::Release);
        }
        self.wake();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn wake(&self) {
        let byte = 1_u8;
        // Safety: writing one byte from a valid buffer into a descriptor we own. A full pipe
        // (EAGAIN) already guarantees a pending wakeup, so the result is ignored.
        unsafe {
            libc::write(
                self.wake_write.as_raw_fd(),
                (&raw const byte).cast::<libc::c_void>(),
                1,
            );
        }
    }
}

// === impl EvLoop ===

impl EvLoop {
    /// Run the loop on the current thread until [`Shared::stop`] is called.
    pub(crate) fn run(mut self, shared: &Arc<Shared>) {
        let prev = CURRENT_LOOP.with(|current| current.replace(Arc::as_ptr(shared)));
        tracing::debug!("event loop started");

        loop {
            self.run_jobs(shared);
            if shared.is_stopped() {
                // pick up everything posted before `stop` flipped the flag
                self.run_jobs(shared);
                break;
            }

            self.fire_timers();

            if let Err(err) = self.poll_once(shared) {
                tracing::error!(%err, "event loop poll failed");
            }
        }

        // drop callbacks (and the wakers they hold) on the loop thread
        self.timers.clear();
        self.timer_deadlines.clear();
        self.watchers.clear();
        CURRENT_LOOP.with(|current| current.set(prev));
        tracing::debug!("event loop stopped");
    }

    pub(crate) fn add_timer(&mut self, key: u64, deadline: Instant, callback: Box<dyn FnOnce() + Send>) {
        self.cancel_timer(key);
        self.timers.insert((deadline, key), callback);
        self.timer_deadlines.insert(key, deadline);
    }

    pub(crate) fn cancel_timer(&mut self, key: u64) {
        if let Some(deadline) = self.timer_deadlines.remove(&key) {
            self.timers.remove(&(deadline, key));
        }
    }

    /// Number of timers that are armed and not yet fired.
    #[cfg(test)]
    pub(crate) fn pending_timers(&self) -> usize {
        debug_assert_eq!(self.timers.len(), self.timer_deadlines.len());
        self.timers.len()
    }

    pub(crate) fn add_watcher(
        &mut self,
        owner: u64,
        fd: RawFd,
        interest: Interest,
        callback: Box<dyn FnOnce(Readiness) + Send>,
    ) {
        // watchers are one-shot, a second registration replaces the first
        self.watchers
            .retain(|w| !(w.owner == owner && w.fd == fd && w.interest == interest));
        self.watchers.push(Watcher {
            owner,
            fd,
            interest,
            callback,
        });
    }

    /// Removes the watchers of `owner`, either all of them or only those on `fd`.
    pub(crate) fn remove_watchers(&mut self, owner: u64, fd: Option<RawFd>) {
        self.watchers
            .retain(|w| w.owner != owner || fd.is_some_and(|fd| fd != w.fd));
    }

    fn run_jobs(&mut self, shared: &Shared) {
        shared.notified.store(false, Ordering::Release);
        let jobs = mem::take(&mut *shared.jobs.lock());
        for job in jobs {
            guarded("job", || job(self));
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.timers.first_entry() {
            let (deadline, key) = *entry.key();
            if deadline > now {
                break;
            }
            let callback = entry.remove();
            self.timer_deadlines.remove(&key);
            tracing::trace!(key, "timer fired");
            guarded("timer callback", callback);
        }
    }

    /// Milliseconds until the next timer, rounded up. `-1` waits indefinitely.
    fn poll_timeout(&self) -> libc::c_int {
        match self.timers.keys().next() {
            None => -1,
            Some((deadline, _)) => {
                let left = deadline.saturating_duration_since(Instant::now());
                let millis = left.as_micros().div_ceil(1000);
                libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
            }
        }
    }

    fn poll_once(&mut self, shared: &Shared) -> io::Result<()> {
        let timeout = if shared.jobs.lock().is_empty() {
            self.poll_timeout()
        } else {
            0
        };

        let mut fds = Vec::with_capacity(self.watchers.len() + 1);
        fds.push(libc::pollfd {
            fd: self.wake_read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        fds.extend(self.watchers.iter().map(|w| libc::pollfd {
            fd: w.fd,
            events: match w.interest {
                Interest::Read => libc::POLLIN,
                Interest::Write => libc::POLLOUT,
            },
            revents: 0,
        }));

        let nfds = libc::nfds_t::try_from(fds.len()).unwrap_or(libc::nfds_t::MAX);
        // Safety: `fds` is a valid, initialized buffer of `nfds` entries
        let n = unsafe { libc::poll(fds.as_mut_ptr(), nfds, timeout) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        if fds[0].revents != 0 {
            self.drain_wake_pipe();
        }

        // collect ready watchers first, their callbacks may register new ones
        let mut ready = Vec::new();
        let mut idx = 0;
        let mut slot = 1;
        while idx < self.watchers.len() {
            let revents = fds[slot].revents;
            slot += 1;
            if revents == 0 {
                idx += 1;
                continue;
            }
            let watcher = self.watchers.remove(idx);
            ready.push((classify(watcher.interest, revents), watcher.callback));
        }

        for (readiness, callback) in ready {
            guarded("watcher callback", move || callback(readiness));
        }

        Ok(())
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0_u8; 64];
        loop {
            // Safety: reading into a valid buffer from a non-blocking descriptor we own
            let n = unsafe {
                libc::read(
                    self.wake_read.as_raw_fd(),
                    buf.as_mut_ptr().cast::<libc::c_void>(),
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

/// Maps `revents` of a watcher. A hang-up on a read watcher is reported as readable, reading
/// will observe the end of the stream.
fn classify(interest: Interest, revents: libc::c_short) -> Readiness {
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        return Readiness::Error;
    }
    match interest {
        Interest::Read => Readiness::Read,
        Interest::Write if revents & libc::POLLHUP != 0 && revents & libc::POLLOUT == 0 => {
            Readiness::Error
        }
        Interest::Write => Readiness::Write,
    }
}

/// Runs `f`, catching and logging a panic so it can't take down the loop.
fn guarded(what: &'static str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let msg = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string panic payload>");
        tracing::error!(what, panic = msg, "panic in event loop");
    }
}
