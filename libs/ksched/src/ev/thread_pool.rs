// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crate::config::EventThreadPoolConfig;
use crate::ev::{ThreadControl, reactor};

lazy_static::lazy_static! {
    static ref DEFAULT_POOL: EventThreadPool = match EventThreadPool::new(&EventThreadPoolConfig::default()) {
        Ok(pool) => pool,
        Err(err) => panic!("failed to start the default event thread pool: {err}"),
    };
}

/// A fixed set of event loop threads.
///
/// Every thread runs its own loop. Work is spread over them by handing out their
/// [`ThreadControl`]s round-robin. Dropping the pool stops and joins all threads.
pub struct EventThreadPool {
    controls: Vec<ThreadControl>,
    next: AtomicUsize,
    threads: Vec<thread::JoinHandle<()>>,
}

impl EventThreadPool {
    /// Start a pool with `config.threads` event loop threads (at least one), named
    /// `{config.name}-ev-{i}`.
    ///
    /// # Errors
    ///
    /// Returns an error if a wakeup pipe could not be created or a thread could not be spawned.
    pub fn new(config: &EventThreadPoolConfig) -> io::Result<Self> {
        let threads = config.threads.max(1);
        let mut pool = Self {
            controls: Vec::with_capacity(threads),
            next: AtomicUsize::new(0),
            threads: Vec::with_capacity(threads),
        };

        for i in 0..threads {
            let (shared, ev) = reactor::new()?;
            let control = ThreadControl::new(shared.clone());

            // on error `pool` is dropped, stopping the threads started so far
            let handle = thread::Builder::new()
                .name(format!("{}-ev-{i}", config.name))
                .spawn(move || ev.run(&shared))?;

            pool.controls.push(control);
            pool.threads.push(handle);
        }

        tracing::debug!(name = %config.name, threads, "event thread pool started");
        Ok(pool)
    }

    /// The process-wide pool, started with [`EventThreadPoolConfig::default`] on first use.
    ///
    /// Deadlines of suspended tasks are armed on this pool.
    ///
    /// # Panics
    ///
    /// Panics if the pool could not be started.
    pub fn default_pool() -> &'static Self {
        &DEFAULT_POOL
    }

    /// Pick the next event loop, round-robin.
    pub fn next_thread(&self) -> &ThreadControl {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.controls.len();
        &self.controls[idx]
    }

    pub fn thread_count(&self) -> usize {
        self.controls.len()
    }
}

impl Drop for EventThreadPool {
    fn drop(&mut self) {
        for control in &self.controls {
            control.stop();
        }
        for handle in self.threads.drain(..) {
            if handle.thread().id() == thread::current().id() {
                // dropped from one of our own loops, it exits once the current job returned
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("event loop thread panicked");
            }
        }
    }
}

impl fmt::Debug for EventThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventThreadPool")
            .field("controls", &self.controls)
            .field("next", &self.next.load(Ordering::Relaxed))
            .field("threads", &self.threads.len())
            .finish()
    }
}
