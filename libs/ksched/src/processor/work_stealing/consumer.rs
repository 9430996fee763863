// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use arrayvec::ArrayVec;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::processor::park::Parker;
use crate::processor::work_stealing::local_queue::LocalQueue;
use crate::processor::work_stealing::{CONSUMER_STEAL_BUFFER_SIZE, STEAL_ATTEMPTS, WorkStealing};
use crate::task::TaskRef;
use crate::util::Backoff;

/// The part of a worker other workers can see: its local run queue.
#[derive(Debug)]
pub(crate) struct Consumer {
    queue: LocalQueue<TaskRef>,
}

/// The thread-owned state of a work-stealing worker.
pub struct ConsumerState {
    index: usize,
    tick: u32,
    rng: SmallRng,
    parker: Parker,
    stolen: ArrayVec<TaskRef, CONSUMER_STEAL_BUFFER_SIZE>,
}

// === impl Consumer ===

impl Consumer {
    pub(crate) fn new() -> Self {
        Self {
            queue: LocalQueue::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Push a task to this consumer's local queue, handing it back if the queue is full.
    ///
    /// # Safety
    ///
    /// Must only be called from the thread of the worker owning this consumer.
    pub(crate) unsafe fn try_push(&self, task: TaskRef) -> Result<(), TaskRef> {
        // Safety: ensured by caller
        unsafe { self.queue.try_push(task) }
    }

    /// # Safety
    ///
    /// Must only be called from the thread of the worker owning this consumer, or once every
    /// worker stopped.
    pub(crate) unsafe fn try_pop(&self) -> Option<TaskRef> {
        // Safety: ensured by caller
        unsafe { self.queue.try_pop() }
    }
}

// === impl ConsumerState ===

impl ConsumerState {
    /// Must be called on the worker's thread.
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            tick: 0,
            rng: SmallRng::seed_from_u64(index as u64),
            parker: Parker::for_current(),
            stolen: ArrayVec::new(),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn parker(&self) -> &Parker {
        &self.parker
    }

    /// Local queue first, except every `global_queue_interval` ticks when the global queue
    /// goes first so spilled tasks can't starve.
    pub(crate) fn next_task(&mut self, strategy: &WorkStealing) -> Option<TaskRef> {
        self.tick = self.tick.wrapping_add(1);
        let consumer = &strategy.consumers[self.index];

        if self.tick % strategy.global_queue_interval == 0 {
            if let Some(task) = strategy.pop_global() {
                return Some(task);
            }
        }

        // Safety: we are the owning worker
        if let Some(task) = unsafe { consumer.try_pop() } {
            return Some(task);
        }

        strategy.pop_global()
    }

    /// Try to take work from other consumers, falling back to the global queue.
    pub(crate) fn steal(&mut self, strategy: &WorkStealing) -> Option<TaskRef> {
        let manager = &strategy.manager;
        if !manager.allow_stealing() {
            return None;
        }
        manager.start_stealing();

        let stolen = self.steal_from_consumers(strategy);
        tracing::trace!(consumer = self.index, stolen, "steal round finished");

        let task = if stolen > 0 {
            let mut stolen = self.stolen.drain(..);
            let first = stolen.next();
            let consumer = &strategy.consumers[self.index];
            for task in stolen {
                // Safety: we are the owning worker
                if let Err(task) = unsafe { consumer.try_push(task) } {
                    strategy.push_global(task);
                }
            }
            first
        } else {
            strategy.pop_global()
        };

        // the last stealer passes the baton so the remaining work keeps spreading
        if manager.stop_stealing() && task.is_some() {
            manager.notify_new_task();
        }

        task
    }

    fn steal_from_consumers(&mut self, strategy: &WorkStealing) -> usize {
        let num_consumers = strategy.consumers.len();
        if num_consumers <= 1 {
            return 0;
        }

        let mut backoff = Backoff::new();
        for _ in 0..STEAL_ATTEMPTS {
            // start from a random victim
            let start = self.rng.random_range(0..num_consumers);

            for i in 0..num_consumers {
                let victim = (start + i) % num_consumers;
                if victim == self.index {
                    continue;
                }

                let stolen = strategy.consumers[victim].queue.steal_into(&mut self.stolen);
                if stolen > 0 {
                    tracing::trace!(consumer = self.index, victim, stolen, "stole tasks");
                    return stolen;
                }
            }

            backoff.spin();
        }

        0
    }
}

impl fmt::Debug for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerState")
            .field("index", &self.index)
            .field("tick", &self.tick)
            .field("stolen", &self.stolen.len())
            .finish_non_exhaustive()
    }
}
