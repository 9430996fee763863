// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::VecDeque;
use std::sync::PoisonError;

use crate::config::TaskProcessorConfig;
use crate::loom::sync::{Condvar, Mutex};
use crate::processor::{QueueStrategy, sealed};
use crate::task::TaskRef;

/// A single FIFO queue shared by all workers, idle workers block on a condition variable.
///
/// Simpler than [`WorkStealing`](crate::processor::WorkStealing) and strictly first-in
/// first-out, at the price of contention on one lock.
#[derive(Debug)]
pub struct GlobalQueue {
    state: Mutex<State>,
    available: Condvar,
}

#[derive(Debug)]
struct State {
    queue: VecDeque<TaskRef>,
    stopped: bool,
}

impl sealed::Sealed for GlobalQueue {}

impl QueueStrategy for GlobalQueue {
    type Worker = ();

    fn new(_config: &TaskProcessorConfig) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                stopped: false,
            }),
            available: Condvar::new(),
        }
    }

    fn worker(&self, _index: usize) -> Self::Worker {}

    unsafe fn push(&self, task: TaskRef, _worker: Option<usize>) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .push_back(task);
        self.available.notify_one();
    }

    fn pop(&self, _worker: &mut Self::Worker) -> Option<TaskRef> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.stopped {
                return None;
            }
            if let Some(task) = state.queue.pop_front() {
                return Some(task);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn stop(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stopped = true;
        self.available.notify_all();
    }

    fn drain(&self) -> Vec<TaskRef> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .drain(..)
            .collect()
    }
}
