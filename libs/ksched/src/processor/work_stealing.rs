// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod consumer;
mod local_queue;
mod manager;

use core::fmt;
use std::collections::VecDeque;

use crate::config::TaskProcessorConfig;
use crate::loom::sync::atomic::{AtomicUsize, Ordering, fence};
use crate::processor::{QueueStrategy, sealed};
use crate::task::TaskRef;
use crate::util::{CachePadded, SpinMutex};
use consumer::Consumer;
pub use consumer::ConsumerState;
pub use local_queue::LOCAL_QUEUE_SIZE;
use manager::ConsumersManager;

/// Number of rounds over all other consumers an idle consumer makes before giving up on stealing.
pub const STEAL_ATTEMPTS: usize = 4;
/// Upper bound on the number of tasks taken from a victim in one steal.
pub const CONSUMER_STEAL_BUFFER_SIZE: usize = 32;

/// Every worker owns a bounded lock-free queue, idle workers steal from each other.
///
/// Tasks woken on a worker of the same processor go to that worker's local queue, everything
/// else (and local overflow) goes to a shared global queue.
pub struct WorkStealing {
    consumers: Box<[Consumer]>,
    global: CachePadded<SpinMutex<VecDeque<TaskRef>>>,
    /// Mirrors the length of `global` so emptiness checks don't need the lock.
    global_len: AtomicUsize,
    manager: ConsumersManager,
    global_queue_interval: u32,
}

impl WorkStealing {
    fn push_global(&self, task: TaskRef) {
        let mut global = self.global.lock();
        global.push_back(task);
        self.global_len.fetch_add(1, Ordering::SeqCst);
    }

    fn pop_global(&self) -> Option<TaskRef> {
        if self.global_len.load(Ordering::SeqCst) == 0 {
            return None;
        }

        let mut global = self.global.lock();
        let task = global.pop_front()?;
        self.global_len.fetch_sub(1, Ordering::SeqCst);
        Some(task)
    }

    fn has_work(&self) -> bool {
        self.global_len.load(Ordering::SeqCst) > 0
            || self.consumers.iter().any(|consumer| !consumer.is_empty())
    }
}

impl sealed::Sealed for WorkStealing {}

impl QueueStrategy for WorkStealing {
    type Worker = ConsumerState;

    fn new(config: &TaskProcessorConfig) -> Self {
        let workers = config.worker_threads.max(1);

        Self {
            consumers: (0..workers).map(|_| Consumer::new()).collect(),
            global: CachePadded(SpinMutex::new(VecDeque::new())),
            global_len: AtomicUsize::new(0),
            manager: ConsumersManager::new(workers),
            global_queue_interval: config.global_queue_interval.max(1),
        }
    }

    fn worker(&self, index: usize) -> Self::Worker {
        let state = ConsumerState::new(index);
        self.manager.register(index, state.parker().clone());
        state
    }

    unsafe fn push(&self, task: TaskRef, worker: Option<usize>) {
        let overflow = match worker {
            // Safety: ensured by caller
            Some(index) => unsafe { self.consumers[index].try_push(task) }.err(),
            None => Some(task),
        };

        if let Some(task) = overflow {
            self.push_global(task);
        }

        // the task must be visible before we look for sleepers, pairs with the fence in
        // `ConsumersManager::sleep`
        fence(Ordering::SeqCst);
        self.manager.notify_new_task();
    }

    fn pop(&self, worker: &mut Self::Worker) -> Option<TaskRef> {
        loop {
            if self.manager.is_stopped() {
                return None;
            }

            if let Some(task) = worker.next_task(self) {
                return Some(task);
            }

            if let Some(task) = worker.steal(self) {
                return Some(task);
            }

            self.manager
                .sleep(worker.index(), worker.parker(), || self.has_work());
        }
    }

    fn stop(&self) {
        self.manager.stop();
    }

    fn drain(&self) -> Vec<TaskRef> {
        let mut tasks: Vec<_> = {
            let mut global = self.global.lock();
            self.global_len.store(0, Ordering::SeqCst);
            global.drain(..).collect()
        };

        for consumer in &self.consumers {
            // Safety: `drain` is only called once every worker has been joined
            while let Some(task) = unsafe { consumer.try_pop() } {
                tasks.push(task);
            }
        }

        tasks
    }
}

impl fmt::Debug for WorkStealing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkStealing")
            .field("consumers", &self.consumers)
            .field("global_len", &self.global_len)
            .field("manager", &self.manager)
            .field("global_queue_interval", &self.global_queue_interval)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::task::tests::QueueScheduler;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    fn strategy(workers: usize) -> WorkStealing {
        WorkStealing::new(&TaskProcessorConfig::default().with_worker_threads(workers))
    }

    #[test]
    fn foreign_pushes_go_to_the_global_queue() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let scheduler = QueueScheduler::default();
        let strategy = strategy(2);

        let (task, _handle) = scheduler.spawn(async {});
        // Safety: no worker index is claimed
        unsafe { strategy.push(task, None) };

        assert!(strategy.has_work());
        assert_eq!(strategy.global_len.load(Ordering::SeqCst), 1);
        assert_eq!(strategy.drain().len(), 1);
        assert!(!strategy.has_work());
    }

    #[test]
    fn local_overflow_spills_to_global() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let scheduler = QueueScheduler::default();
        let strategy = strategy(1);

        for _ in 0..LOCAL_QUEUE_SIZE + 3 {
            let (task, _handle) = scheduler.spawn(async {});
            // Safety: this thread is the only one touching consumer 0
            unsafe { strategy.push(task, Some(0)) };
        }

        assert_eq!(strategy.global_len.load(Ordering::SeqCst), 3);
        assert_eq!(strategy.drain().len(), LOCAL_QUEUE_SIZE + 3);
    }

    #[test]
    fn worker_pops_local_then_global_then_steals() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let scheduler = QueueScheduler::default();
        let strategy = strategy(2);

        let mut ids = Vec::new();
        for _ in 0..4 {
            let (task, _handle) = scheduler.spawn(async {});
            ids.push(task.id());
            // Safety: this thread acts as worker 1 for the whole test
            unsafe { strategy.push(task, Some(1)) };
        }

        // worker 0 has nothing locally and the global queue is empty, it has to steal
        let mut worker = strategy.worker(0);
        let first = strategy.pop(&mut worker).unwrap();
        assert_eq!(first.id(), ids[0]);

        // half of the victim's queue was taken, the rest of the loot went to worker 0's queue
        let second = strategy.pop(&mut worker).unwrap();
        assert_eq!(second.id(), ids[1]);

        strategy.stop();
        assert!(strategy.pop(&mut worker).is_none());
        assert_eq!(strategy.drain().len(), 2);
    }

    #[test]
    fn global_queue_is_checked_periodically() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let scheduler = QueueScheduler::default();
        let strategy = WorkStealing::new(
            &TaskProcessorConfig::default()
                .with_worker_threads(1)
                .with_global_queue_interval(2),
        );
        let mut worker = strategy.worker(0);

        let (local_a, _a) = scheduler.spawn(async {});
        let (local_b, _b) = scheduler.spawn(async {});
        let (global, _c) = scheduler.spawn(async {});
        let global_id = global.id();
        // Safety: this thread acts as worker 0
        unsafe {
            strategy.push(local_a, Some(0));
            strategy.push(local_b, Some(0));
            strategy.push(global, None);
        }

        // tick 1 takes from the local queue, tick 2 looks at the global queue first
        assert_ne!(strategy.pop(&mut worker).unwrap().id(), global_id);
        assert_eq!(strategy.pop(&mut worker).unwrap().id(), global_id);
    }
}
