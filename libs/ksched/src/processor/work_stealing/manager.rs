// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::VecDeque;

use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};
use crate::processor::park::Parker;
use crate::util::SpinMutex;

/// Tracks which consumers sleep and which steal, and decides who gets woken for new work.
#[derive(Debug)]
pub(crate) struct ConsumersManager {
    sleepers: SpinMutex<Sleepers>,
    sleeping: AtomicUsize,
    stealing: AtomicUsize,
    stopped: AtomicBool,
    active: usize,
}

#[derive(Debug)]
struct Sleepers {
    /// Sleeping consumers, in the order they went to sleep.
    queue: VecDeque<usize>,
    /// `is_sleeping[i]` mirrors membership of `i` in `queue`.
    is_sleeping: Vec<bool>,
    /// Filled in by the consumers as they start.
    parkers: Vec<Option<Parker>>,
}

impl ConsumersManager {
    pub(crate) fn new(active: usize) -> Self {
        Self {
            sleepers: SpinMutex::new(Sleepers {
                queue: VecDeque::with_capacity(active),
                is_sleeping: vec![false; active],
                parkers: vec![None; active],
            }),
            sleeping: AtomicUsize::new(0),
            stealing: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            active,
        }
    }

    /// Register the parker of consumer `index`, must be called from the consumer's thread
    /// before it first sleeps.
    pub(crate) fn register(&self, index: usize, parker: Parker) {
        self.sleepers.lock().parkers[index] = Some(parker);
    }

    /// Wake exactly one sleeping consumer, unless a consumer is stealing (it will find the work)
    /// or nobody sleeps.
    pub(crate) fn notify_new_task(&self) {
        // pairs with the SeqCst increment in `sleep` and the SeqCst publication of the task
        if self.stealing.load(Ordering::SeqCst) > 0 || self.sleeping.load(Ordering::SeqCst) == 0 {
            return;
        }

        let parker = {
            let mut sleepers = self.sleepers.lock();
            let Some(index) = sleepers.queue.pop_front() else {
                return;
            };
            sleepers.is_sleeping[index] = false;
            self.sleeping.fetch_sub(1, Ordering::SeqCst);
            sleepers.parkers[index].clone()
        };

        if let Some(parker) = parker {
            parker.unpark();
        }
    }

    /// A consumer may only start stealing while `2 * stealing < active - sleeping`, so at most
    /// about half of the awake consumers hammer the other queues at a time.
    pub(crate) fn allow_stealing(&self) -> bool {
        let stealing = self.stealing.load(Ordering::SeqCst);
        let sleeping = self.sleeping.load(Ordering::SeqCst);
        2 * stealing < self.active.saturating_sub(sleeping)
    }

    pub(crate) fn start_stealing(&self) {
        self.stealing.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns `true` if the caller was the last stealing consumer, which then has to
    /// [notify](Self::notify_new_task) another consumer so remaining work keeps propagating.
    pub(crate) fn stop_stealing(&self) -> bool {
        let prev = self.stealing.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
        prev == 1
    }

    /// Put consumer `index` to sleep until it is notified.
    ///
    /// `has_work` is checked after the consumer was registered as a sleeper, if it returns `true`
    /// the consumer does not sleep. Together with the SeqCst counter this makes sure a task
    /// published concurrently is never missed.
    pub(crate) fn sleep(&self, index: usize, parker: &Parker, has_work: impl Fn() -> bool) {
        {
            let mut sleepers = self.sleepers.lock();
            debug_assert!(!sleepers.is_sleeping[index]);
            sleepers.queue.push_back(index);
            sleepers.is_sleeping[index] = true;
            self.sleeping.fetch_add(1, Ordering::SeqCst);
        }
        // pairs with the fence in `WorkStealing::push`
        fence(Ordering::SeqCst);

        loop {
            if self.stopped.load(Ordering::SeqCst) || has_work() {
                self.cancel_sleep(index);
                return;
            }

            tracing::trace!(consumer = index, "consumer going to sleep");
            parker.park();

            if !self.sleepers.lock().is_sleeping[index] {
                tracing::trace!(consumer = index, "consumer woke up");
                return;
            }
            // spurious wakeup
        }
    }

    /// Wake every sleeping consumer for shutdown.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);

        let parkers: Vec<_> = {
            let mut sleepers = self.sleepers.lock();
            let Sleepers {
                queue,
                is_sleeping,
                parkers,
            } = &mut *sleepers;

            queue
                .drain(..)
                .filter_map(|index| {
                    is_sleeping[index] = false;
                    self.sleeping.fetch_sub(1, Ordering::SeqCst);
                    parkers[index].clone()
                })
                .collect()
        };

        for parker in parkers {
            parker.unpark();
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn sleeping(&self) -> usize {
        self.sleeping.load(Ordering::SeqCst)
    }

    fn cancel_sleep(&self, index: usize) {
        let mut sleepers = self.sleepers.lock();
        if sleepers.is_sleeping[index] {
            sleepers.is_sleeping[index] = false;
            sleepers.queue.retain(|&i| i != index);
            self.sleeping.fetch_sub(1, Ordering::SeqCst);
        }
        // otherwise a notification raced with us, it left an unpark token behind that turns
        // the next park into a spurious wakeup
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn stealing_is_bounded() {
        let manager = ConsumersManager::new(4);
        assert!(manager.allow_stealing());
        manager.start_stealing();
        assert!(manager.allow_stealing());
        manager.start_stealing();
        assert!(!manager.allow_stealing());

        assert!(!manager.stop_stealing());
        assert!(manager.stop_stealing());
    }

    #[test]
    fn sleep_returns_when_work_is_there() {
        let manager = ConsumersManager::new(1);
        let parker = Parker::for_current();
        manager.register(0, parker.clone());

        manager.sleep(0, &parker, || true);
        assert_eq!(manager.sleeping(), 0);
    }

    #[test]
    fn notify_wakes_one_sleeper() {
        let manager = Arc::new(ConsumersManager::new(2));
        let (tx, rx) = mpsc::channel();

        let sleepers: Vec<_> = (0..2)
            .map(|index| {
                let manager = manager.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    let parker = Parker::for_current();
                    manager.register(index, parker.clone());
                    manager.sleep(index, &parker, || false);
                    tx.send(index).unwrap();
                })
            })
            .collect();

        while manager.sleeping() < 2 {
            thread::yield_now();
        }

        manager.notify_new_task();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(manager.sleeping(), 1);
        assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());

        manager.stop();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        for sleeper in sleepers {
            sleeper.join().unwrap();
        }
        assert_eq!(manager.sleeping(), 0);
    }

    #[test]
    fn notify_skips_while_stealing() {
        let manager = ConsumersManager::new(2);
        let parker = Parker::for_current();
        manager.register(0, parker);
        {
            let mut sleepers = manager.sleepers.lock();
            sleepers.queue.push_back(0);
            sleepers.is_sleeping[0] = true;
        }
        manager.sleeping.fetch_add(1, Ordering::SeqCst);

        manager.start_stealing();
        manager.notify_new_task();
        assert_eq!(manager.sleeping(), 1);

        manager.stop_stealing();
        manager.notify_new_task();
        assert_eq!(manager.sleeping(), 0);
    }
}
