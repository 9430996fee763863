// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task processors own a set of worker threads that poll tasks.
//!
//! How ready tasks are distributed between the workers is decided by the [`QueueStrategy`]
//! type parameter:
//!
//! - [`WorkStealing`] (the default) gives every worker its own bounded lock-free queue and lets
//!   idle workers steal from busy ones.
//! - [`GlobalQueue`] shares one FIFO queue between all workers.

mod global;
mod park;
mod work_stealing;

use core::fmt;
use core::pin::pin;
use core::task::{Context, Poll};
use std::collections::HashMap;
use std::io;
use std::mem;
use std::sync::Arc;
use std::thread;

use crate::config::TaskProcessorConfig;
use crate::error::{Closed, SpawnError};
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::task::{
    CancellationReason, Id, PollResult, Schedule, TaskBuilder, TaskHandle, TaskRef, context,
};
use crate::task_local;
use crate::util::{CachePadded, SpinMutex};

pub use global::GlobalQueue;
pub(crate) use park::Parker;
pub use work_stealing::{
    CONSUMER_STEAL_BUFFER_SIZE, ConsumerState, LOCAL_QUEUE_SIZE, STEAL_ATTEMPTS, WorkStealing,
};

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// How a [`TaskProcessor`] hands ready tasks to its workers.
///
/// This trait is sealed, the strategies shipped with this crate are [`WorkStealing`] and
/// [`GlobalQueue`].
pub trait QueueStrategy: sealed::Sealed + Send + Sync + Sized + 'static {
    /// State owned by a single worker thread.
    #[doc(hidden)]
    type Worker;

    #[doc(hidden)]
    fn new(config: &TaskProcessorConfig) -> Self;

    /// Called on the thread of worker `index` before it pops its first task.
    #[doc(hidden)]
    fn worker(&self, index: usize) -> Self::Worker;

    /// Enqueue a ready task.
    ///
    /// # Safety
    ///
    /// If `worker` is `Some(i)` the caller must run on the thread of worker `i`.
    #[doc(hidden)]
    unsafe fn push(&self, task: TaskRef, worker: Option<usize>);

    /// Block until a task is available, returns `None` once the strategy was stopped.
    #[doc(hidden)]
    fn pop(&self, worker: &mut Self::Worker) -> Option<TaskRef>;

    #[doc(hidden)]
    fn stop(&self);

    /// Remove every queued task. Only called once all workers have exited.
    #[doc(hidden)]
    fn drain(&self) -> Vec<TaskRef>;
}

/// Runs tasks on a set of named worker threads.
///
/// Dropping the processor shuts it down, see [`TaskProcessor::shutdown`].
pub struct TaskProcessor<Q: QueueStrategy = WorkStealing> {
    handle: ProcessorHandle<Q>,
    workers: SpinMutex<Vec<thread::JoinHandle<()>>>,
}

/// A cloneable handle for spawning tasks onto a [`TaskProcessor`] from anywhere.
pub struct ProcessorHandle<Q: QueueStrategy = WorkStealing>(Arc<Shared<Q>>);

struct Shared<Q> {
    strategy: Q,
    /// Every task that was spawned and has not reached a terminal state yet.
    tasks: Registry,
    closed: AtomicBool,
    name: String,
    worker_count: usize,
}

// === impl TaskProcessor ===

impl TaskProcessor<WorkStealing> {
    /// Start a work-stealing processor with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread could not be spawned.
    pub fn new() -> io::Result<Self> {
        Self::with_config(TaskProcessorConfig::default())
    }
}

impl<Q: QueueStrategy> TaskProcessor<Q> {
    /// Start a processor with `config.worker_threads` workers (at least one).
    ///
    /// Starting the first processor seals the task-local registry.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread could not be spawned. Workers that already started
    /// are shut down again.
    pub fn with_config(config: TaskProcessorConfig) -> io::Result<Self> {
        task_local::seal();

        let worker_count = config.worker_threads.max(1);
        let handle = ProcessorHandle(Arc::new(Shared {
            strategy: Q::new(&config),
            tasks: Registry::new(worker_count),
            closed: AtomicBool::new(false),
            name: config.name.clone(),
            worker_count,
        }));

        let this = Self {
            handle,
            workers: SpinMutex::new(Vec::with_capacity(worker_count)),
        };

        for index in 0..worker_count {
            let mut builder = thread::Builder::new().name(format!("{}-worker-{index}", config.name));
            if let Some(stack_size) = config.thread_stack_size {
                builder = builder.stack_size(stack_size);
            }

            let handle = this.handle.clone();
            // on error `this` is dropped, which stops and joins the workers spawned so far
            let worker = builder.spawn(move || run_worker(&handle, index))?;
            this.workers.lock().push(worker);
        }

        tracing::debug!(processor = %config.name, worker_count, "task processor started");

        Ok(this)
    }

    /// Returns a cloneable handle for spawning tasks onto this processor.
    pub fn handle(&self) -> &ProcessorHandle<Q> {
        &self.handle
    }

    /// Returns a builder for configuring and spawning a task.
    pub fn builder(&self) -> TaskBuilder<'_, Q> {
        self.handle.builder()
    }

    /// Attempt to spawn this [`Future`] onto the processor.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::Closed`] if the processor has been shut down.
    #[inline]
    #[track_caller]
    pub fn try_spawn<F>(&self, future: F) -> Result<TaskHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.try_spawn(future)
    }

    /// Spawn this [`Future`] onto the processor.
    ///
    /// # Panics
    ///
    /// Panics if the processor has been shut down.
    #[inline]
    #[track_caller]
    pub fn spawn<F>(&self, future: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run `future` to completion on the calling thread, parking the thread while it is pending.
    ///
    /// The future is not a task, but it can spawn onto this processor and use every
    /// synchronization primitive of this crate.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let _span = tracing::debug_span!("block_on", processor = %self.handle.0.name).entered();

        let parker = Parker::for_current();
        let waker = parker.clone().into_waker();
        let mut cx = Context::from_waker(&waker);
        let mut future = pin!(future);

        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return output;
            }
            parker.park();
        }
    }

    /// Stop the processor.
    ///
    /// New spawns fail with [`SpawnError::Closed`], the workers are stopped and joined, and every
    /// task that did not complete yet is cancelled: its future is dropped and its handle reports
    /// a cancellation. Calling this more than once is fine.
    ///
    /// When called from a task running on this processor, only new spawns are refused and the
    /// workers are told to stop. Joining them and cancelling the remaining tasks is left to the
    /// next call from outside the processor.
    pub fn shutdown(&self) {
        let shared = &self.handle.0;

        // `bind` checks the flag under its shard lock, the sweep below takes every shard lock
        // after it was set and can't miss a task
        if shared.closed.swap(true, Ordering::AcqRel) && self.workers.lock().is_empty() {
            return;
        }
        tracing::debug!(processor = %shared.name, "shutting down task processor");

        shared.strategy.stop();

        // a task shutting down its own processor can't wait for itself, the rest of the teardown
        // happens on the next `shutdown` from outside (or on drop)
        if context::current_worker(self.handle.key()).is_some() {
            return;
        }

        let workers = mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!(processor = %shared.name, "worker thread panicked");
            }
        }

        // taken out of the locks because dropping futures may try to spawn
        let tasks = shared.tasks.take_all();
        for task in &tasks {
            // visible to the future's destructor through `current_cancellation_reason`
            task.header().request_cancel(CancellationReason::Shutdown);
            task.shutdown();
        }
        drop(tasks);

        let queued = shared.strategy.drain();
        tracing::trace!(processor = %shared.name, queued = queued.len(), "dropping queued tasks");
        drop(queued);
    }

    /// Returns the number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.handle.0.worker_count
    }

    /// Returns the name of this processor.
    pub fn name(&self) -> &str {
        &self.handle.0.name
    }
}

impl<Q: QueueStrategy> Drop for TaskProcessor<Q> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<Q: QueueStrategy + fmt::Debug> fmt::Debug for TaskProcessor<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskProcessor")
            .field("handle", &self.handle)
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

fn run_worker<Q: QueueStrategy>(handle: &ProcessorHandle<Q>, index: usize) {
    let shared = &handle.0;
    let _span = tracing::debug_span!("worker", processor = %shared.name, worker = index).entered();
    let _worker = context::enter_worker(handle.key(), index);
    let mut worker = shared.strategy.worker(index);

    tracing::trace!("worker started");

    while let Some(task) = shared.strategy.pop(&mut worker) {
        match task.poll() {
            PollResult::Ready | PollResult::Pending => {}
            PollResult::PendingSchedule => handle.schedule(task),
        }
    }

    tracing::trace!("worker stopped");
}

// === impl ProcessorHandle ===

impl<Q: QueueStrategy> ProcessorHandle<Q> {
    /// Returns a builder for configuring and spawning a task.
    pub fn builder(&self) -> TaskBuilder<'_, Q> {
        TaskBuilder::new(self)
    }

    /// Attempt to spawn this [`Future`] onto the processor.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::Closed`] if the processor has been shut down.
    #[inline]
    #[track_caller]
    pub fn try_spawn<F>(&self, future: F) -> Result<TaskHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.builder().try_spawn(future)
    }

    /// Spawn this [`Future`] onto the processor.
    ///
    /// # Panics
    ///
    /// Panics if the processor has been shut down.
    #[inline]
    #[track_caller]
    pub fn spawn<F>(&self, future: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.builder().spawn(future)
    }

    /// Returns `true` once the processor has been shut down.
    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    /// Register a freshly allocated task and enqueue it.
    pub(crate) fn bind(&self, task: TaskRef) -> Result<(), Closed> {
        {
            let mut shard = self.0.tasks.shard(task.id()).lock();
            // checked under the lock so `shutdown` can't miss the task
            if self.0.closed.load(Ordering::Acquire) {
                return Err(Closed::new());
            }
            shard.insert(task.id(), task.clone());
        }

        // a task cancelled right after binding is still enqueued once so its future gets dropped
        if task.mark_scheduled() {
            self.schedule(task);
        }

        Ok(())
    }

    /// Identifies the processor in the per-thread worker bookkeeping.
    fn key(&self) -> usize {
        Arc::as_ptr(&self.0).addr()
    }
}

impl<Q: QueueStrategy> Schedule for ProcessorHandle<Q> {
    fn schedule(&self, task: TaskRef) {
        let worker = context::current_worker(self.key());
        // Safety: `current_worker` only reports an index while running on that worker's thread
        unsafe { self.0.strategy.push(task, worker) }
    }

    fn release(&self, id: Id) {
        let task = self.0.tasks.shard(id).lock().remove(&id);
        drop(task);
    }
}

// === impl Registry ===

/// The live tasks of a processor, sharded by task id so spawns and completions on different
/// workers rarely touch the same lock.
struct Registry {
    shards: Box<[CachePadded<SpinMutex<HashMap<Id, TaskRef>>>]>,
}

impl Registry {
    fn new(workers: usize) -> Self {
        let shards = workers.saturating_mul(4).next_power_of_two();
        Self {
            shards: (0..shards)
                .map(|_| CachePadded(SpinMutex::new(HashMap::new())))
                .collect(),
        }
    }

    fn shard(&self, id: Id) -> &SpinMutex<HashMap<Id, TaskRef>> {
        // the shard count is a power of two
        let mask = u64::try_from(self.shards.len() - 1).unwrap_or(u64::MAX);
        let index = usize::try_from(id.as_u64() & mask).unwrap_or(0);
        &self.shards[index].0
    }

    /// Empty every shard, returning the tasks that were registered.
    fn take_all(&self) -> Vec<TaskRef> {
        self.shards
            .iter()
            .flat_map(|shard| mem::take(&mut *shard.0.lock()).into_values())
            .collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.0.lock().len()).sum()
    }
}

impl<Q: QueueStrategy> Clone for ProcessorHandle<Q> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<Q: QueueStrategy + fmt::Debug> fmt::Debug for ProcessorHandle<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorHandle")
            .field("name", &self.0.name)
            .field("worker_count", &self.0.worker_count)
            .field("closed", &self.0.closed)
            .field("strategy", &self.0.strategy)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::SingleConsumerEvent;
    use crate::task::{self, JoinError, TaskState};
    use std::sync::atomic::AtomicUsize;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    fn config(workers: usize) -> TaskProcessorConfig {
        TaskProcessorConfig::default()
            .with_name("test")
            .with_worker_threads(workers)
    }

    #[test]
    fn workers_are_named() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let processor = TaskProcessor::<WorkStealing>::with_config(config(2)).unwrap();
        let name = processor
            .spawn(async { thread::current().name().map(String::from) })
            .blocking_get()
            .unwrap();

        let name = name.unwrap();
        assert!(name == "test-worker-0" || name == "test-worker-1", "{name}");
        assert_eq!(processor.worker_count(), 2);
        assert_eq!(processor.name(), "test");
    }

    #[test]
    fn spawn_and_join_global_queue() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let processor = TaskProcessor::<GlobalQueue>::with_config(config(3)).unwrap();
        let handles: Vec<_> = (0..100).map(|i| processor.spawn(async move { i * 2 })).collect();

        let sum: usize = handles.into_iter().map(|h| h.blocking_get().unwrap()).sum();
        assert_eq!(sum, (0..100).map(|i| i * 2).sum());
    }

    #[test]
    fn nested_spawns_run_on_the_same_processor() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let processor = TaskProcessor::<WorkStealing>::with_config(config(4)).unwrap();
        let handle = processor.handle().clone();
        let counter = Arc::new(AtomicUsize::new(0));

        let outer = {
            let counter = counter.clone();
            processor.spawn(async move {
                let children: Vec<_> = (0..64)
                    .map(|_| {
                        let counter = counter.clone();
                        handle.spawn(async move {
                            task::yield_now().await;
                            counter.fetch_add(1, Ordering::Relaxed);
                        })
                    })
                    .collect();

                for child in children {
                    child.join().await.unwrap();
                }
            })
        };

        outer.blocking_get().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn block_on_can_await_tasks() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let processor = TaskProcessor::<WorkStealing>::with_config(config(2)).unwrap();
        let output = processor.block_on(async {
            let handle = processor.spawn(async { 42 });
            handle.get().await
        });
        assert_eq!(output.unwrap(), 42);
    }

    #[test]
    fn registry_shards_by_id() {
        let registry = Registry::new(3);
        assert_eq!(registry.shards.len(), 16);

        let sched = crate::task::tests::QueueScheduler::default();
        let tasks: Vec<_> = (0..64).map(|_| sched.spawn(async {}).0).collect();
        for task in &tasks {
            registry.shard(task.id()).lock().insert(task.id(), task.clone());
        }

        let used = registry
            .shards
            .iter()
            .filter(|shard| !shard.0.lock().is_empty())
            .count();
        assert!(used > 1, "all tasks landed in one shard");
        assert_eq!(registry.len(), 64);
        assert_eq!(registry.take_all().len(), 64);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn completed_tasks_leave_the_registry() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let processor = TaskProcessor::<WorkStealing>::with_config(config(4)).unwrap();
        let handles: Vec<_> = (0..1000).map(|i| processor.spawn(async move { i })).collect();
        for handle in handles {
            handle.blocking_get().unwrap();
        }

        // the output is published right before the task is released
        while processor.handle.0.tasks.len() != 0 {
            thread::yield_now();
        }
    }

    #[test]
    fn shutdown_cancels_pending_tasks() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let processor = TaskProcessor::<WorkStealing>::with_config(config(2)).unwrap();
        let event = Arc::new(SingleConsumerEvent::new());

        let handle = {
            let event = event.clone();
            processor.spawn(async move {
                let _ = event.wait().await;
            })
        };

        // give the task a chance to suspend
        while handle.state() != TaskState::Suspended {
            thread::yield_now();
        }

        processor.shutdown();
        let err: JoinError = handle.blocking_join().unwrap_err();
        assert!(err.is_cancelled());

        assert_eq!(processor.try_spawn(async {}).unwrap_err(), SpawnError::Closed);
        // a second shutdown is a no-op
        processor.shutdown();
    }
}
