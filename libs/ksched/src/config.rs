// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::num::NonZeroUsize;
use std::thread;

/// How often a work-stealing consumer looks at the global queue before its local queue, in
/// ticks. Keeps tasks spilled to the global queue from starving.
pub const DEFAULT_GLOBAL_QUEUE_INTERVAL: u32 = 61;

/// Configuration of a [`TaskProcessor`](crate::processor::TaskProcessor).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TaskProcessorConfig {
    /// Name of the processor, worker threads are named `{name}-worker-{i}`.
    pub name: String,
    /// Number of worker threads, at least one is always started.
    pub worker_threads: usize,
    /// See [`DEFAULT_GLOBAL_QUEUE_INTERVAL`].
    pub global_queue_interval: u32,
    /// Stack size of worker threads in bytes, the platform default if `None`.
    pub thread_stack_size: Option<usize>,
}

/// Configuration of an [`EventThreadPool`](crate::ev::EventThreadPool).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EventThreadPoolConfig {
    /// Name of the pool, event loop threads are named `{name}-ev-{i}`.
    pub name: String,
    /// Number of event loop threads, at least one is always started.
    pub threads: usize,
}

// === impl TaskProcessorConfig ===

impl TaskProcessorConfig {
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    #[must_use]
    pub fn with_global_queue_interval(mut self, interval: u32) -> Self {
        self.global_queue_interval = interval;
        self
    }

    #[must_use]
    pub fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = Some(size);
        self
    }
}

impl Default for TaskProcessorConfig {
    fn default() -> Self {
        Self {
            name: String::from("main"),
            worker_threads: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            global_queue_interval: DEFAULT_GLOBAL_QUEUE_INTERVAL,
            thread_stack_size: None,
        }
    }
}

// === impl EventThreadPoolConfig ===

impl EventThreadPoolConfig {
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
}

impl Default for EventThreadPoolConfig {
    fn default() -> Self {
        Self {
            name: String::from("ksched"),
            threads: 2,
        }
    }
}
