// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative M:N task scheduling engine.
//!
//! Many lightweight tasks are multiplexed onto a few OS worker threads owned by a
//! [`TaskProcessor`]. Tasks suspend on task-aware synchronization primitives ([`sync::Mutex`],
//! [`sync::ConditionVariable`], [`sync::SingleConsumerEvent`], ...) and on readiness or timer
//! events coming from dedicated event loop threads ([`ev`]). Every wait can be bounded by a
//! [`Deadline`] and interrupted by cancellation of the waiting task.
//!
//! ```
//! use ksched::TaskProcessor;
//! use ksched::sync::Mutex;
//! use std::sync::Arc;
//!
//! let processor = TaskProcessor::new().unwrap();
//! let counter: Arc<Mutex<i32>> = Arc::new(Mutex::new(0));
//!
//! let handles: Vec<_> = (0..10)
//!     .map(|_| {
//!         let counter = counter.clone();
//!         processor.spawn(async move {
//!             *counter.lock().await += 1;
//!         })
//!     })
//!     .collect();
//!
//! for handle in handles {
//!     handle.blocking_get().unwrap();
//! }
//! assert_eq!(*counter.lock_blocking(), 10);
//! ```

pub mod config;
mod deadline;
mod error;
pub mod ev;
mod loom;
pub mod processor;
pub mod sync;
pub mod task;
pub mod task_local;
mod util;

pub use config::{EventThreadPoolConfig, TaskProcessorConfig};
pub use deadline::Deadline;
pub use error::{Closed, SpawnError, WaitError};
pub use processor::{GlobalQueue, ProcessorHandle, QueueStrategy, TaskProcessor, WorkStealing};
pub use task::{JoinError, TaskHandle};
