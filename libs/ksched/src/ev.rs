// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bridge to event loop threads: timers, file descriptor readiness and sleeping.
//!
//! Event loops run on dedicated OS threads owned by an [`EventThreadPool`]. Tasks never touch a
//! loop directly, they go through a [`ThreadControl`] which posts closures to the loop's thread.

mod poller;
pub(crate) mod reactor;
mod sleep;
mod thread_control;
mod thread_pool;
mod timer;

pub use poller::{Event, EventKind, Poller};
pub use sleep::{sleep, sleep_until};
pub use thread_control::ThreadControl;
pub use thread_pool::EventThreadPool;
pub use timer::Timer;
