// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::task::Waker;
use std::sync::Arc;
use std::task::Wake;

use crate::loom::thread::{self, Thread};

/// Parks and unparks one OS thread.
///
/// Built on the thread's park token, an `unpark` that happens before the matching `park` is not
/// lost.
#[derive(Debug, Clone)]
pub(crate) struct Parker(Thread);

// === impl Parker ===

impl Parker {
    pub(crate) fn for_current() -> Self {
        Self(thread::current())
    }

    /// Block the calling thread until unparked. May return spuriously.
    pub(crate) fn park(&self) {
        tracing::trace!("parking current thread ({:?})...", self.0.name());
        thread::park();
    }

    pub(crate) fn unpark(&self) {
        tracing::trace!("unparking thread {:?}...", self.0.name());
        self.0.unpark();
    }

    /// Convert self into a `Waker` that unparks this thread.
    pub(crate) fn into_waker(self) -> Waker {
        Waker::from(Arc::new(self))
    }
}

impl Wake for Parker {
    fn wake(self: Arc<Self>) {
        self.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.unpark();
    }
}
