// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::hint;

/// An [exponential backoff] for spin loops.
///
/// Used by the spin lock guarding wait lists, by the stealing loop of idle consumers and by
/// OS threads that contend on an engine [`Mutex`](crate::sync::Mutex) outside of any task.
///
/// [exponential backoff]: https://en.wikipedia.org/wiki/Exponential_backoff
#[derive(Debug, Copy, Clone)]
pub(crate) struct Backoff {
    exp: u8,
    max: u8,
}

// === impl Backoff ===

impl Backoff {
    /// The default maximum exponent (2^8).
    pub(crate) const DEFAULT_MAX_EXPONENT: u8 = 8;

    #[must_use]
    pub(crate) const fn new() -> Self {
        Self {
            exp: 0,
            max: Self::DEFAULT_MAX_EXPONENT,
        }
    }

    /// Backs off in a spin loop.
    ///
    /// Each call issues `2^exp` spin loop hints and bumps the exponent until it reaches the
    /// configured maximum.
    #[inline(always)]
    pub(crate) fn spin(&mut self) {
        let spins = 1_u32 << self.exp;

        for _ in 0..spins {
            // In tests, especially in loom tests, we need to yield the thread back to the runtime
            // so it can make progress. See https://github.com/tokio-rs/loom/issues/162#issuecomment-665128979
            #[cfg(any(test, loom))]
            crate::loom::thread::yield_now();

            hint::spin_loop();
        }

        if self.exp < self.max {
            self.exp += 1;
        }
    }

    /// Returns `true` once spinning has reached the maximum exponent, at which point callers
    /// that can afford it should yield their OS thread instead of burning more cycles.
    #[inline]
    pub(crate) fn is_completed(&self) -> bool {
        self.exp >= self.max
    }

    /// Spins while the backoff is still growing, then yields the OS thread.
    #[inline]
    pub(crate) fn snooze(&mut self) {
        if self.is_completed() {
            crate::loom::thread::yield_now();
        } else {
            self.spin();
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
