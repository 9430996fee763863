// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cmp::Ordering;
use core::fmt;
use std::time::{Duration, Instant};

/// An optional point in time on the monotonic clock after which a wait is abandoned.
///
/// The default value is the *unreachable* deadline, i.e. "wait forever". Unreachable deadlines
/// compare greater than every reachable one.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never passes.
    #[must_use]
    pub const fn unreachable() -> Self {
        Self(None)
    }

    /// A deadline that has already passed.
    ///
    /// Waiting on it never suspends: deadline-aware operations return their timeout outcome
    /// right away unless the condition is already satisfied.
    #[must_use]
    pub fn passed() -> Self {
        Self(Some(Instant::now()))
    }

    /// A deadline `timeout` from now. Durations too large to be represented yield an
    /// unreachable deadline.
    #[must_use]
    pub fn from_duration(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    #[must_use]
    pub const fn from_instant(instant: Instant) -> Self {
        Self(Some(instant))
    }

    #[must_use]
    pub const fn is_reachable(&self) -> bool {
        self.0.is_some()
    }

    /// Returns `true` once the monotonic clock has passed this deadline.
    #[must_use]
    pub fn is_reached(&self) -> bool {
        self.0.is_some_and(|at| at <= Instant::now())
    }

    /// The time left until the deadline is reached, saturating at zero. Returns `None` for
    /// unreachable deadlines.
    #[must_use]
    pub fn time_left(&self) -> Option<Duration> {
        self.0
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    #[must_use]
    pub const fn as_instant(&self) -> Option<Instant> {
        self.0
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Self::from_instant(instant)
    }
}

impl From<Duration> for Deadline {
    fn from(timeout: Duration) -> Self {
        Self::from_duration(timeout)
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0, other.0) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(&b),
        }
    }
}

impl fmt::Debug for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.time_left() {
            Some(left) => f.debug_tuple("Deadline").field(&left).finish(),
            None => f.write_str("Deadline(unreachable)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_is_unreachable() {
        let deadline = Deadline::default();
        assert!(!deadline.is_reachable());
        assert!(!deadline.is_reached());
        assert_eq!(deadline.time_left(), None);
        assert_eq!(deadline, Deadline::unreachable());
    }

    #[test]
    fn passed_is_reached() {
        let deadline = Deadline::passed();
        assert!(deadline.is_reachable());
        assert!(deadline.is_reached());
        assert_eq!(deadline.time_left(), Some(Duration::ZERO));
    }

    #[test]
    fn huge_durations_are_unreachable() {
        assert!(!Deadline::from_duration(Duration::MAX).is_reachable());
    }

    #[test]
    fn future_deadline_is_not_reached() {
        let deadline = Deadline::from_duration(Duration::from_secs(3600));
        assert!(!deadline.is_reached());
        assert!(deadline.time_left().unwrap() > Duration::from_secs(3500));
    }

    proptest! {
        #[test]
        fn unreachable_is_the_latest(ms in 0u64..1_000_000) {
            let reachable = Deadline::from_duration(Duration::from_millis(ms));
            prop_assert!(reachable < Deadline::unreachable());
            prop_assert_eq!(reachable.min(Deadline::unreachable()), reachable);
            prop_assert_eq!(Deadline::unreachable().min(reachable), reachable);
        }

        #[test]
        fn ordering_follows_instants(a in 0u64..1_000_000, b in 0u64..1_000_000) {
            let base = Instant::now();
            let da = Deadline::from_instant(base + Duration::from_millis(a));
            let db = Deadline::from_instant(base + Duration::from_millis(b));
            prop_assert_eq!(da.cmp(&db), a.cmp(&b));
        }
    }
}
