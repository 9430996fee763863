// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::time::Duration;

use crate::deadline::Deadline;
use crate::error::WaitError;
use crate::task::{Suspend, WakeupSource};

/// Suspend the current task for `duration`.
///
/// # Errors
///
/// Returns [`WaitError::Cancelled`] if the task was asked to cancel before the time elapsed.
pub async fn sleep(duration: Duration) -> Result<(), WaitError> {
    sleep_until(Deadline::from_duration(duration)).await
}

/// Suspend the current task until `deadline` is reached.
///
/// Sleeping until an [unreachable](Deadline::unreachable) deadline only ends with
/// cancellation.
///
/// # Errors
///
/// Returns [`WaitError::Cancelled`] if the task was asked to cancel before the deadline.
pub async fn sleep_until(deadline: Deadline) -> Result<(), WaitError> {
    match Suspend::new(core::future::pending::<()>(), || false, deadline).await {
        WakeupSource::CancelRequest => Err(WaitError::Cancelled),
        source => {
            tracing::trace!(?source, "sleep finished");
            Ok(())
        }
    }
}
