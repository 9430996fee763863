// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::any::type_name;
use core::panic::Location;
use core::time::Duration;

use crate::deadline::Deadline;
use crate::error::SpawnError;
use crate::processor::{ProcessorHandle, QueueStrategy};
use crate::task::id::Id;
use crate::task::{Task, TaskHandle, context};
use crate::task_local::Storage;

/// Configures and spawns a task onto a processor.
pub struct TaskBuilder<'a, Q: QueueStrategy> {
    handle: &'a ProcessorHandle<Q>,
    location: Option<Location<'a>>,
    name: Option<&'a str>,
    deadline: Deadline,
}

impl<'a, Q: QueueStrategy> TaskBuilder<'a, Q> {
    pub(crate) fn new(handle: &'a ProcessorHandle<Q>) -> Self {
        Self {
            handle,
            location: None,
            name: None,
            deadline: Deadline::unreachable(),
        }
    }

    /// Override the name of tasks spawned by this builder.
    ///
    /// By default, tasks are unnamed.
    #[must_use]
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Set the deadline of tasks spawned by this builder. Once it is reached, cancellation of
    /// the task is requested with [`CancellationReason::Deadline`](crate::task::CancellationReason::Deadline).
    ///
    /// By default, tasks have no deadline.
    #[must_use]
    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// Shorthand for [`TaskBuilder::deadline`] with a deadline `timeout` from now.
    #[must_use]
    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline(Deadline::from_duration(timeout))
    }

    /// Override the source code location that will be associated with tasks spawned by this builder.
    ///
    /// By default, tasks will inherit the source code location of where they have been first spawned.
    #[must_use]
    pub fn location(mut self, location: Location<'a>) -> Self {
        self.location = Some(location);
        self
    }

    /// Attempt to spawn this [`Future`] onto the processor.
    ///
    /// When called from inside a running task, the new task starts out with copies of the
    /// spawning task's inherited task-local values.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::Closed`] when the processor has been shut down.
    #[inline]
    #[track_caller]
    pub fn try_spawn<F>(&self, future: F) -> Result<TaskHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let id = Id::next();

        let loc = self.location.as_ref().unwrap_or(Location::caller());
        let span = tracing::trace_span!(
            "task",
            task.id = id.as_u64(),
            task.name = ?self.name,
            task.output = %type_name::<F::Output>(),
            loc.file = loc.file(),
            loc.line = loc.line(),
            loc.col = loc.column(),
        );

        let storage = context::with_current(|header| match header {
            // Safety: the current task is being polled by this very thread
            Some(header) => unsafe { header.with_storage(|storage| storage.inherit()) },
            None => Storage::new(),
        });

        let (task, handle) = Task::new(
            future,
            self.handle.clone(),
            id,
            self.deadline,
            storage,
            span,
        );

        self.handle.bind(task)?;

        Ok(handle)
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
        match self.try_spawn(future) {
            Ok(handle) => handle,
            Err(err) => panic!("failed to spawn task: {err}"),
        }
    }
}
