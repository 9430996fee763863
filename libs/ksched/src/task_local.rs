// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-task keyed storage.
//!
//! Task-local variables are declared as `static`s and registered once at startup, before the
//! first [`TaskProcessor`](crate::processor::TaskProcessor) is started:
//!
//! ```
//! use ksched::task_local::{Inherited, Normal, Variable};
//!
//! static REQUEST_ID: Variable<u64, Inherited> = Variable::new();
//! static SCRATCH: Variable<Vec<u8>, Normal> = Variable::new();
//!
//! REQUEST_ID.register();
//! SCRATCH.register();
//! ```
//!
//! Starting a processor *seals* the registry, registering afterwards panics. Every task owns
//! its own set of values, which is dropped (in reverse registration order) when the task
//! finishes. [`Inherited`] values are shared by pointer with every task spawned from the owning
//! task.

use core::any::Any;
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::task::context;
use crate::util::SpinMutex;

static REGISTRY: Registry = Registry::new();

const UNREGISTERED: usize = usize::MAX;

/// A value is only visible to the task that set it.
#[derive(Debug)]
pub enum Normal {}

/// The value is copied (by `Arc` pointer) into every task spawned from the task that holds it.
#[derive(Debug)]
pub enum Inherited {}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Normal {}
    impl Sealed for super::Inherited {}
}

/// How a task-local value behaves when a child task is spawned.
pub trait Kind: sealed::Sealed + 'static {
    #[doc(hidden)]
    const INHERITED: bool;
}

impl Kind for Normal {
    const INHERITED: bool = false;
}

impl Kind for Inherited {
    const INHERITED: bool = true;
}

/// A task-local variable, see the [module level docs](self).
pub struct Variable<T, K: Kind = Normal> {
    key: AtomicUsize,
    _marker: PhantomData<fn() -> (T, K)>,
}

/// The task-local values of one task.
#[derive(Default)]
pub(crate) struct Storage {
    slots: Vec<Option<Slot>>,
}

pub(crate) enum Slot {
    Normal(Box<dyn Any + Send>),
    Inherited(Arc<dyn Any + Send + Sync>),
}

/// Hands out keys until it is sealed.
struct Registry {
    state: SpinMutex<RegistryState>,
}

struct RegistryState {
    next_key: usize,
    sealed: bool,
}

/// Seal the process-wide registry, after this registering a variable panics.
pub(crate) fn seal() {
    if !mem::replace(&mut REGISTRY.state.lock().sealed, true) {
        tracing::debug!("task-local registry sealed");
    }
}

/// Returns `true` once a processor was started and no more variables can be registered.
pub fn is_sealed() -> bool {
    REGISTRY.state.lock().sealed
}

// === impl Registry ===

impl Registry {
    const fn new() -> Self {
        Self {
            state: SpinMutex::new(RegistryState {
                next_key: 0,
                sealed: false,
            }),
        }
    }

    fn register(&self, slot: &AtomicUsize, type_name: &'static str) -> usize {
        let mut state = self.state.lock();

        let key = slot.load(Ordering::Acquire);
        if key != UNREGISTERED {
            return key;
        }

        assert!(
            !state.sealed,
            "task-local variable of type `{type_name}` registered after the first task processor started"
        );

        let key = state.next_key;
        state.next_key += 1;
        slot.store(key, Ordering::Release);
        tracing::trace!(key, type_name, "registered task-local variable");
        key
    }
}

// === impl Variable ===

impl<T, K: Kind> Variable<T, K> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            key: AtomicUsize::new(UNREGISTERED),
            _marker: PhantomData,
        }
    }

    /// Assign this variable its key. Registering twice is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if a [`TaskProcessor`](crate::processor::TaskProcessor) was already started.
    pub fn register(&self) {
        REGISTRY.register(&self.key, core::any::type_name::<T>());
    }

    pub fn is_registered(&self) -> bool {
        self.key.load(Ordering::Acquire) != UNREGISTERED
    }

    /// Run `f` with the current task's slot of this variable.
    fn with_slot<R>(&self, f: impl FnOnce(&mut Option<Slot>) -> R) -> R {
        let key = self.key.load(Ordering::Acquire);
        assert!(
            key != UNREGISTERED,
            "task-local variable of type `{}` used before it was registered",
            core::any::type_name::<T>()
        );

        context::with_current(|header| {
            let Some(header) = header else {
                panic!(
                    "task-local variable of type `{}` accessed outside of a task",
                    core::any::type_name::<T>()
                );
            };

            // Safety: `with_current` only yields the task this thread is polling right now
            unsafe { header.with_storage(|storage| f(storage.slot(key))) }
        })
    }
}

impl<T: Send + 'static> Variable<T, Normal> {
    /// Returns a clone of the current task's value.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a task or when the value is not set.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Returns a clone of the current task's value, if set.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a task.
    pub fn get_optional(&self) -> Option<T>
    where
        T: Clone,
    {
        self.with_slot(|slot| match slot {
            Some(Slot::Normal(value)) => value.downcast_ref::<T>().cloned(),
            _ => None,
        })
    }

    /// Borrow the current task's value.
    ///
    /// While `f` runs the value is taken out of the task's storage, accessing this same
    /// variable from within `f` observes it as unset.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a task or when the value is not set.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.with_mut(|value| f(value))
    }

    /// Mutably borrow the current task's value, see [`Variable::with`].
    ///
    /// # Panics
    ///
    /// Panics when called outside of a task or when the value is not set.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let value = self.take().unwrap_or_else(|| {
            panic!(
                "task-local variable of type `{}` is not set",
                core::any::type_name::<T>()
            )
        });

        // put the value back even if `f` unwinds
        struct Restore<'a, T: Send + 'static> {
            var: &'a Variable<T, Normal>,
            value: Option<Box<T>>,
        }
        impl<T: Send + 'static> Drop for Restore<'_, T> {
            fn drop(&mut self) {
                if let Some(value) = self.value.take() {
                    // replaces whatever `f` set in the meantime
                    let prev = self
                        .var
                        .with_slot(|slot| slot.replace(Slot::Normal(value)));
                    drop(prev);
                }
            }
        }

        let mut restore = Restore {
            var: self,
            value: Some(value),
        };
        let Some(value) = restore.value.as_deref_mut() else {
            unreachable!()
        };
        f(value)
    }

    /// Set the current task's value, dropping the previous one.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a task.
    pub fn set(&self, value: T) {
        let prev = self.with_slot(|slot| slot.replace(Slot::Normal(Box::new(value))));
        drop(prev);
    }

    /// Remove and drop the current task's value.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a task.
    pub fn erase(&self) {
        drop(self.take());
    }

    fn take(&self) -> Option<Box<T>> {
        match self.with_slot(Option::take)? {
            Slot::Normal(value) => value.downcast::<T>().ok(),
            Slot::Inherited(_) => None,
        }
    }
}

impl<T: Send + Sync + 'static> Variable<T, Inherited> {
    /// Returns a clone of the current task's value.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a task or when the value is not set.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Returns a clone of the current task's value, if set.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a task.
    pub fn get_optional(&self) -> Option<T>
    where
        T: Clone,
    {
        self.get_arc().map(|value| T::clone(&value))
    }

    /// Returns the shared pointer to the current task's value, if set.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a task.
    pub fn get_arc(&self) -> Option<Arc<T>> {
        self.with_slot(|slot| match slot {
            Some(Slot::Inherited(value)) => Arc::clone(value).downcast::<T>().ok(),
            _ => None,
        })
    }

    /// Borrow the current task's value.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a task or when the value is not set.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let value = self.get_arc().unwrap_or_else(|| {
            panic!(
                "task-local variable of type `{}` is not set",
                core::any::type_name::<T>()
            )
        });
        f(&value)
    }

    /// Mutably borrow the current task's value.
    ///
    /// The value is shared with parent and child tasks, so it is cloned first unless this task
    /// holds the only pointer.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a task or when the value is not set.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Clone,
    {
        let mut value = self.get_arc().unwrap_or_else(|| {
            panic!(
                "task-local variable of type `{}` is not set",
                core::any::type_name::<T>()
            )
        });
        // drop the storage's pointer so an unshared value is not cloned
        self.with_slot(Option::take);

        let res = f(Arc::make_mut(&mut value));
        self.set_arc(value);
        res
    }

    /// Set the current task's value, dropping the previous one.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a task.
    pub fn set(&self, value: T) {
        self.set_arc(Arc::new(value));
    }

    /// Set the current task's value to a shared pointer.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a task.
    pub fn set_arc(&self, value: Arc<T>) {
        let prev = self.with_slot(|slot| slot.replace(Slot::Inherited(value)));
        drop(prev);
    }

    /// Remove the current task's value. Children spawned earlier keep their copy.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a task.
    pub fn erase(&self) {
        let prev = self.with_slot(Option::take);
        drop(prev);
    }
}

impl<T, K: Kind> Default for Variable<T, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, K: Kind> fmt::Debug for Variable<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("type", &core::any::type_name::<T>())
            .field("inherited", &K::INHERITED)
            .field("key", &self.key.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// === impl Storage ===

impl Storage {
    pub(crate) const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// A fresh storage holding this storage's inherited values.
    pub(crate) fn inherit(&self) -> Self {
        let slots = self
            .slots
            .iter()
            .map(|slot| match slot {
                Some(Slot::Inherited(value)) => Some(Slot::Inherited(Arc::clone(value))),
                _ => None,
            })
            .collect();

        Self { slots }
    }

    /// Remove the value of the most recently registered variable that is set.
    ///
    /// The caller drops the slot once it no longer borrows the storage, so destructors can still
    /// read the values registered before theirs.
    pub(crate) fn pop_last(&mut self) -> Option<Slot> {
        while let Some(slot) = self.slots.pop() {
            if slot.is_some() {
                return slot;
            }
        }
        None
    }

    fn slot(&mut self, key: usize) -> &mut Option<Slot> {
        if key >= self.slots.len() {
            self.slots.resize_with(key + 1, || None);
        }
        &mut self.slots[key]
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        // reverse registration order
        while let Some(slot) = self.slots.pop() {
            drop(slot);
        }
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("len", &self.slots.iter().filter(|slot| slot.is_some()).count())
            .finish()
    }
}
