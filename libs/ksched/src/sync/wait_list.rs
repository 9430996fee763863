// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::UnsafeCell;
use core::marker::PhantomPinned;
use core::pin::Pin;
use core::ptr::{self, NonNull};
use core::task::{Context, Poll, Waker};
use core::{fmt, mem};

use cordyceps::{Linked, List, list};
use pin_project::{pin_project, pinned_drop};

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::Waiters;
use crate::sync::wake_batch::WakeBatch;
use crate::util::{CachePadded, SpinMutex, SpinMutexGuard, loom_const_fn};

/// A list of suspended tasks waiting for some condition to change.
///
/// Tasks register themselves by polling the [`Wait`] future returned from [`WaitList::wait`]
/// and are woken by [`WaitList::wakeup_one`] or [`WaitList::wakeup_all`]. Wakeups are *not*
/// stored: waking a list without waiters does nothing, so callers follow the pattern
///
/// 1. publish the new condition,
/// 2. call `wakeup_one`/`wakeup_all`,
///
/// while waiters
///
/// 1. register on the list,
/// 2. re-check the condition before actually going to sleep.
///
/// # Implementation Notes
///
/// This type is implemented using an [intrusive doubly-linked list][ilist]. Nodes are stored in
/// the futures of the waiting tasks, so waiting does not allocate. Because futures can be dropped
/// at any time, a node *must* be unlinked before its future is dropped, which is why the list is
/// guarded by a (spin) lock that has to be acquired to push, pop or remove nodes.
///
/// Next to the list lives the "sleepies" counter: the number of linked waiters. Wakers consult it
/// to skip taking the lock when nobody is waiting. The counter and the waiters' condition form a
/// Dekker-style handshake: a waiter increments the counter and *then* re-checks the condition,
/// a waker publishes the condition and *then* reads the counter. Only sequentially consistent
/// ordering on both sides rules out that each of them misses the other's write, so every access
/// to the counter is `SeqCst` (and the conditions published by the primitives built on top are
/// too).
///
/// [ilist]: cordyceps::List
pub struct WaitList {
    /// The number of waiters currently linked into `waiters`.
    sleepies: CachePadded<AtomicUsize>,
    /// The linked list of waiters.
    ///
    /// # Safety
    ///
    /// This is protected by a mutex; the mutex *must* be acquired when
    /// manipulating the linked list, OR when manipulating waiter nodes that may
    /// be linked into the list. If a node is known to not be linked, it is safe
    /// to modify that node (such as by waking the stored [`Waker`]) without
    /// holding the lock.
    waiters: SpinMutex<List<Waiter>>,
}

/// Proof that the [`WaitList`] lock is held, returned from [`WaitList::lock`].
///
/// Primitives that need to update their own state atomically with respect to registering
/// waiters hold this guard while doing so.
#[must_use = "the wait list is unlocked as soon as the guard is dropped"]
pub struct WaitListGuard<'a> {
    list: &'a WaitList,
    waiters: SpinMutexGuard<'a, List<Waiter>>,
}

/// Future returned from [`WaitList::wait()`].
///
/// The first poll appends the task to the list, the future completes once the task was woken.
/// Dropping it unlinks the node again; a node that was woken by `wakeup_one` but never observed
/// the wakeup hands it on to another waiter.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Wait<'a> {
    /// The [`WaitList`] being waited on.
    list: &'a WaitList,
    /// Entry in the wait list.
    #[pin]
    waiter: Waiter,
}

/// A waiter node which may be linked into a wait list.
#[repr(C)]
#[pin_project]
struct Waiter {
    /// The intrusive linked list node.
    ///
    /// This *must* be the first field in the struct in order for the `Linked`
    /// implementation to be sound.
    #[pin]
    node: UnsafeCell<WaiterInner>,
    /// The future's state.
    state: WaitState,
}

struct WaiterInner {
    /// Intrusive linked list pointers.
    links: list::Links<Waiter>,
    /// The node's waker
    wakeup: Wakeup,
    // This type is !Unpin due to the heuristic from:
    // <https://github.com/rust-lang/rust/pull/82834>
    _pin: PhantomPinned,
}

/// The state of a [`Waiter`] node, as seen by the future owning it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum WaitState {
    /// The waiter has not yet been enqueued.
    ///
    /// When in this state, the node is **not** part of the linked list, and
    /// can be dropped without removing it from the list.
    Start,
    /// The waiter was enqueued.
    ///
    /// The node **may** still be part of the linked list, its `wakeup` field (read under the
    /// lock) tells whether a waker already popped it.
    Waiting,
    /// The waiter has observed its wakeup.
    ///
    /// When in this state, the node is **not** part of the linked list, and
    /// can be dropped without removing it from the list.
    Woken,
}

#[derive(Clone, Debug)]
enum Wakeup {
    Empty,
    /// Linked into the list, waiting for a wakeup.
    Waiting(Waker),
    /// Popped by [`WaitList::wakeup_one`].
    One,
    /// Popped by [`WaitList::wakeup_all`].
    All,
}

// === impl WaitList ===

impl Default for WaitList {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitList {
    loom_const_fn! {
        #[must_use]
        pub const fn new() -> Self {
            Self {
                sleepies: CachePadded(AtomicUsize::new(0)),
                waiters: SpinMutex::new(List::new()),
            }
        }
    }

    /// Wait to be woken up by this list.
    ///
    /// Equivalent to:
    ///
    /// ```ignore
    /// async fn wait(&self);
    /// ```
    ///
    /// The task is only appended to the list when the returned future is polled for the first
    /// time, wakeups issued before that are not observed.
    pub fn wait(&self) -> Wait<'_> {
        Wait {
            list: self,
            waiter: Waiter {
                node: UnsafeCell::new(WaiterInner {
                    links: list::Links::new(),
                    wakeup: Wakeup::Empty,
                    _pin: PhantomPinned,
                }),
                state: WaitState::Start,
            },
        }
    }

    /// Wake one task waiting on this list.
    ///
    /// Returns without touching the lock when no task is waiting.
    #[inline]
    pub fn wakeup_one(&self) {
        if self.sleepies() == 0 {
            return;
        }

        let waker = {
            let mut waiters = self.waiters.lock();
            self.wake_locked(&mut waiters)
        };

        // now that we've released the lock, wake the waiting task (if we
        // actually dequeued one).
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Wake *all* tasks currently waiting on this list.
    ///
    /// Returns without touching the lock when no task is waiting.
    #[inline]
    pub fn wakeup_all(&self) {
        if self.sleepies() == 0 {
            return;
        }

        let mut waiters = self.waiters.lock();
        self.wake_all_locked(&mut waiters);
    }

    /// Acquire the lock protecting the list.
    pub fn lock(&self) -> WaitListGuard<'_> {
        WaitListGuard {
            list: self,
            waiters: self.waiters.lock(),
        }
    }

    /// The number of tasks currently linked into the list.
    #[inline]
    pub fn sleepies(&self) -> usize {
        self.sleepies.0.load(Ordering::SeqCst)
    }

    #[cold]
    #[inline(never)]
    fn wake_locked(&self, waiters: &mut List<Waiter>) -> Option<Waker> {
        let node = waiters.pop_back()?;
        self.sleepies.0.fetch_sub(1, Ordering::SeqCst);
        Waiter::wake(node, waiters, Wakeup::One)
    }

    fn wake_all_locked(&self, waiters: &mut SpinMutexGuard<'_, List<Waiter>>) {
        let mut batch = WakeBatch::new();
        let mut waiters_remaining = true;

        // As long as there are waiters remaining to wake, drain another batch, release the lock,
        // and wake them.
        while waiters_remaining {
            waiters_remaining = self.drain_to_wake_batch(&mut batch, waiters);
            SpinMutexGuard::unlocked(waiters, || batch.wake_all());
        }
    }

    /// Drain waiters from `waiters` and add them to `batch`. Returns `true` if
    /// the batch was filled while more waiters remain in the list, indicating
    /// that this function must be called again to wake all waiters.
    fn drain_to_wake_batch(&self, batch: &mut WakeBatch, waiters: &mut List<Waiter>) -> bool {
        while let Some(node) = waiters.pop_back() {
            self.sleepies.0.fetch_sub(1, Ordering::SeqCst);

            let Some(waker) = Waiter::wake(node, waiters, Wakeup::All) else {
                continue;
            };

            if !batch.add_waker(waker) {
                // wake set is full, drop the lock and wake everyone!
                break;
            }
        }

        !waiters.is_empty()
    }
}

impl fmt::Debug for WaitList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitList")
            .field("sleepies", &self.sleepies())
            .finish_non_exhaustive()
    }
}

impl Waiters for WaitList {
    type Wait<'a> = Wait<'a>;

    fn wait(&self) -> Self::Wait<'_> {
        WaitList::wait(self)
    }

    fn wakeup_one(&self) {
        WaitList::wakeup_one(self);
    }

    fn wakeup_all(&self) {
        WaitList::wakeup_all(self);
    }
}

// === impl WaitListGuard ===

impl WaitListGuard<'_> {
    /// Wake one task waiting on the list.
    ///
    /// The lock is released while the task's waker runs.
    pub fn wakeup_one(&mut self) {
        if let Some(waker) = self.list.wake_locked(&mut self.waiters) {
            SpinMutexGuard::unlocked(&mut self.waiters, || waker.wake());
        }
    }

    /// Wake all tasks waiting on the list.
    ///
    /// The lock is released while the tasks' wakers run.
    pub fn wakeup_all(&mut self) {
        self.list.wake_all_locked(&mut self.waiters);
    }

    /// Returns `true` if no task is linked into the list.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

impl fmt::Debug for WaitListGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitListGuard")
            .field("list", &self.list)
            .finish_non_exhaustive()
    }
}

// === impl Waiter ===

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Waiter {
    /// Returns the [`Waker`] for the task that owns this `Waiter`.
    ///
    /// # Safety
    ///
    /// This is only safe to call while the list is locked. The `list`
    /// parameter ensures this method is only called while holding the lock, so
    /// this can be safe.
    #[inline(always)]
    fn wake(this: NonNull<Self>, list: &mut List<Self>, wakeup: Wakeup) -> Option<Waker> {
        Waiter::with_inner(this, list, |node| {
            let waker = mem::replace(&mut node.wakeup, wakeup);
            match waker {
                // the node has a registered waker, so wake the task.
                Wakeup::Waiting(waker) => Some(waker),
                // the node was already woken? this should not happen and
                // probably indicates a race!
                _ => unreachable!("tried to wake a waiter in the {:?} state!", waker),
            }
        })
    }

    /// # Safety
    ///
    /// This is only safe to call while the list is locked. The dummy `_list`
    /// parameter ensures this method is only called while holding the lock, so
    /// this can be safe.
    #[inline(always)]
    fn with_inner<T>(
        this: NonNull<Self>,
        _list: &mut List<Self>,
        f: impl FnOnce(&mut WaiterInner) -> T,
    ) -> T {
        // safety: this is only called while holding the lock on the list,
        // so it's safe to mutate the waiter.
        unsafe { f(&mut *(*this.as_ptr()).node.get()) }
    }

    fn poll_wait(mut self: Pin<&mut Self>, list: &WaitList, waker: &Waker) -> Poll<()> {
        // Safety: we never move out of `ptr` below, only mutate its fields
        let ptr = unsafe { NonNull::from(Pin::into_inner_unchecked(self.as_mut())) };
        let this = self.as_mut().project();

        match *this.state {
            WaitState::Start => {
                let mut waiters = list.waiters.lock();

                // the counter must be raised before the caller re-checks its condition.
                list.sleepies.0.fetch_add(1, Ordering::SeqCst);

                // safety: we may mutate the inner state because we are
                // holding the lock.
                unsafe {
                    let node = this.node.get();
                    debug_assert!(matches!((*node).wakeup, Wakeup::Empty));
                    (*node).wakeup = Wakeup::Waiting(waker.clone());
                }

                *this.state = WaitState::Waiting;
                waiters.push_front(ptr);

                Poll::Pending
            }
            WaitState::Waiting => {
                let _waiters = list.waiters.lock();
                // safety: we may mutate the inner state because we are
                // holding the lock.
                let node = unsafe { &mut *this.node.get() };
                match node.wakeup {
                    Wakeup::Waiting(ref mut curr_waker) => {
                        if !curr_waker.will_wake(waker) {
                            *curr_waker = waker.clone();
                        }
                        Poll::Pending
                    }
                    Wakeup::All | Wakeup::One => {
                        *this.state = WaitState::Woken;
                        Poll::Ready(())
                    }
                    Wakeup::Empty => unreachable!("enqueued waiter without a waker"),
                }
            }
            WaitState::Woken => Poll::Ready(()),
        }
    }

    /// Release this `Waiter` from the list.
    ///
    /// This is called from the `drop` implementation for the [`Wait`] future.
    fn release(mut self: Pin<&mut Self>, list: &WaitList) {
        let state = *(self.as_mut().project().state);
        // Safety: we never move out of `ptr` below, only mutate its fields
        let ptr = NonNull::from(unsafe { Pin::into_inner_unchecked(self) });

        // if we're not enqueued, we don't have to do anything else.
        if state != WaitState::Waiting {
            return;
        }

        let mut waiters = list.waiters.lock();

        let next_waiter = match Waiter::with_inner(ptr, &mut waiters, |node| {
            mem::replace(&mut node.wakeup, Wakeup::Empty)
        }) {
            // still linked, remove the node
            Wakeup::Waiting(_) => {
                // safety: we have the lock on the list and the node is linked into it.
                unsafe {
                    waiters.remove(ptr);
                }
                list.sleepies.0.fetch_sub(1, Ordering::SeqCst);
                None
            }
            // the node has an unconsumed wakeup, it must be assigned to the next
            // node in the list.
            Wakeup::One => list.wake_locked(&mut waiters),
            Wakeup::All | Wakeup::Empty => None,
        };

        drop(waiters);

        if let Some(next) = next_waiter {
            next.wake();
        }
    }
}

// Safety: `Waiter`s are pinned in their `Wait` futures and unlinked before those are dropped,
// `links` returns a pointer into the pinned node.
unsafe impl Linked<list::Links<Waiter>> for Waiter {
    type Handle = NonNull<Waiter>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<list::Links<Waiter>> {
        // Safety: ensured by caller
        unsafe {
            // Safety: using `ptr::addr_of!` avoids creating a temporary
            // reference, which stacked borrows dislikes.
            let node = &*ptr::addr_of!((*target.as_ptr()).node);
            let links = ptr::addr_of_mut!((*node.get()).links);
            // Safety: since the `target` pointer is `NonNull`, we can assume
            // that pointers to its members are also not null, making this use
            // of `new_unchecked` fine.
            NonNull::new_unchecked(links)
        }
    }
}

// Safety: a `Waiter` is only touched through the list lock or by the future owning it
unsafe impl Send for Waiter {}
// Safety: see above
unsafe impl Sync for Waiter {}

// === impl Wait ===

impl Future for Wait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.waiter.poll_wait(this.list, cx.waker())
    }
}

#[pinned_drop]
impl PinnedDrop for Wait<'_> {
    fn drop(mut self: Pin<&mut Self>) {
        let this = self.project();
        this.waiter.release(this.list);
    }
}

impl fmt::Debug for Wait<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait")
            .field("list", &self.list)
            .field("waiter", &self.waiter)
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready, task};
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn wakeup_one() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let list = Arc::new(WaitList::new());

        let mut task1 = task::spawn(list.wait());
        let mut task2 = task::spawn(list.wait());

        assert_pending!(task1.poll());
        assert_pending!(task2.poll());
        assert_eq!(list.sleepies(), 2);

        list.wakeup_one();
        assert_eq!(list.sleepies(), 1);
        assert!(task1.is_woken() ^ task2.is_woken(), "exactly one task is woken");

        list.wakeup_one();
        assert_eq!(list.sleepies(), 0);
        assert_ready!(task1.poll());
        assert_ready!(task2.poll());
    }

    #[test]
    fn wakeups_are_not_stored() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let list = WaitList::new();
        list.wakeup_one();
        list.wakeup_all();

        let mut task = task::spawn(list.wait());
        assert_pending!(task.poll());
        assert!(!task.is_woken());
    }

    #[test]
    fn wakeup_all_more_than_a_batch() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let list = WaitList::new();
        let mut tasks: Vec<_> = (0..100).map(|_| task::spawn(list.wait())).collect();

        for task in &mut tasks {
            assert_pending!(task.poll());
        }
        assert_eq!(list.sleepies(), 100);

        list.wakeup_all();
        assert_eq!(list.sleepies(), 0);

        for task in &mut tasks {
            assert!(task.is_woken());
            assert_ready!(task.poll());
        }
    }

    #[test]
    fn drop_unlinks() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let list = WaitList::new();
        let mut task = task::spawn(list.wait());
        assert_pending!(task.poll());
        assert_eq!(list.sleepies(), 1);

        drop(task);
        assert_eq!(list.sleepies(), 0);
        assert!(list.lock().is_empty());
    }

    #[test]
    fn dropped_wakeup_is_handed_on() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let list = WaitList::new();
        let mut first = task::spawn(list.wait());
        assert_pending!(first.poll());
        let mut second = task::spawn(list.wait());
        assert_pending!(second.poll());

        // waiters are popped from the back, the first one registered is woken first
        list.wakeup_one();
        assert!(first.is_woken());
        assert!(!second.is_woken());

        // the first waiter goes away without observing its wakeup
        drop(first);
        assert!(second.is_woken());
        assert_ready!(second.poll());
    }

    #[test]
    fn guard_wakeups() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let list = WaitList::new();
        let mut a = task::spawn(list.wait());
        let mut b = task::spawn(list.wait());
        assert_pending!(a.poll());
        assert_pending!(b.poll());

        {
            let mut guard = list.lock();
            assert!(!guard.is_empty());
            guard.wakeup_all();
            assert!(guard.is_empty());
        }

        assert_ready!(a.poll());
        assert_ready!(b.poll());
    }
}

#[cfg(all(test, loom))]
mod loom {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::sync::atomic::AtomicBool;
    use crate::loom::thread;

    #[test]
    fn no_lost_wakeup() {
        crate::loom::model(|| {
            let list = Arc::new(WaitList::new());
            let flag = Arc::new(AtomicBool::new(false));

            let t = thread::spawn({
                let list = list.clone();
                let flag = flag.clone();
                move || {
                    flag.store(true, Ordering::SeqCst);
                    list.wakeup_all();
                }
            });

            ::loom::future::block_on(async {
                loop {
                    let wait = list.wait();
                    let mut wait = core::pin::pin!(wait);
                    // register first, then re-check the flag
                    let registered = core::future::poll_fn(|cx| {
                        Poll::Ready(wait.as_mut().poll(cx).is_ready())
                    })
                    .await;
                    if registered || flag.load(Ordering::SeqCst) {
                        break;
                    }
                    wait.await;
                }
            });

            t.join().unwrap();
        });
    }
}
