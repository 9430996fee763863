// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fixed-capacity, single-producer multi-consumer ring of ready tasks.
//!
//! The owning consumer pushes to and pops from the queue, every other consumer may *steal* a
//! batch of entries from it. Stealing claims a range of slots with a CAS on the head index and
//! copies them out before releasing the range, so the owner never reuses a slot that is still
//! being read.

use core::fmt;
use core::mem::MaybeUninit;

use arrayvec::ArrayVec;

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[cfg(not(loom))]
pub const LOCAL_QUEUE_SIZE: usize = 256;
// keep the state space small enough for loom
#[cfg(loom)]
pub const LOCAL_QUEUE_SIZE: usize = 4;

const MASK: usize = LOCAL_QUEUE_SIZE - 1;
#[expect(clippy::cast_possible_truncation, reason = "the queue size is tiny")]
const CAPACITY: u32 = LOCAL_QUEUE_SIZE as u32;

static_assertions::const_assert!(LOCAL_QUEUE_SIZE.is_power_of_two());

pub(crate) struct LocalQueue<T> {
    /// Two `u32` indices. The low half is the "real" head of the queue, the high half is the
    /// first entry a stealer is currently copying out. Both are equal while nobody steals.
    ///
    /// The indices are wider than needed to index the buffer, wrapping is harmless and
    /// distinguishes a full from an empty queue.
    head: AtomicU64,
    /// Only written by the owner, read by everybody.
    tail: AtomicU32,
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Safety: entries are moved between threads, access to the slots is coordinated through the
// head and tail indices
unsafe impl<T: Send> Send for LocalQueue<T> {}
// Safety: see above
unsafe impl<T: Send> Sync for LocalQueue<T> {}

impl<T> LocalQueue<T> {
    pub(crate) fn new() -> Self {
        let buffer = (0..LOCAL_QUEUE_SIZE)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        Self {
            head: AtomicU64::new(0),
            tail: AtomicU32::new(0),
            buffer,
        }
    }

    /// Number of entries that are available to pop or steal.
    pub(crate) fn len(&self) -> usize {
        let (_, real) = unpack(self.head.load(Ordering::Acquire));
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(real) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push an entry to the back of the queue, handing it back if the queue is full.
    ///
    /// # Safety
    ///
    /// Must only be called by the owner of the queue, i.e. never concurrently with
    /// [`try_pop`](Self::try_pop) or another `try_push`.
    pub(crate) unsafe fn try_push(&self, value: T) -> Result<(), T> {
        let (steal, _) = unpack(self.head.load(Ordering::Acquire));
        // only the owner writes `tail`
        let tail = self.tail.load(Ordering::Relaxed);

        if tail.wrapping_sub(steal) >= CAPACITY {
            // full, or a stealer still copies entries out
            return Err(value);
        }

        let idx = tail as usize & MASK;
        self.buffer[idx].with_mut(|slot| {
            // Safety: the capacity check above ensures no consumer looks at this slot
            unsafe { (*slot).write(value) };
        });

        // make the entry available, synchronizes with the loads in `try_pop` and `steal_into`
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Pop the entry at the front of the queue.
    ///
    /// # Safety
    ///
    /// Must only be called by the owner of the queue, see [`try_push`](Self::try_push).
    pub(crate) unsafe fn try_pop(&self) -> Option<T> {
        let mut head = self.head.load(Ordering::Acquire);

        let idx = loop {
            let (steal, real) = unpack(head);
            let tail = self.tail.load(Ordering::Relaxed);

            if real == tail {
                return None;
            }

            let next_real = real.wrapping_add(1);

            // If `steal == real` there are no concurrent stealers, both are advanced.
            let next = if steal == real {
                pack(next_real, next_real)
            } else {
                assert_ne!(steal, next_real);
                pack(steal, next_real)
            };

            match self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break real as usize & MASK,
                Err(actual) => head = actual,
            }
        };

        // Safety: the CAS above handed us exclusive ownership of the entry in this slot
        Some(self.buffer[idx].with(|slot| unsafe { (*slot).assume_init_read() }))
    }

    /// Steal half of the entries (at most `N`) from this queue into `dst`, returning the number
    /// of stolen entries.
    ///
    /// Returns `0` if the queue is empty or another consumer is stealing from it right now.
    pub(crate) fn steal_into<const N: usize>(&self, dst: &mut ArrayVec<T, N>) -> usize {
        let room = u32::try_from(dst.remaining_capacity()).unwrap_or(u32::MAX);
        let mut prev = self.head.load(Ordering::Acquire);

        let (first, n) = loop {
            let (steal, real) = unpack(prev);
            let tail = self.tail.load(Ordering::Acquire);

            // another consumer is stealing
            if steal != real {
                return 0;
            }

            let available = tail.wrapping_sub(real);
            let n = (available - available / 2).min(room);
            if n == 0 {
                return 0;
            }

            // Claim the entries by advancing the real head but not the steal index. Until the
            // steal index catches up nobody else may steal and the owner won't reuse the slots.
            let next = pack(steal, real.wrapping_add(n));
            match self
                .head
                .compare_exchange(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    prev = next;
                    break (real, n);
                }
                Err(actual) => prev = actual,
            }
        };

        for i in 0..n {
            let idx = first.wrapping_add(i) as usize & MASK;
            // Safety: we claimed these slots with the CAS above
            let value = self.buffer[idx].with(|slot| unsafe { (*slot).assume_init_read() });
            dst.push(value);
        }

        // Release the slots by moving the steal index up to the real head. The owner may have
        // popped in the meantime so this is a CAS loop.
        loop {
            let (_, real) = unpack(prev);
            match self.head.compare_exchange(
                prev,
                pack(real, real),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => {
                    let (steal, real) = unpack(actual);
                    assert_ne!(steal, real);
                    prev = actual;
                }
            }
        }

        n as usize
    }
}

impl<T> Drop for LocalQueue<T> {
    fn drop(&mut self) {
        // Safety: `&mut self` makes us the only user of the queue
        while let Some(value) = unsafe { self.try_pop() } {
            drop(value);
        }
    }
}

impl<T> fmt::Debug for LocalQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (steal, real) = unpack(self.head.load(Ordering::Relaxed));
        f.debug_struct("LocalQueue")
            .field("head.steal", &steal)
            .field("head.real", &real)
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Split the head value into the index a stealer is working on and the real head.
#[expect(clippy::cast_possible_truncation, reason = "intentional split into halves")]
fn unpack(n: u64) -> (u32, u32) {
    let real = n as u32;
    let steal = (n >> u32::BITS) as u32;
    (steal, real)
}

/// Join the two head values.
fn pack(steal: u32, real: u32) -> u64 {
    u64::from(real) | (u64::from(steal) << u32::BITS)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[test]
    fn push_pop_fifo() {
        let queue = LocalQueue::new();
        // Safety: single-threaded test, we are the owner
        unsafe {
            for i in 0..10 {
                queue.try_push(i).unwrap();
            }
            assert_eq!(queue.len(), 10);
            for i in 0..10 {
                assert_eq!(queue.try_pop(), Some(i));
            }
            assert_eq!(queue.try_pop(), None);
        }
    }

    #[test]
    fn overflow_hands_the_value_back() {
        let queue = LocalQueue::new();
        // Safety: single-threaded test, we are the owner
        unsafe {
            for i in 0..LOCAL_QUEUE_SIZE {
                queue.try_push(i).unwrap();
            }
            assert_eq!(queue.try_push(usize::MAX), Err(usize::MAX));
            assert_eq!(queue.try_pop(), Some(0));
            queue.try_push(usize::MAX).unwrap();
        }
    }

    #[test]
    fn steal_takes_half_bounded_by_the_buffer() {
        let queue = LocalQueue::new();
        // Safety: single-threaded test, we are the owner
        unsafe {
            for i in 0..100 {
                queue.try_push(i).unwrap();
            }
        }

        let mut buf = ArrayVec::<_, 32>::new();
        assert_eq!(queue.steal_into(&mut buf), 32);
        assert_eq!(buf.as_slice(), (0..32).collect::<Vec<_>>().as_slice());
        assert_eq!(queue.len(), 68);

        let mut buf = ArrayVec::<_, 64>::new();
        assert_eq!(queue.steal_into(&mut buf), 34);
        assert_eq!(buf[0], 32);
    }

    #[test]
    fn drop_releases_entries() {
        let value = std::sync::Arc::new(());
        let queue = LocalQueue::new();
        // Safety: single-threaded test, we are the owner
        unsafe {
            queue.try_push(value.clone()).unwrap();
            queue.try_push(value.clone()).unwrap();
        }
        assert_eq!(std::sync::Arc::strong_count(&value), 3);
        drop(queue);
        assert_eq!(std::sync::Arc::strong_count(&value), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push,
        Pop,
        Steal,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![3 => Just(Op::Push), 2 => Just(Op::Pop), 1 => Just(Op::Steal)]
    }

    proptest! {
        #[test]
        fn behaves_like_a_deque(ops in proptest::collection::vec(op(), 0..1024)) {
            let queue = LocalQueue::new();
            let mut model = VecDeque::new();
            let mut next = 0_u32;

            for op in ops {
                match op {
                    Op::Push => {
                        // Safety: single-threaded test, we are the owner
                        let res = unsafe { queue.try_push(next) };
                        if model.len() < LOCAL_QUEUE_SIZE {
                            prop_assert_eq!(res, Ok(()));
                            model.push_back(next);
                        } else {
                            prop_assert_eq!(res, Err(next));
                        }
                        next += 1;
                    }
                    Op::Pop => {
                        // Safety: single-threaded test, we are the owner
                        prop_assert_eq!(unsafe { queue.try_pop() }, model.pop_front());
                    }
                    Op::Steal => {
                        let mut buf = ArrayVec::<_, 32>::new();
                        let n = queue.steal_into(&mut buf);
                        let expected = (model.len() - model.len() / 2).min(32);
                        prop_assert_eq!(n, expected);
                        for value in buf {
                            prop_assert_eq!(Some(value), model.pop_front());
                        }
                    }
                }
                prop_assert_eq!(queue.len(), model.len());
            }
        }
    }
}
