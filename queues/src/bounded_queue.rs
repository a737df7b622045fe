//! Tsigas-Zhang Bounded Queue
//!
//! A lock-free MPMC FIFO queue over a fixed ring of slots, after Tsigas and
//! Zhang. Each slot holds a (payload, state) pair updated as one double-width
//! CAS; `head` and `tail` are plain indices moved by single-word CAS and
//! treated as hints: every operation re-finds the true boundary by walking
//! from its index, so a stale hint costs a few probes, never correctness.
//!
//! The slot state is two bits: an occupancy bit and an A/B phase bit that
//! flips on every transition. A slot revisited after a full wrap therefore
//! carries a different (payload, state) pair than any recently observed one,
//! which makes ABA on the slot CAS arbitrarily unlikely for reasonably large
//! capacities (larger is safer; >512 is a good floor when wraps are fast).
//!
//! The slot at `head` is the dummy: most recently consumed, kept empty so
//! consumers and producers never chase the same slot. One extra slot is
//! allocated so a queue of capacity `n` really admits `n` payloads.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use bitflags::bitflags;

use crate::tagged::{AtomicTaggedPtr, TaggedPtr};

/// First backoff pause for [`BoundedQueue::enqueue_with_backoff`], in
/// microseconds.
const BACKOFF_START_US: u64 = 2;

/// Backoff ceiling, in microseconds. Doubling stops here.
const BACKOFF_CAP_US: u64 = 128;

// ---------------------------------------------------------------------------
// Slot states
// ---------------------------------------------------------------------------

bitflags! {
    /// Two-bit slot state stored in the tag half of a slot.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct SlotState: u64 {
        /// A/B phase; flips on every transition of the slot.
        const PHASE = 0b01;
        /// Set while the slot holds a payload.
        const OCCUPIED = 0b10;
    }
}

impl SlotState {
    /// Empty, phase A. Initial state of the dummy slot.
    const NULL_A: Self = Self::empty();
    /// Empty, phase B. Initial state of every other slot.
    const NULL_B: Self = Self::PHASE;

    fn is_occupied(self) -> bool {
        self.contains(Self::OCCUPIED)
    }

    /// State an enqueue installs over this empty state: occupied, phase
    /// flipped.
    fn filled(self) -> Self {
        if self.contains(Self::PHASE) {
            Self::OCCUPIED
        } else {
            Self::OCCUPIED.union(Self::PHASE)
        }
    }

    /// State a dequeue leaves behind: empty, phase flipped.
    fn emptied(self) -> Self {
        if self.contains(Self::PHASE) {
            Self::empty()
        } else {
            Self::PHASE
        }
    }
}

fn state<T>(cell: TaggedPtr<T>) -> SlotState {
    SlotState::from_bits_truncate(cell.tag)
}

// ---------------------------------------------------------------------------
// Bounded queue
// ---------------------------------------------------------------------------

/// A bounded lock-free MPMC FIFO queue with a fixed capacity.
///
/// `enqueue` fails (returning the value back) only when the queue is
/// observed full; `dequeue` returns `None` only when observed empty.
/// Payloads are boxed on entry so a slot's data half is one machine word.
pub struct BoundedQueue<T> {
    slots: Box<[AtomicTaggedPtr<T>]>,
    /// Index of the dummy slot (most recently consumed).
    head: AtomicUsize,
    /// Index near the most recently filled slot. A hint, see module docs.
    tail: AtomicUsize,
    capacity: usize,
}

// SAFETY: all shared state is updated through atomics, and payloads move in
// and out whole; `T: Send` is all that crossing threads requires.
unsafe impl<T: Send> Send for BoundedQueue<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> BoundedQueue<T> {
    /// Create a queue admitting at most `capacity` values.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bounded queue capacity must be non-zero");
        let slots: Vec<AtomicTaggedPtr<T>> = (0..=capacity)
            .map(|i| {
                let init = if i == 0 {
                    SlotState::NULL_A
                } else {
                    SlotState::NULL_B
                };
                AtomicTaggedPtr::new(TaggedPtr::null(init.bits()))
            })
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(1),
            capacity,
        }
    }

    /// Append `value`, or return it back if the queue is observed full.
    ///
    /// Linearizes at the successful CAS2 on the installed slot.
    pub fn enqueue(&self, value: T) -> Result<(), T> {
        let node = Box::into_raw(Box::new(value));
        let ring = self.slots.len();

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let mut install = (tail + 1) % ring;
            let mut cell = self.slots[install].load(Ordering::Acquire);

            // Walk to the first empty slot past the occupied run.
            while state(cell).is_occupied() {
                if self.tail.load(Ordering::Acquire) != tail {
                    break;
                }
                if install == self.head.load(Ordering::Acquire) {
                    break;
                }
                install = (install + 1) % ring;
                cell = self.slots[install].load(Ordering::Acquire);
            }

            if self.tail.load(Ordering::Acquire) != tail {
                continue;
            }
            if state(cell).is_occupied() {
                // The walk ended on a stale snapshot of the dummy.
                continue;
            }

            let head = self.head.load(Ordering::Acquire);
            if install == head {
                // Wrapped onto the dummy slot. Full if the slot after head
                // still holds the oldest payload; otherwise a dequeue is
                // mid-flight, so help head along and retry.
                let after = (head + 1) % ring;
                if state(self.slots[after].load(Ordering::Acquire)).is_occupied() {
                    // SAFETY: the box was created above and never shared.
                    return Err(unsafe { *Box::from_raw(node) });
                }
                let _ = self
                    .head
                    .compare_exchange(head, after, Ordering::AcqRel, Ordering::Relaxed);
                continue;
            }

            if self.tail.load(Ordering::Acquire) != tail {
                continue;
            }

            let filled = TaggedPtr::new(node, state(cell).filled().bits());
            if self.slots[install].compare_exchange(cell, filled) {
                // Best effort: a racing operation fixes the hint otherwise.
                let _ = self
                    .tail
                    .compare_exchange(tail, install, Ordering::AcqRel, Ordering::Relaxed);
                return Ok(());
            }
        }
    }

    /// Repeatedly attempt [`enqueue`](Self::enqueue) with doubling backoff
    /// until it succeeds.
    ///
    /// Sleeps between attempts, starting at 2 µs and capped at 128 µs. Meant
    /// for producers that know consumers will drain the queue soon; with no
    /// consumer it never returns.
    pub fn enqueue_with_backoff(&self, value: T) {
        let mut value = value;
        let mut wait = BACKOFF_START_US;
        loop {
            match self.enqueue(value) {
                Ok(()) => return,
                Err(v) => value = v,
            }
            thread::sleep(Duration::from_micros(wait));
            wait = (wait * 2).min(BACKOFF_CAP_US);
        }
    }

    /// Remove and return the oldest value, or `None` if the queue is
    /// observed empty.
    ///
    /// Linearizes at the successful CAS2 emptying the slot.
    pub fn dequeue(&self) -> Option<T> {
        let ring = self.slots.len();

        loop {
            let head = self.head.load(Ordering::Acquire);
            let mut probe = (head + 1) % ring;
            let mut cell = self.slots[probe].load(Ordering::Acquire);

            // Walk past the empty run to the oldest payload.
            while !state(cell).is_occupied() {
                if self.head.load(Ordering::Acquire) != head {
                    break;
                }
                if probe == self.tail.load(Ordering::Acquire) {
                    return None;
                }
                probe = (probe + 1) % ring;
                cell = self.slots[probe].load(Ordering::Acquire);
            }

            if self.head.load(Ordering::Acquire) != head {
                continue;
            }

            // A tail hint sitting on this slot means its enqueue has not
            // finished; bump it along, then retry.
            if self
                .tail
                .compare_exchange(probe, (probe + 1) % ring, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                continue;
            }

            let emptied = TaggedPtr::null(state(cell).emptied().bits());
            if self.slots[probe].compare_exchange(cell, emptied) {
                let _ = self
                    .head
                    .compare_exchange(head, probe, Ordering::AcqRel, Ordering::Relaxed);
                // SAFETY: winning the CAS2 transferred the boxed payload to
                // this thread.
                return Some(unsafe { *Box::from_raw(cell.ptr) });
            }
        }
    }

    /// Maximum number of values the queue admits.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the queue is observed empty.
    pub fn is_empty(&self) -> bool {
        let ring = self.slots.len();
        let head = self.head.load(Ordering::Acquire);
        let mut probe = (head + 1) % ring;
        loop {
            if state(self.slots[probe].load(Ordering::Acquire)).is_occupied() {
                return false;
            }
            if probe == self.tail.load(Ordering::Acquire) {
                return true;
            }
            probe = (probe + 1) % ring;
        }
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let cell = slot.load(Ordering::Relaxed);
            if state(cell).is_occupied() && !cell.is_null() {
                // SAFETY: `&mut self` means no concurrent operations; every
                // occupied slot owns a boxed payload.
                drop(unsafe { Box::from_raw(cell.ptr) });
            }
        }
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_state_cycle() {
        // Filling flips the phase and sets occupancy; emptying flips again.
        assert_eq!(SlotState::NULL_B.filled(), SlotState::OCCUPIED);
        assert_eq!(
            SlotState::NULL_A.filled(),
            SlotState::OCCUPIED | SlotState::PHASE
        );
        assert_eq!(SlotState::OCCUPIED.emptied(), SlotState::NULL_B);
        assert_eq!(
            (SlotState::OCCUPIED | SlotState::PHASE).emptied(),
            SlotState::NULL_A
        );
    }

    #[test]
    #[should_panic(expected = "capacity must be non-zero")]
    fn test_zero_capacity_rejected() {
        let _ = BoundedQueue::<u32>::new(0);
    }

    #[test]
    fn test_capacity_three_fills_and_drains() {
        let q = BoundedQueue::new(3);
        assert_eq!(q.enqueue('A'), Ok(()));
        assert_eq!(q.enqueue('B'), Ok(()));
        assert_eq!(q.enqueue('C'), Ok(()));
        assert_eq!(q.enqueue('D'), Err('D'));
        assert_eq!(q.dequeue(), Some('A'));
        assert_eq!(q.enqueue('D'), Ok(()));
        assert_eq!(q.dequeue(), Some('B'));
        assert_eq!(q.dequeue(), Some('C'));
        assert_eq!(q.dequeue(), Some('D'));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_capacity_one_alternates() {
        let q = BoundedQueue::new(1);
        assert_eq!(q.capacity(), 1);
        for i in 0..10 {
            assert_eq!(q.enqueue(i), Ok(()));
            assert_eq!(q.enqueue(100 + i), Err(100 + i));
            assert_eq!(q.dequeue(), Some(i));
            assert_eq!(q.dequeue(), None);
        }
    }

    #[test]
    fn test_fresh_queue_is_empty() {
        let q = BoundedQueue::<u32>::new(8);
        assert!(q.is_empty());
        assert_eq!(q.dequeue(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_fifo_across_wraparound() {
        let q = BoundedQueue::new(4);
        for round in 0..8 {
            // Partially fill and drain so the indices wrap at varying
            // offsets.
            for i in 0..3 {
                assert_eq!(q.enqueue(round * 10 + i), Ok(()));
            }
            for i in 0..3 {
                assert_eq!(q.dequeue(), Some(round * 10 + i));
            }
        }
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_backoff_enqueue_succeeds_when_space() {
        let q = BoundedQueue::new(2);
        q.enqueue_with_backoff(1);
        q.enqueue_with_backoff(2);
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
    }

    #[test]
    fn test_drop_releases_queued_values() {
        use std::sync::Arc;

        let marker = Arc::new(());
        {
            let q = BoundedQueue::new(8);
            for _ in 0..5 {
                assert!(q.enqueue(marker.clone()).is_ok());
            }
            assert!(q.dequeue().is_some());
            assert_eq!(Arc::strong_count(&marker), 5);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
