//! Michael-Scott Unbounded Queue
//!
//! A lock-free multi-producer, multi-consumer FIFO queue built as a
//! singly-linked list with a sentinel node, after Michael and Scott:
//! - Enqueue: single-word CAS links the new node at `tail.next`, then a
//!   best-effort CAS2 swings `tail` forward.
//! - Dequeue: CAS2 swings `head` to the first live node, which becomes the
//!   new sentinel; the old sentinel is retired.
//! - A thread that observes `tail` lagging helps it forward; this is what
//!   keeps the queue lock-free and must stay.
//!
//! `head` and `tail` are tagged references whose counters increase on every
//! swing (ABA defense); unlinked sentinels go through the hazard-pointer
//! reclaimer instead of being freed in place.

use core::cell::UnsafeCell;
use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::hazard::{self, HazardSet};
use crate::tagged::{AtomicTaggedPtr, TaggedPtr};

// ---------------------------------------------------------------------------
// Queue node
// ---------------------------------------------------------------------------

struct Node<T> {
    /// The payload. `None` for the sentinel, and for any node whose payload
    /// has been handed out by a dequeue.
    value: UnsafeCell<Option<T>>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn new(value: T) -> *mut Self {
        Box::into_raw(Box::new(Self {
            value: UnsafeCell::new(Some(value)),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    fn sentinel() -> *mut Self {
        Box::into_raw(Box::new(Self {
            value: UnsafeCell::new(None),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

// ---------------------------------------------------------------------------
// Michael-Scott queue
// ---------------------------------------------------------------------------

/// An unbounded lock-free MPMC FIFO queue.
///
/// `head` points at the sentinel (most recently consumed node); the first
/// live payload sits at `head.next`. `tail` points at the last node or lags
/// it by one while an enqueue is mid-flight.
pub struct MsQueue<T> {
    head: AtomicTaggedPtr<Node<T>>,
    tail: AtomicTaggedPtr<Node<T>>,
    /// Element count for diagnostics. Updated relaxed, so only approximate
    /// under contention.
    len: AtomicUsize,
}

// SAFETY: all shared state is updated through atomics, and payloads move in
// and out whole; `T: Send` is all that crossing threads requires.
unsafe impl<T: Send> Send for MsQueue<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for MsQueue<T> {}

impl<T> MsQueue<T> {
    /// Create an empty queue. Head and tail start on a shared sentinel so
    /// neither is ever null.
    pub fn new() -> Self {
        let sentinel = Node::<T>::sentinel();
        Self {
            head: AtomicTaggedPtr::new(TaggedPtr::new(sentinel, 0)),
            tail: AtomicTaggedPtr::new(TaggedPtr::new(sentinel, 0)),
            len: AtomicUsize::new(0),
        }
    }

    /// Append `value` to the queue.
    ///
    /// Lock-free; retries only when another producer won the same link.
    /// Linearizes at the successful CAS on `tail.next`.
    pub fn enqueue(&self, value: T) {
        let node = Node::new(value);
        let hazards = HazardSet::for_current_thread();

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            hazards.protect(0, tail.ptr);
            if self.tail.load(Ordering::Acquire) != tail {
                continue;
            }
            // SAFETY: tail.ptr is protected and the re-read above confirmed
            // the queue still holds it, so it cannot have been reclaimed.
            let next = unsafe { (*tail.ptr).next.load(Ordering::Acquire) };

            if next.is_null() {
                // Tail is the real last node; try to link behind it.
                // SAFETY: as above, tail.ptr is protected and validated.
                if unsafe {
                    (*tail.ptr)
                        .next
                        .compare_exchange(
                            ptr::null_mut(),
                            node,
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                } {
                    // Best effort: a racing operation fixes tail if this
                    // fails.
                    let _ = self
                        .tail
                        .compare_exchange(tail, TaggedPtr::new(node, tail.tag + 1));
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            } else {
                // Tail lags; help it forward and retry.
                let _ = self
                    .tail
                    .compare_exchange(tail, TaggedPtr::new(next, tail.tag + 1));
            }
        }
    }

    /// Remove and return the oldest value, or `None` if the queue is
    /// observed empty.
    ///
    /// Linearizes at the successful CAS2 on `head`; emptiness is reported
    /// only from a validated snapshot with `head == tail` and no next node.
    pub fn dequeue(&self) -> Option<T> {
        let hazards = HazardSet::for_current_thread();

        loop {
            let head = self.head.load(Ordering::Acquire);
            hazards.protect(0, head.ptr);
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }
            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: head.ptr is protected and validated above.
            let next = unsafe { (*head.ptr).next.load(Ordering::Acquire) };
            hazards.protect(1, next);
            // Re-validate so `next` cannot already sit in a retire list: the
            // tagged head moves before its successor is ever retired.
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }

            if head.ptr == tail.ptr {
                if next.is_null() {
                    return None;
                }
                // Tail lags behind a half-finished enqueue; help it.
                let _ = self
                    .tail
                    .compare_exchange(tail, TaggedPtr::new(next, tail.tag + 1));
                continue;
            }

            if next.is_null() {
                // Inconsistent snapshot (head moved under us); retry.
                continue;
            }

            if self
                .head
                .compare_exchange(head, TaggedPtr::new(next, head.tag + 1))
            {
                // SAFETY: winning the CAS makes `next` the new sentinel and
                // gives this thread exclusive claim to its payload; the
                // hazard published on `next` keeps the node alive.
                let value = unsafe { (*(*next).value.get()).take() };
                self.len.fetch_sub(1, Ordering::Relaxed);
                // SAFETY: the old sentinel is unlinked; only threads that
                // already published a hazard can still see it.
                unsafe { hazard::retire(head.ptr) };
                return value;
            }
        }
    }

    /// Whether the queue is observed empty.
    pub fn is_empty(&self) -> bool {
        let hazards = HazardSet::for_current_thread();
        loop {
            let head = self.head.load(Ordering::Acquire);
            hazards.protect(0, head.ptr);
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }
            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: head.ptr is protected and validated above.
            let next = unsafe { (*head.ptr).next.load(Ordering::Acquire) };
            return head.ptr == tail.ptr && next.is_null();
        }
    }

    /// Approximate number of elements.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

impl<T> Default for MsQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for MsQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: walk the list and free every node, dropping any
        // payloads still queued.
        let mut node = self.head.load(Ordering::Relaxed).ptr;
        while !node.is_null() {
            // SAFETY: `&mut self` means no concurrent operations; every node
            // in the list came from `Box::into_raw`.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Relaxed);
        }
    }
}

impl<T> fmt::Debug for MsQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_fifo() {
        let q = MsQueue::new();
        q.enqueue(10);
        q.enqueue(20);
        q.enqueue(30);
        assert_eq!(q.dequeue(), Some(10));
        assert_eq!(q.dequeue(), Some(20));
        assert_eq!(q.dequeue(), Some(30));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_fresh_queue_is_empty() {
        let q = MsQueue::<u32>::new();
        assert!(q.is_empty());
        assert_eq!(q.dequeue(), None);
        // Still empty after the failed dequeue.
        assert!(q.is_empty());
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_len_tracks_sequential_use() {
        let q = MsQueue::new();
        assert_eq!(q.len(), 0);
        q.enqueue(1);
        q.enqueue(2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.len(), 1);
        assert!(!q.is_empty());
    }

    #[test]
    fn test_interleaved_enqueue_dequeue() {
        let q = MsQueue::new();
        q.enqueue(1);
        assert_eq!(q.dequeue(), Some(1));
        q.enqueue(2);
        q.enqueue(3);
        assert_eq!(q.dequeue(), Some(2));
        q.enqueue(4);
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.dequeue(), Some(4));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_drop_releases_queued_values() {
        use std::sync::Arc;

        let marker = Arc::new(());
        {
            let q = MsQueue::new();
            for _ in 0..10 {
                q.enqueue(marker.clone());
            }
            assert_eq!(Arc::strong_count(&marker), 11);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
