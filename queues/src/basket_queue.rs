//! Baskets Unbounded Queue
//!
//! A lock-free MPMC FIFO queue after Hoffman, Shalev and Shavit. The
//! structure is the same sentinel-headed linked list as the Michael-Scott
//! queue, with one twist: producers that lose the race to link behind the
//! observed tail do not restart from scratch. While the winner's link still
//! carries the same tag class, losers insert themselves *in front of* the
//! winner, forming a "basket" of contemporaneous cells with no prescribed
//! order among them. Under heavy producer contention this turns CAS failures
//! into progress instead of retries.
//!
//! Dequeues mark a cell's incoming link as deleted (logical removal) and
//! walk past up to `MAX_HOPS` deleted cells before physically unlinking the
//! whole prefix with a single CAS2 on `head`. Unlinked cells go through the
//! hazard-pointer reclaimer.

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::Ordering;
use std::thread;

use log::debug;

use crate::hazard::{self, HazardSet};
use crate::tagged::{AtomicTaggedPtr, TaggedPtr};

/// Deleted cells a dequeue walks past before it unlinks the prefix.
const MAX_HOPS: usize = 3;

// ---------------------------------------------------------------------------
// Link tags
// ---------------------------------------------------------------------------

const DELETED_BIT: u64 = 1 << 63;

/// The tag half of a next-link: a 63-bit counter plus a deleted flag.
/// Counter arithmetic never touches the flag.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct LinkTag {
    counter: u64,
    deleted: bool,
}

impl LinkTag {
    fn new(counter: u64, deleted: bool) -> Self {
        Self {
            counter: counter & !DELETED_BIT,
            deleted,
        }
    }

    fn pack(self) -> u64 {
        if self.deleted {
            self.counter | DELETED_BIT
        } else {
            self.counter
        }
    }

    fn unpack(raw: u64) -> Self {
        Self {
            counter: raw & !DELETED_BIT,
            deleted: raw & DELETED_BIT != 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue node
// ---------------------------------------------------------------------------

struct Node<T> {
    /// `None` for the sentinel and for cells whose payload was handed out.
    value: UnsafeCell<Option<T>>,
    /// Tagged link: the deleted flag here marks the *successor* cell as
    /// logically removed.
    next: AtomicTaggedPtr<Node<T>>,
}

impl<T> Node<T> {
    fn new(value: T) -> *mut Self {
        Box::into_raw(Box::new(Self {
            value: UnsafeCell::new(Some(value)),
            next: AtomicTaggedPtr::new(TaggedPtr::null(0)),
        }))
    }

    fn sentinel() -> *mut Self {
        Box::into_raw(Box::new(Self {
            value: UnsafeCell::new(None),
            next: AtomicTaggedPtr::new(TaggedPtr::null(0)),
        }))
    }
}

// ---------------------------------------------------------------------------
// Baskets queue
// ---------------------------------------------------------------------------

/// An unbounded lock-free MPMC FIFO queue tuned for high producer
/// concurrency.
///
/// FIFO holds per insertion point: cells that entered the same basket
/// commute, everything else keeps order.
pub struct BasketQueue<T> {
    head: AtomicTaggedPtr<Node<T>>,
    tail: AtomicTaggedPtr<Node<T>>,
}

// SAFETY: all shared state is updated through atomics, and payloads move in
// and out whole; `T: Send` is all that crossing threads requires.
unsafe impl<T: Send> Send for BasketQueue<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for BasketQueue<T> {}

impl<T> BasketQueue<T> {
    /// Create an empty queue with a shared sentinel cell.
    pub fn new() -> Self {
        let sentinel = Node::<T>::sentinel();
        Self {
            head: AtomicTaggedPtr::new(TaggedPtr::new(sentinel, 0)),
            tail: AtomicTaggedPtr::new(TaggedPtr::new(sentinel, 0)),
        }
    }

    /// Append `value` to the queue.
    ///
    /// A producer that loses the install race keeps retrying inside the same
    /// basket (yielding between attempts) for as long as the winner's tag
    /// class lasts, then restarts from a fresh tail snapshot.
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
            // the queue still holds it.
            let next = unsafe { (*tail.ptr).next.load(Ordering::Acquire) };

            if next.is_null() {
                // Open a new basket behind the tail. The node's own link is
                // pre-seeded one counter class past its incoming link.
                // SAFETY: node is unshared until the install below succeeds.
                unsafe {
                    (*node).next.store(
                        TaggedPtr::null(LinkTag::new(tail.tag + 2, false).pack()),
                        Ordering::Relaxed,
                    );
                }
                let link = TaggedPtr::new(node, LinkTag::new(tail.tag + 1, false).pack());
                // SAFETY: tail.ptr is protected and validated above.
                if unsafe { (*tail.ptr).next.compare_exchange(next, link) } {
                    let _ = self
                        .tail
                        .compare_exchange(tail, TaggedPtr::new(node, tail.tag + 1));
                    return;
                }

                // Lost the install: another producer opened the basket.
                // Slip in front of it while the tag class holds. The tail
                // snapshot is deliberately not re-read here; a stale class
                // confines the retry to this basket.
                loop {
                    // SAFETY: tail.ptr is still protected; a cell is never
                    // reclaimed while a hazard covers it, and the CAS below
                    // cannot succeed against an unlinked cell because its
                    // link tag is deleted by then.
                    let next = unsafe { (*tail.ptr).next.load(Ordering::Acquire) };
                    let tag = LinkTag::unpack(next.tag);
                    if tag.counter != tail.tag + 1 || tag.deleted {
                        break;
                    }
                    thread::yield_now();
                    // SAFETY: node is still exclusively ours.
                    unsafe { (*node).next.store(next, Ordering::Relaxed) };
                    let link = TaggedPtr::new(node, LinkTag::new(tail.tag + 1, false).pack());
                    // SAFETY: as above.
                    if unsafe { (*tail.ptr).next.compare_exchange(next, link) } {
                        return;
                    }
                }
            } else {
                // Tail lags; drag it to the last reachable cell and retry.
                self.advance_tail(&hazards, tail, next);
            }
        }
    }

    /// Remove and return the oldest live value, or `None` if the queue is
    /// observed empty.
    pub fn dequeue(&self) -> Option<T> {
        let hazards = HazardSet::for_current_thread();

        'restart: loop {
            let head = self.head.load(Ordering::Acquire);
            hazards.protect(0, head.ptr);
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }
            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: head.ptr is protected and validated above.
            let mut next = unsafe { (*head.ptr).next.load(Ordering::Acquire) };

            if head.ptr == tail.ptr {
                if next.is_null() {
                    return None;
                }
                // Tail lags behind half-finished enqueues; help and retry.
                self.advance_tail(&hazards, tail, next);
                continue;
            }

            // Hop over the deleted prefix.
            let mut iter = head;
            let mut hops = 0usize;
            let mut slot = 1;
            while LinkTag::unpack(next.tag).deleted && iter.ptr != tail.ptr {
                hazards.protect(slot, next.ptr);
                if self.head.load(Ordering::Acquire) != head {
                    continue 'restart;
                }
                iter = next;
                // SAFETY: iter.ptr is protected in `slot` and head was
                // re-validated after the protect, so the prefix is intact.
                next = unsafe { (*iter.ptr).next.load(Ordering::Acquire) };
                hops += 1;
                slot = 3 - slot;
            }

            if self.head.load(Ordering::Acquire) != head {
                continue;
            }

            if iter.ptr == tail.ptr {
                // Everything from head to tail is deleted; unlink it all.
                self.free_chain(head, iter);
                continue;
            }

            // `next` is the first live cell; protect it before committing.
            hazards.protect(3, next.ptr);
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }
            let tag = LinkTag::unpack(next.tag);
            let marked = TaggedPtr::new(next.ptr, LinkTag::new(tag.counter + 1, true).pack());
            // SAFETY: iter.ptr is protected (slot 0 while it is the head,
            // the walk slot afterwards); the mark changes only the tag.
            if unsafe { (*iter.ptr).next.compare_exchange(next, marked) } {
                // SAFETY: winning the mark gives exclusive claim to the
                // payload; the hazard on next.ptr keeps the cell alive.
                let value = unsafe { (*(*next.ptr).value.get()).take() };
                if hops >= MAX_HOPS {
                    self.free_chain(head, next);
                }
                return value;
            }
            thread::yield_now();
        }
    }

    /// Whether the queue is observed structurally empty.
    ///
    /// Deleted cells awaiting physical unlinking count as structure, so this
    /// can briefly report non-empty right after the last value was consumed;
    /// a `dequeue` in that window still returns `None`.
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

    /// Walk from `first` (the link out of `tail.ptr`) to the last reachable
    /// cell and swing `tail` onto it. Best effort: the CAS fails harmlessly
    /// if tail moved meanwhile.
    fn advance_tail(
        &self,
        hazards: &HazardSet,
        tail: TaggedPtr<Node<T>>,
        first: TaggedPtr<Node<T>>,
    ) {
        let mut last = first;
        let mut slot = 1;
        loop {
            hazards.protect(slot, last.ptr);
            if self.tail.load(Ordering::Acquire) != tail {
                break;
            }
            // SAFETY: last.ptr is protected, and re-validating the tagged
            // tail pins the suffix: cells past an unchanged tail are never
            // unlinked.
            let next = unsafe { (*last.ptr).next.load(Ordering::Acquire) };
            if next.is_null() {
                break;
            }
            last = next;
            slot = 3 - slot;
        }
        let _ = self
            .tail
            .compare_exchange(tail, TaggedPtr::new(last.ptr, tail.tag + 1));
    }

    /// Physically unlink the deleted prefix `[head, new_head)` with one CAS2
    /// on `head`, then retire every unlinked cell.
    fn free_chain(&self, head: TaggedPtr<Node<T>>, new_head: TaggedPtr<Node<T>>) {
        if self
            .head
            .compare_exchange(head, TaggedPtr::new(new_head.ptr, head.tag + 1))
        {
            let mut cur = head.ptr;
            let mut unlinked = 0usize;
            while cur != new_head.ptr {
                // SAFETY: the CAS above unlinked the chain; it is ours to
                // tear down, and readers that still see a cell hold hazards
                // the reclaimer honors.
                let next = unsafe { (*cur).next.load(Ordering::Acquire) }.ptr;
                // SAFETY: as above; `cur` came from `Box::into_raw`.
                unsafe { hazard::retire(cur) };
                cur = next;
                unlinked += 1;
            }
            debug!("unlinked a deleted chain of {unlinked} cells");
        }
    }
}

impl<T> Default for BasketQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for BasketQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: free the remaining chain, dropping any payloads
        // that were never dequeued.
        let mut node = self.head.load(Ordering::Relaxed).ptr;
        while !node.is_null() {
            // SAFETY: `&mut self` means no concurrent operations; every cell
            // came from `Box::into_raw`.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next.load(Ordering::Relaxed).ptr;
        }
    }
}

impl<T> fmt::Debug for BasketQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasketQueue")
            .field("is_empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}
