//! Hazard Pointer Reclamation
//!
//! Freeing a linked-queue node right after unlinking it is unsound: a
//! concurrent reader that loaded the pointer a moment earlier may still
//! dereference it. Hazard pointers close that window. Before dereferencing a
//! shared pointer, a thread publishes it in one of its hazard slots; a node
//! is freed only once it is unlinked *and* no slot anywhere covers it.
//!
//! Layout:
//! - A global registry of per-thread records, each holding a small fixed
//!   array of hazard slots. Records are leaked and recycled when threads
//!   exit, so borrows stay `'static`.
//! - A thread-local retire list. `retire` defers the free; once the list
//!   reaches a threshold, a scan snapshots every published hazard and frees
//!   the retired nodes not covered by one.
//!
//! The protection protocol is publish, fence, re-validate the source
//! location, and only then dereference. Queue code is responsible for the
//! re-validation step; tag counters on the source make it exact.

use core::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::cell::RefCell;

use lazy_static::lazy_static;
use log::trace;
use spin::Mutex;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Hazard slots per thread: enough for the deepest chain a queue operation
/// protects at once (anchor, two leapfrog slots, commit slot).
pub(crate) const SLOTS_PER_THREAD: usize = 4;

/// Retired nodes accumulated locally before a reclamation scan runs.
const SCAN_THRESHOLD: usize = 64;

/// Sentinel value for an unused hazard slot.
const HP_EMPTY: usize = 0;

// ---------------------------------------------------------------------------
// Thread records and the global registry
// ---------------------------------------------------------------------------

struct ThreadRecord {
    hazards: [AtomicUsize; SLOTS_PER_THREAD],
    /// Whether a live thread owns this record. Cleared on thread exit so the
    /// record can be recycled.
    active: AtomicBool,
}

impl ThreadRecord {
    const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const INIT: AtomicUsize = AtomicUsize::new(HP_EMPTY);
        Self {
            hazards: [INIT; SLOTS_PER_THREAD],
            active: AtomicBool::new(true),
        }
    }
}

/// A node whose memory is waiting until no hazard slot covers it.
struct Retired {
    addr: usize,
    free: unsafe fn(usize),
}

struct Registry {
    /// Every record ever created. Records are leaked and recycled, never
    /// removed, so the `&'static` borrows handed to threads stay valid.
    records: Mutex<Vec<&'static ThreadRecord>>,
    /// Retire lists abandoned by exited threads, adopted by later scans.
    orphans: Mutex<Vec<Retired>>,
}

lazy_static! {
    static ref REGISTRY: Registry = Registry {
        records: Mutex::new(Vec::new()),
        orphans: Mutex::new(Vec::new()),
    };
}

/// Claim a recycled record, or leak a fresh one.
fn acquire_record() -> &'static ThreadRecord {
    let records = REGISTRY.records.lock();
    for record in records.iter() {
        if record
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return record;
        }
    }
    drop(records);

    let record: &'static ThreadRecord = Box::leak(Box::new(ThreadRecord::new()));
    REGISTRY.records.lock().push(record);
    record
}

// ---------------------------------------------------------------------------
// Per-thread state
// ---------------------------------------------------------------------------

struct LocalHazards {
    record: &'static ThreadRecord,
    retired: RefCell<Vec<Retired>>,
}

impl LocalHazards {
    fn new() -> Self {
        Self {
            record: acquire_record(),
            retired: RefCell::new(Vec::new()),
        }
    }
}

impl Drop for LocalHazards {
    fn drop(&mut self) {
        for slot in &self.record.hazards {
            slot.store(HP_EMPTY, Ordering::Release);
        }
        let mut retired = self.retired.borrow_mut();
        if !retired.is_empty() {
            // Hand leftovers to whichever thread scans next.
            REGISTRY.orphans.lock().append(&mut retired);
        }
        self.record.active.store(false, Ordering::Release);
    }
}

thread_local! {
    static LOCAL: LocalHazards = LocalHazards::new();
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

/// The calling thread's hazard slots, borrowed for the duration of one queue
/// operation. Every slot is cleared when the set is dropped.
pub(crate) struct HazardSet {
    record: &'static ThreadRecord,
}

impl HazardSet {
    pub(crate) fn for_current_thread() -> Self {
        Self {
            record: LOCAL.with(|local| local.record),
        }
    }

    /// Publish `ptr` in `slot` and fence so reclaimers see it before the
    /// caller dereferences. The caller must re-read the location `ptr` came
    /// from after this returns; only if it is unchanged may `ptr` be
    /// dereferenced.
    pub(crate) fn protect<T>(&self, slot: usize, ptr: *mut T) {
        self.record.hazards[slot].store(ptr as usize, Ordering::Release);
        fence(Ordering::SeqCst);
    }
}

impl Drop for HazardSet {
    fn drop(&mut self) {
        for slot in &self.record.hazards {
            slot.store(HP_EMPTY, Ordering::Release);
        }
    }
}

/// Retire a `Box`-allocated node: free it once no hazard slot covers it.
///
/// # Safety
///
/// `ptr` must come from `Box::into_raw` and must already be unlinked: no
/// thread without a published hazard on it can reach it. Ownership moves to
/// the reclaimer; the caller must not touch the node again.
pub(crate) unsafe fn retire<T>(ptr: *mut T) {
    unsafe fn free_boxed<T>(addr: usize) {
        // SAFETY: `addr` was produced by `Box::into_raw` with this same `T`
        // in `retire`, and a scan hands each retired node to `free` exactly
        // once.
        unsafe { drop(Box::from_raw(addr as *mut T)) };
    }

    LOCAL.with(|local| {
        let mut retired = local.retired.borrow_mut();
        retired.push(Retired {
            addr: ptr as usize,
            free: free_boxed::<T>,
        });
        if retired.len() >= SCAN_THRESHOLD {
            scan(&mut retired);
        }
    });
}

/// Free every retired node not covered by a published hazard.
fn scan(retired: &mut Vec<Retired>) {
    // Adopt orphans from exited threads when the list is uncontended.
    if let Some(mut orphans) = REGISTRY.orphans.try_lock() {
        retired.append(&mut orphans);
    }

    // A contended registry means another thread is registering or scanning;
    // defer to a later scan rather than spin.
    let Some(records) = REGISTRY.records.try_lock() else {
        return;
    };

    // Order the hazard reads after the unlinks that retired these nodes.
    fence(Ordering::SeqCst);

    let mut protected: Vec<usize> = Vec::with_capacity(records.len() * SLOTS_PER_THREAD);
    for record in records.iter() {
        for slot in &record.hazards {
            let addr = slot.load(Ordering::Acquire);
            if addr != HP_EMPTY {
                protected.push(addr);
            }
        }
    }
    drop(records);
    protected.sort_unstable();

    let before = retired.len();
    retired.retain(|node| {
        if protected.binary_search(&node.addr).is_ok() {
            true
        } else {
            // SAFETY: the node is unlinked (retire contract) and no hazard
            // covers it, so no thread can reach it anymore.
            unsafe { (node.free)(node.addr) };
            false
        }
    });
    trace!(
        "hazard scan reclaimed {} of {} retired nodes",
        before - retired.len(),
        before
    );
}

// ---------------------------------------------------------------------------
// Test hooks
// ---------------------------------------------------------------------------

/// Number of published (non-empty) hazard slots across all records.
#[cfg(test)]
fn active_hazards() -> usize {
    let records = REGISTRY.records.lock();
    records
        .iter()
        .flat_map(|record| record.hazards.iter())
        .filter(|slot| slot.load(Ordering::Acquire) != HP_EMPTY)
        .count()
}

/// Run a scan over the calling thread's retire list immediately.
#[cfg(test)]
fn flush_retired() {
    LOCAL.with(|local| scan(&mut local.retired.borrow_mut()));
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    struct CountsDrop(Arc<AtomicUsize>);

    impl Drop for CountsDrop {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_unprotected_nodes_are_reclaimed() {
        let drops = Arc::new(AtomicUsize::new(0));
        for _ in 0..SCAN_THRESHOLD {
            let node = Box::into_raw(Box::new(CountsDrop(drops.clone())));
            // SAFETY: freshly allocated and never shared, so trivially
            // unreachable by other threads.
            unsafe { retire(node) };
        }
        // The threshold scan runs inside the final retire; nothing was
        // protected, so every node must be gone.
        assert_eq!(drops.load(Ordering::SeqCst), SCAN_THRESHOLD);
    }

    #[test]
    fn test_protected_node_survives_scan() {
        let drops = Arc::new(AtomicUsize::new(0));
        let node = Box::into_raw(Box::new(CountsDrop(drops.clone())));

        let hazards = HazardSet::for_current_thread();
        hazards.protect(0, node);

        // SAFETY: `node` is unshared; the only reference is the hazard we
        // just published ourselves.
        unsafe { retire(node) };
        flush_retired();
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(hazards);
        flush_retired();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hazard_set_clears_slots_on_drop() {
        let mut x = 0u8;
        {
            let hazards = HazardSet::for_current_thread();
            hazards.protect(0, &mut x as *mut u8);
            hazards.protect(1, &mut x as *mut u8);
            assert!(active_hazards() >= 2);
        }
        // Other test threads may hold hazards concurrently, so only check
        // that this thread's slots went away.
        let leftover = LOCAL.with(|local| {
            local
                .record
                .hazards
                .iter()
                .filter(|slot| slot.load(Ordering::Acquire) != HP_EMPTY)
                .count()
        });
        assert_eq!(leftover, 0);
    }
}
