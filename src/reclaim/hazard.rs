//! Hazard-pointer reclamation.
//!
//! Used by code paths that cannot bound their read window between
//! quiescent points -- in this crate, [`crate::hp_stack`]'s external
//! lock-free stack.
//!
//! Each thread owns [`STATIC_HAZ_PER_THREAD`] fixed "currently
//! accessing" slots plus a dynamically-registered extension. A thread
//! that wants to free `p` scans every thread's slots; if none holds
//! `p` the pointer is released immediately, otherwise it is kept on
//! the thread's own pending list and retried on the next
//! `retire`/`defer_free` call.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Fixed hazard slots per thread, mirroring `STATIC_HAZ_PER_THREAD`.
pub const STATIC_HAZ_PER_THREAD: usize = 4;

/// Pending frees accumulate until this many are queued before a scan
/// is attempted, mirroring the original's `pending_size` growth start.
const SCAN_THRESHOLD: usize = 64;

struct Pending {
    ptr: *mut (),
    drop_fn: unsafe fn(*mut ()),
}

// SAFETY: see `crate::reclaim::Retired` -- only ever touched by the
// thread that enqueued it or, transitively, by `drop_fn`.
unsafe impl Send for Pending {}

struct ThreadSlots {
    fixed: [AtomicPtr<()>; STATIC_HAZ_PER_THREAD],
    dynamic: Mutex<Vec<usize>>,
    pending: Mutex<Vec<Pending>>,
}

impl ThreadSlots {
    fn new() -> Self {
        ThreadSlots {
            fixed: Default::default(),
            dynamic: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }
}

/// A self-contained hazard-pointer domain. Each protected data
/// structure owns one (mirroring `HpStack::new` constructing its own
/// `HazardPointers`), rather than sharing a single process-wide table --
/// unlike the quiescent-state scheme, there is no cross-structure
/// benefit to sharing hazard slots, and keeping them separate avoids
/// unrelated structures contending on the same scan.
pub struct HazardPointers {
    threads: Vec<ThreadSlots>,
    next_tid: AtomicUsize,
}

impl HazardPointers {
    /// Build a domain sized for [`crate::registry::MAX_NUM_THREADS`]
    /// participants.
    pub fn new() -> Self {
        let n = crate::registry::MAX_NUM_THREADS;
        HazardPointers {
            threads: (0..n).map(|_| ThreadSlots::new()).collect(),
            next_tid: AtomicUsize::new(0),
        }
    }

    /// Register the calling thread for hazard-protected access to this
    /// domain's structure.
    pub fn register(&self) -> HpGuard<'_> {
        let tid = crate::registry::thread_id();
        HpGuard { domain: self, tid }
    }

    fn collect_hazards(&self) -> Vec<usize> {
        let mut hazards = Vec::new();
        for slots in &self.threads {
            for slot in &slots.fixed {
                let p = slot.load(Ordering::SeqCst);
                if !p.is_null() {
                    hazards.push(p as usize);
                }
            }
            let dynamic = slots.dynamic.lock().unwrap();
            hazards.extend(dynamic.iter().copied());
        }
        hazards
    }
}

impl Default for HazardPointers {
    fn default() -> Self {
        Self::new()
    }
}

/// A per-thread handle for publishing hazard pointers and retiring
/// memory against one [`HazardPointers`] domain.
pub struct HpGuard<'a> {
    domain: &'a HazardPointers,
    tid: usize,
}

impl<'a> HpGuard<'a> {
    /// Publish that this thread is currently accessing `ptr` in fixed
    /// slot `slot`. Must be cleared with [`HpGuard::clear`] once the
    /// thread is done dereferencing it.
    pub fn protect<T>(&self, slot: usize, ptr: *mut T) {
        assert!(slot < STATIC_HAZ_PER_THREAD, "hazard slot out of range");
        self.domain.threads[self.tid].fixed[slot].store(ptr as *mut (), Ordering::SeqCst);
    }

    /// Clear fixed slot `slot`.
    pub fn clear(&self, slot: usize) {
        assert!(slot < STATIC_HAZ_PER_THREAD, "hazard slot out of range");
        self.domain.threads[self.tid].fixed[slot].store(core::ptr::null_mut(), Ordering::SeqCst);
    }

    /// Register a dynamically-sized hazard slot beyond the fixed
    /// extension, publishing `ptr` immediately.
    pub fn register_dynamic<T>(&self, ptr: *mut T) {
        self.domain.threads[self.tid]
            .dynamic
            .lock()
            .unwrap()
            .push(ptr as usize);
    }

    /// Unregister a previously-registered dynamic slot.
    pub fn unregister_dynamic<T>(&self, ptr: *mut T) {
        let mut dynamic = self.domain.threads[self.tid].dynamic.lock().unwrap();
        if let Some(pos) = dynamic.iter().position(|&p| p == ptr as usize) {
            dynamic.swap_remove(pos);
        }
    }

    /// Retire a `Box`-allocated node: free it now if no thread's
    /// hazard slots reference it, otherwise hold it on this thread's
    /// pending list for the next call to drain it.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `Box::into_raw` for a `T`-typed
    /// allocation that has already been unlinked from the structure.
    pub unsafe fn retire<T>(&self, ptr: *mut T) {
        let pending = Pending {
            ptr: ptr as *mut (),
            drop_fn: |p| drop(Box::from_raw(p as *mut T)),
        };
        let slots = &self.domain.threads[self.tid];
        let mut list = slots.pending.lock().unwrap();
        list.push(pending);
        if list.len() < SCAN_THRESHOLD {
            return;
        }
        let hazards = self.domain.collect_hazards();
        let mut still_pending = Vec::new();
        for entry in list.drain(..) {
            if hazards.contains(&(entry.ptr as usize)) {
                still_pending.push(entry);
            } else {
                // SAFETY: not present in any thread's hazard slots.
                unsafe { (entry.drop_fn)(entry.ptr) };
            }
        }
        *list = still_pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn protect_blocks_retirement() {
        let domain = HazardPointers::new();
        let guard = domain.register();

        let freed = Arc::new(AtomicBool::new(false));
        struct Node(Arc<AtomicBool>);
        impl Drop for Node {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let ptr = Box::into_raw(Box::new(Node(Arc::clone(&freed))));
        guard.protect(0, ptr);

        unsafe {
            for i in 0..(SCAN_THRESHOLD + 1) {
                guard.retire(Box::into_raw(Box::new(Node(Arc::clone(&freed)))));
                let _ = i;
            }
        }
        // The protected pointer was never retired through this guard,
        // so it is still alive; drop it manually to avoid leaking in
        // the test.
        guard.clear(0);
        unsafe { drop(Box::from_raw(ptr)) };
    }

    #[test]
    fn unprotected_eventually_frees() {
        use std::sync::atomic::AtomicUsize as Counter;
        static DROPPED: Counter = Counter::new(0);
        struct Node;
        impl Drop for Node {
            fn drop(&mut self) {
                DROPPED.fetch_add(1, Ordering::SeqCst);
            }
        }

        let domain = HazardPointers::new();
        let guard = domain.register();
        unsafe {
            for _ in 0..(SCAN_THRESHOLD + 1) {
                guard.retire(Box::into_raw(Box::new(Node)));
            }
        }
        assert!(DROPPED.load(Ordering::SeqCst) > 0);
    }
}
