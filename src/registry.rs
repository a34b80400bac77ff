//! Thread registry.
//!
//! Every participant in the lock-free structures needs a small dense
//! index so that the reclamation substrate ([`crate::reclaim`]) can size
//! its per-thread bookkeeping as a flat array instead of a hash map.
//! This mirrors the original C library's `tid_` thread-local, acquired
//! once per thread and never recycled.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Maximum number of threads that may ever register with the process.
///
/// Must be a power of two (the reclamation ring buffers rely on it).
pub const MAX_NUM_THREADS: usize = 64;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Register the current thread, if it hasn't already registered, and
/// return its dense id.
///
/// # Panics
///
/// Panics if more than [`MAX_NUM_THREADS`] distinct threads ever call
/// this function over the life of the process. Thread indices are not
/// recycled when threads exit -- lifting that restriction is left to
/// callers that need long-lived thread pools larger than the limit.
pub fn thread_init() -> usize {
    THREAD_ID.with(|slot| {
        if let Some(id) = slot.get() {
            return id;
        }
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        assert!(
            id < MAX_NUM_THREADS,
            "nbmap: more than MAX_NUM_THREADS ({MAX_NUM_THREADS}) threads registered"
        );
        slot.set(Some(id));
        crate::trace_log!(debug, "registry: thread registered with id {id}");
        id
    })
}

/// Return the current thread's dense id, registering it first if needed.
#[inline]
pub fn thread_id() -> usize {
    thread_init()
}

/// Number of threads that have registered so far.
pub fn registered_count() -> usize {
    NEXT_ID.load(Ordering::Relaxed).min(MAX_NUM_THREADS)
}
