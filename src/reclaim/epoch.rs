//! Quiescent-state reclamation.
//!
//! This is a direct generalization of the gossip protocol in the
//! original C runtime's `rcu.c`: each thread owns a bounded queue of
//! pointers awaiting release and a monotone `head` counter of how many
//! it has enqueued so far. A one-step gossip, driven by each thread's
//! own call to [`update`], forwards what thread `t` has observed about
//! peer `u`'s head into the next thread's view of `u`. Once a head
//! value has gossiped all the way around the ring back to its origin,
//! every thread has necessarily called `update` (i.e. declared itself
//! quiescent) at least once since that value was posted, so anything
//! enqueued before it can be freed.
//!
//! # Contract
//!
//! Any operation that dereferences shared lock-free state must be
//! followed, in program order on the same thread, by a call to
//! [`update`] before arbitrary time elapses. Skipping this does not
//! cause unsafety -- reclamation can simply stall indefinitely, holding
//! onto memory it would otherwise have freed. Read-heavy workloads that
//! never call `update` on their read path are the known failure mode;
//! callers of a read-only API should tick `update` periodically (see
//! [`crate::map::MapHandle::maintain`]).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::reclaim::Retired;
use crate::registry::{self, MAX_NUM_THREADS};

/// How many enqueued frees accumulate before a thread gossips its head
/// forward. Mirrors `RCU_POST_THRESHOLD` in the original runtime.
const POST_THRESHOLD: u64 = 10;

struct ThreadSlot {
    /// Monotone count of items this thread has ever enqueued.
    head: AtomicU64,
    /// The last head value this thread has gossiped to its successor.
    last_posted: AtomicU64,
    /// Persistent watermark of how many of this thread's own enqueued
    /// items have already been released across all past `update()`
    /// calls. Mirrors `pending_[tid_]->tail` in the original runtime --
    /// never reset across calls, so only the genuine undrained delta
    /// between it and `acknowledged` is ever freed.
    released: AtomicU64,
    /// FIFO of not-yet-freed pointers, enqueued and drained only by the
    /// owning thread.
    pending: Mutex<std::collections::VecDeque<Retired>>,
}

impl ThreadSlot {
    fn new() -> Self {
        ThreadSlot {
            head: AtomicU64::new(0),
            last_posted: AtomicU64::new(0),
            released: AtomicU64::new(0),
            pending: Mutex::new(std::collections::VecDeque::new()),
        }
    }
}

/// Global quiescent-state domain. One process-wide instance backs
/// [`defer_free`]/[`update`]; there is no per-map instance because
/// reclamation only needs to be conservative, never precise, about
/// which map a retired node came from.
pub struct Domain {
    slots: Vec<ThreadSlot>,
    /// `seen[t * N + u]` is the largest head value of thread `u` that
    /// thread `t` has been told about.
    seen: Vec<AtomicU64>,
}

impl Domain {
    fn new() -> Self {
        let slots = (0..MAX_NUM_THREADS).map(|_| ThreadSlot::new()).collect();
        let seen = (0..MAX_NUM_THREADS * MAX_NUM_THREADS)
            .map(|_| AtomicU64::new(0))
            .collect();
        Domain { slots, seen }
    }

    #[inline]
    fn seen_idx(&self, observer: usize, subject: usize) -> usize {
        observer * MAX_NUM_THREADS + subject
    }

    fn seen_get(&self, observer: usize, subject: usize) -> u64 {
        self.seen[self.seen_idx(observer, subject)].load(Ordering::Relaxed)
    }

    fn seen_set(&self, observer: usize, subject: usize, value: u64) {
        self.seen[self.seen_idx(observer, subject)].store(value, Ordering::Relaxed);
    }

    /// Queue `retired` for release once it is provably safe.
    pub(crate) fn defer_free(&self, retired: Retired) {
        let tid = registry::thread_id();
        let slot = &self.slots[tid];
        let head = {
            let mut pending = slot.pending.lock().unwrap();
            pending.push_back(retired);
            slot.head.fetch_add(1, Ordering::Relaxed) + 1
        };
        self.maybe_post(tid, head);
    }

    fn maybe_post(&self, tid: usize, head: u64) {
        let slot = &self.slots[tid];
        let last = slot.last_posted.load(Ordering::Relaxed);
        if head.saturating_sub(last) < POST_THRESHOLD {
            return;
        }
        slot.last_posted.store(head, Ordering::Relaxed);
        let next = (tid + 1) % registry::registered_count().max(1);
        self.seen_set(next, tid, head);
    }

    /// Declare the calling thread quiescent: it currently holds no
    /// references into any lock-free structure covered by this domain.
    /// Gossips forward what this thread knows, and frees anything of
    /// its own that has made a full round trip.
    pub fn update(&self) {
        let tid = registry::thread_id();
        let n = registry::registered_count().max(1);
        let next = (tid + 1) % n;

        for u in 0..n {
            if u == tid {
                continue;
            }
            let known = self.seen_get(tid, u);
            if known == 0 {
                continue;
            }
            if known > self.seen_get(next, u) {
                self.seen_set(next, u, known);
            }
        }

        // This thread's own head, once it has gossiped all the way
        // around the ring and been reflected back by the last hop,
        // proves every other thread has gone quiescent since it was
        // posted.
        let acknowledged = self.seen_get(tid, tid);
        if acknowledged == 0 {
            return;
        }

        let slot = &self.slots[tid];
        let already_released = slot.released.load(Ordering::Relaxed);
        let budget = acknowledged.saturating_sub(already_released);
        if budget == 0 {
            return;
        }

        let mut pending = slot.pending.lock().unwrap();
        let mut freed = 0u64;
        while freed < budget && !pending.is_empty() {
            if let Some(retired) = pending.pop_front() {
                // SAFETY: the gossip round trip establishes no thread
                // can still be dereferencing anything enqueued before
                // `acknowledged` items were posted, and `budget` only
                // counts the delta not already released by a prior call.
                unsafe { retired.release() };
                freed += 1;
            }
        }
        if freed > 0 {
            slot.released.fetch_add(freed, Ordering::Relaxed);
            crate::trace_log!(trace, "epoch: thread {tid} reclaimed {freed} retired node(s)");
        }
    }
}

static DOMAIN: std::sync::OnceLock<Domain> = std::sync::OnceLock::new();

fn domain() -> &'static Domain {
    DOMAIN.get_or_init(Domain::new)
}

/// Enqueue `ptr` (a `Box<T>`-allocated node) for release once it is safe.
///
/// # Safety
///
/// `ptr` must have been produced by `Box::into_raw` for a live,
/// unlinked allocation that is about to be physically reclaimed.
pub unsafe fn defer_free<T>(ptr: *mut T) {
    domain().defer_free(Retired::boxed(ptr));
}

/// Declare the calling thread quiescent. See [`Domain::update`].
pub fn update() {
    domain().update();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defer_and_eventually_free() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        registry::thread_init();
        let freed = Arc::new(AtomicBool::new(false));
        struct Node(Arc<AtomicBool>);
        impl Drop for Node {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let ptr = Box::into_raw(Box::new(Node(Arc::clone(&freed))));
        for _ in 0..(POST_THRESHOLD as usize + 1) {
            unsafe { defer_free(Box::into_raw(Box::new(Node(Arc::clone(&freed))))) };
        }
        unsafe { defer_free(ptr) };

        for _ in 0..(POST_THRESHOLD as usize * 3) {
            update();
        }
        // With a single registered thread the gossip loop closes
        // immediately, so the node must actually have been dropped.
        assert!(freed.load(Ordering::SeqCst));
    }

    #[test]
    fn single_thread_reclaims_after_updates() {
        use std::sync::atomic::AtomicUsize as Counter;
        static DROPPED: Counter = Counter::new(0);
        struct Node;
        impl Drop for Node {
            fn drop(&mut self) {
                DROPPED.fetch_add(1, Ordering::SeqCst);
            }
        }

        registry::thread_init();
        for _ in 0..(POST_THRESHOLD as usize * 3) {
            unsafe { defer_free(Box::into_raw(Box::new(Node))) };
            update();
        }
        for _ in 0..4 {
            update();
        }
        assert!(DROPPED.load(Ordering::SeqCst) > 0);
    }
}
