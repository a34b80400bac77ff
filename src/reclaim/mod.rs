//! Deferred-reclamation substrate.
//!
//! Two interchangeable schemes let writers physically free memory only
//! after no reader can still be observing it:
//!
//! - [`epoch`]: a quiescent-state scheme. Readers bound their hazard
//!   window by calling [`epoch::update`] between operations; writers
//!   defer frees until every thread has passed a quiescent point.
//! - [`hazard`]: a hazard-pointer scheme for code paths that cannot be
//!   bounded by a quiescent call, such as the external lock-free stack
//!   used in the test harness.
//!
//! Both expose the same retirement shape: a pointer plus the function
//! that knows how to drop it, queued until it is provably safe to run.

pub mod epoch;
pub mod hazard;

/// A pointer queued for deferred release, together with the drop glue
/// needed to free it without the owning module's static type.
pub(crate) struct Retired {
    pub(crate) ptr: *mut (),
    pub(crate) drop_fn: unsafe fn(*mut ()),
}

// SAFETY: `Retired` is only ever moved between the queue that owns it
// and the thread that drains that queue; the pointee itself may not be
// `Send`, but `Retired` never dereferences it except via `drop_fn`,
// which a correct `drop_fn` for a `Send` payload will produce safely.
unsafe impl Send for Retired {}

impl Retired {
    /// Build a `Retired` entry for a `Box<T>`-allocated node.
    ///
    /// # Safety
    ///
    /// `ptr` must have been produced by `Box::into_raw` and not yet
    /// freed.
    pub(crate) unsafe fn boxed<T>(ptr: *mut T) -> Self {
        Retired {
            ptr: ptr as *mut (),
            drop_fn: |p| {
                drop(Box::from_raw(p as *mut T));
            },
        }
    }

    /// Run the drop glue, consuming the retired pointer.
    ///
    /// # Safety
    ///
    /// Must only be called once the scheme protecting this entry has
    /// established that no reader can still observe the pointee.
    pub(crate) unsafe fn release(self) {
        (self.drop_fn)(self.ptr);
    }
}
