//! Optimistic multi-version software transactional memory (C10).
//!
//! Registration is bump-and-recheck against a global version counter,
//! commit is validate-then-publish, and conflicting writers break ties
//! by letting whichever transaction holds the lower write-version
//! validate first. On top of that core protocol this module adds
//! garbage collection of stale update-record chains and folds a
//! single-entry chain back down to an inline value once nothing older
//! can still need it.
//!
//! A value stored behind the backing [`crate::map::Map`] is either an
//! inline plain value (untagged) or the head of an update-record chain
//! (T2-tagged in the encoding this module replaces with a sum type).
//! Rather than reserving a bit of a raw word for that distinction,
//! [`UpdateSlot`] models it directly as a Rust enum over the payload.
//!
//! An update record's own `version` field keeps the original's T1
//! convention: an untagged word is a committed version number, a
//! [`TAG1`]-tagged word is a pointer to the owning [`Txn`] (payload `0`
//! meaning `ABORTED_VERSION`).

use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::list::Expectation;
use crate::map::Map;
use crate::reclaim::epoch;
use crate::skiplist::SkipList;
use crate::tagged::{is_tagged, strip_tag, tag, TAG1};

const STATE_RUNNING: u8 = 0;
const STATE_VALIDATING: u8 = 1;
const STATE_VALIDATED: u8 = 2;
const STATE_ABORTED: u8 = 3;

/// Terminal (and in-flight) states a transaction can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Running,
    Validating,
    Validated,
    Aborted,
}

impl TxnState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_RUNNING => TxnState::Running,
            STATE_VALIDATING => TxnState::Validating,
            STATE_VALIDATED => TxnState::Validated,
            _ => TxnState::Aborted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateKind {
    Put,
    Delete,
}

struct UpdateRec<V> {
    kind: UpdateKind,
    value: Option<V>,
    /// TAG1-tagged word: tagged means "payload is a `*const Txn<..>`
    /// (0 = aborted sentinel)"; untagged means "payload is a committed
    /// version number, visible from that version onward".
    version: AtomicUsize,
    prev: AtomicPtr<UpdateRec<V>>,
}

/// The value type stored behind the backing map: either an inline
/// plain value or the head of a version chain.
pub enum UpdateSlot<V> {
    Inline(V),
    Chain(*mut UpdateRec<V>),
}

// SAFETY: `Chain`'s raw pointer is only ever dereferenced by code in
// this module, which synchronizes through the backing map's own CAS
// and the quiescent reclamation scheme, exactly like every other raw
// pointer this crate hands across threads (list/skiplist/hashtable
// nodes).
unsafe impl<V: Send> Send for UpdateSlot<V> {}
unsafe impl<V: Sync> Sync for UpdateSlot<V> {}

impl<V: Clone> Clone for UpdateSlot<V> {
    fn clone(&self) -> Self {
        match self {
            UpdateSlot::Inline(v) => UpdateSlot::Inline(v.clone()),
            UpdateSlot::Chain(p) => UpdateSlot::Chain(*p),
        }
    }
}

impl<V: PartialEq> PartialEq for UpdateSlot<V> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (UpdateSlot::Inline(a), UpdateSlot::Inline(b)) => a == b,
            (UpdateSlot::Chain(a), UpdateSlot::Chain(b)) => a == b,
            _ => false,
        }
    }
}

static VERSION: AtomicU64 = AtomicU64::new(1);

/// The active-transactions map: read-version -> count of transactions
/// currently holding that read-version. Used to compute the oldest
/// version any live transaction might still need.
fn active() -> &'static SkipList<u64, i64> {
    static ACTIVE: OnceLock<SkipList<u64, i64>> = OnceLock::new();
    ACTIVE.get_or_init(SkipList::new)
}

fn bump_active(version: u64, delta: i64) {
    loop {
        let before = active().lookup(&version);
        let new = before.unwrap_or(0) + delta;
        let expectation = match before {
            Some(v) => Expectation::Value(v),
            None => Expectation::DoesNotExist,
        };
        let observed = active().cas(version, expectation, new);
        if observed == before {
            return;
        }
    }
}

/// The smallest read-version any currently active transaction might
/// still observe; keys committed at or before this version can never
/// again be superseded by an older read, so their tail history is
/// garbage.
fn watermark() -> u64 {
    let mut min = VERSION.load(Ordering::SeqCst);
    for (version, count) in active().iter() {
        if count > 0 && version < min {
            min = version;
        }
    }
    min
}

/// An optimistic, multi-version transaction over a backing map whose
/// values are [`UpdateSlot<V>`].
///
/// Must be accessed through the `Box` [`begin`] returns: other threads
/// helping validate a conflicting transaction dereference a raw
/// pointer to this struct, so its backing allocation must never move.
pub struct Txn<'a, K, V, M: Map<K, UpdateSlot<V>>> {
    rv: u64,
    wv: AtomicU64,
    state: AtomicU8,
    map: &'a M,
    writes: Mutex<Vec<(K, *mut UpdateRec<V>)>>,
}

// SAFETY: `writes` is behind a `Mutex`; `rv`/`wv`/`state` are atomics.
unsafe impl<'a, K: Send, V: Send, M: Map<K, UpdateSlot<V>> + Sync> Send for Txn<'a, K, V, M> {}
unsafe impl<'a, K: Send, V: Send, M: Map<K, UpdateSlot<V>> + Sync> Sync for Txn<'a, K, V, M> {}

impl<'a, K, V, M> Txn<'a, K, V, M>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
    M: Map<K, UpdateSlot<V>>,
{
    fn self_ptr(&self) -> usize {
        self as *const Self as usize
    }

    /// Current terminal (or in-flight) state.
    pub fn state(&self) -> TxnState {
        TxnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Read `key` as of this transaction's snapshot, seeing this
    /// transaction's own uncommitted writes.
    pub fn get(&self, key: &K) -> Option<V> {
        let head = match self.map.get(key) {
            Some(UpdateSlot::Inline(v)) => return Some(v),
            Some(UpdateSlot::Chain(h)) => h,
            None => return None,
        };

        let mut node = head;
        loop {
            if node.is_null() {
                return None;
            }
            let rec = unsafe { &*node };
            let word = rec.version.load(Ordering::SeqCst);

            if is_tagged(word, TAG1) {
                let payload = strip_tag(word, TAG1);
                if payload == 0 {
                    node = rec.prev.load(Ordering::SeqCst);
                    continue;
                }
                let writer = payload as *const Txn<'a, K, V, M>;
                if writer as usize == self.self_ptr() {
                    return visible_value(rec);
                }
                let writer_ref = unsafe { &*writer };
                let mut writer_state = writer_ref.state.load(Ordering::SeqCst);
                if writer_state == STATE_ABORTED {
                    node = rec.prev.load(Ordering::SeqCst);
                    continue;
                }
                if writer_state == STATE_VALIDATING {
                    writer_state = validate_self(writer_ref);
                }
                let writer_wv = writer_ref.wv.load(Ordering::SeqCst);
                if writer_state == STATE_VALIDATED && writer_wv != 0 && writer_wv <= self.rv {
                    return visible_value(rec);
                }
            } else if (word as u64) < self.rv {
                return visible_value(rec);
            }

            node = rec.prev.load(Ordering::SeqCst);
        }
    }

    fn write(&self, key: K, kind: UpdateKind, value: Option<V>) {
        loop {
            let prev_word = self.map.get(&key);
            let prev_ptr = match &prev_word {
                Some(UpdateSlot::Chain(p)) => *p,
                Some(UpdateSlot::Inline(_)) | None => std::ptr::null_mut(),
            };

            // An inline value must not be dropped silently: fold it
            // into a synthetic, universally-visible base record (version
            // 0 is always `<= rv`) so older readers still see it.
            let base = if let Some(UpdateSlot::Inline(v)) = &prev_word {
                Box::into_raw(Box::new(UpdateRec {
                    kind: UpdateKind::Put,
                    value: Some(v.clone()),
                    version: AtomicUsize::new(0),
                    prev: AtomicPtr::new(std::ptr::null_mut()),
                }))
            } else {
                prev_ptr
            };

            let rec = Box::into_raw(Box::new(UpdateRec {
                kind,
                value: value.clone(),
                version: AtomicUsize::new(tag(self.self_ptr(), TAG1)),
                prev: AtomicPtr::new(base),
            }));

            let expectation = match &prev_word {
                None => Expectation::DoesNotExist,
                Some(slot) => Expectation::Value(slot.clone()),
            };

            let observed = self.map.cas(key.clone(), expectation, UpdateSlot::Chain(rec));

            if observed == prev_word {
                self.writes.lock().unwrap().push((key, rec));
                return;
            }

            if base != prev_ptr {
                unsafe { drop(Box::from_raw(base)) };
            }
            unsafe { drop(Box::from_raw(rec)) };
        }
    }

    /// Set `key` to `value` within this transaction.
    pub fn set(&self, key: K, value: V) {
        self.write(key, UpdateKind::Put, Some(value));
    }

    /// Delete `key` within this transaction.
    pub fn delete(&self, key: K) {
        self.write(key, UpdateKind::Delete, None);
    }

    /// Validate and publish this transaction's writes.
    pub fn commit(self: Box<Self>) -> TxnState {
        self.state.store(STATE_VALIDATING, Ordering::SeqCst);
        let final_state = validate_self(&self);

        let committed_word = if final_state == STATE_ABORTED {
            tag(0, TAG1)
        } else {
            self.wv.load(Ordering::SeqCst) as usize
        };
        for (_, rec) in self.writes.lock().unwrap().iter() {
            unsafe { (**rec).version.store(committed_word, Ordering::SeqCst) };
        }

        bump_active(self.rv, -1);
        let outcome = TxnState::from_u8(final_state);
        let ptr = Box::into_raw(self);
        unsafe { epoch::defer_free(ptr) };
        outcome
    }

    /// Discard this transaction's writes without validating.
    pub fn abort(self: Box<Self>) {
        let aborted_word = tag(0, TAG1);
        for (_, rec) in self.writes.lock().unwrap().iter() {
            unsafe { (**rec).version.store(aborted_word, Ordering::SeqCst) };
        }
        bump_active(self.rv, -1);
        let ptr = Box::into_raw(self);
        unsafe { epoch::defer_free(ptr) };
    }
}

fn visible_value<V: Clone>(rec: &UpdateRec<V>) -> Option<V> {
    match rec.kind {
        UpdateKind::Put => rec.value.clone(),
        UpdateKind::Delete => None,
    }
}

fn validate_self<'a, K, V, M>(txn: &Txn<'a, K, V, M>) -> u8
where
    K: Ord + Clone,
    M: Map<K, UpdateSlot<V>>,
{
    let observed = txn.state.load(Ordering::SeqCst);
    if observed != STATE_VALIDATING {
        return observed;
    }

    if txn.wv.load(Ordering::SeqCst) == 0 {
        let wv = VERSION.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = txn
            .wv
            .compare_exchange(0, wv, Ordering::SeqCst, Ordering::SeqCst);
    }

    let mut aborted = false;
    {
        let writes = txn.writes.lock().unwrap();
        for (key, _) in writes.iter() {
            if !validate_key(txn, key) {
                aborted = true;
                break;
            }
        }
    }

    if aborted {
        crate::trace_log!(debug, "txn: validation failed, aborting (rv={}, wv={})", txn.rv, txn.wv.load(Ordering::SeqCst));
        txn.state.store(STATE_ABORTED, Ordering::SeqCst);
    } else {
        let _ = txn.state.compare_exchange(
            STATE_VALIDATING,
            STATE_VALIDATED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
    txn.state.load(Ordering::SeqCst)
}

/// Returns `true` if `key`'s chain validates for `txn` (no conflicting
/// commit newer than `txn.rv`), `false` if `txn` must abort.
fn validate_key<'a, K, V, M>(txn: &Txn<'a, K, V, M>, key: &K) -> bool
where
    K: Ord + Clone,
    M: Map<K, UpdateSlot<V>>,
{
    let mut node = match txn.map.get(key) {
        Some(UpdateSlot::Inline(_)) => return true,
        Some(UpdateSlot::Chain(h)) => h,
        None => return true,
    };

    loop {
        if node.is_null() {
            return true;
        }
        let rec = unsafe { &*node };
        let word = rec.version.load(Ordering::SeqCst);

        if is_tagged(word, TAG1) {
            let payload = strip_tag(word, TAG1);
            if payload == 0 {
                node = rec.prev.load(Ordering::SeqCst);
                continue;
            }
            let writer = payload as *const Txn<'a, K, V, M>;
            if writer as usize == txn.self_ptr() {
                node = rec.prev.load(Ordering::SeqCst);
                continue;
            }
            let writer_ref = unsafe { &*writer };
            let writer_wv = writer_ref.wv.load(Ordering::SeqCst);
            if writer_wv != 0 && writer_wv <= txn.rv {
                return true;
            }
            let mut writer_state = writer_ref.state.load(Ordering::SeqCst);
            if writer_state == STATE_ABORTED {
                node = rec.prev.load(Ordering::SeqCst);
                continue;
            }
            if writer_state == STATE_VALIDATING
                && (writer_wv < txn.wv.load(Ordering::SeqCst) || writer_wv == 0)
            {
                writer_state = validate_self(writer_ref);
            }
            return writer_state == STATE_VALIDATED;
        }

        return (word as u64) <= txn.rv;
    }
}

/// Begin a new transaction over `map`, snapshotting the current global
/// version as its read version. Bump-and-recheck registration:
/// register the read version *before* rechecking it is still current,
/// retrying if a concurrent commit raced ahead.
pub fn begin<'a, K, V, M>(map: &'a M) -> Box<Txn<'a, K, V, M>>
where
    K: Ord + Clone,
    M: Map<K, UpdateSlot<V>>,
{
    let rv = loop {
        let rv = VERSION.load(Ordering::SeqCst);
        bump_active(rv, 1);
        if VERSION.load(Ordering::SeqCst) == rv {
            break rv;
        }
        bump_active(rv, -1);
    };

    Box::new(Txn {
        rv,
        wv: AtomicU64::new(0),
        state: AtomicU8::new(STATE_RUNNING),
        map,
        writes: Mutex::new(Vec::new()),
    })
}

/// Opportunistically garbage-collect `key`'s update chain: sever and
/// free any tail no longer visible to any active transaction, and fold
/// a single universally-visible remaining update back into an inline
/// value.
pub fn collect_garbage<K, V, M>(map: &M, key: &K)
where
    K: Ord + Clone,
    V: Clone + PartialEq,
    M: Map<K, UpdateSlot<V>>,
{
    let min_rv = watermark();
    let head = match map.get(key) {
        Some(UpdateSlot::Chain(h)) => h,
        _ => return,
    };

    let mut node = head;
    while !node.is_null() {
        let rec = unsafe { &*node };
        let word = rec.version.load(Ordering::SeqCst);
        if !is_tagged(word, TAG1) && (word as u64) <= min_rv {
            let stale = rec.prev.swap(std::ptr::null_mut(), Ordering::SeqCst);
            free_chain(stale);
            break;
        }
        node = rec.prev.load(Ordering::SeqCst);
    }

    let head_rec = unsafe { &*head };
    let head_word = head_rec.version.load(Ordering::SeqCst);
    let head_committed = !is_tagged(head_word, TAG1) && (head_word as u64) <= min_rv;
    if head_committed && head_rec.prev.load(Ordering::SeqCst).is_null() {
        match &head_rec.value {
            Some(v) => {
                let old = UpdateSlot::Chain(head);
                if let Some(UpdateSlot::Chain(observed)) =
                    map.cas(key.clone(), Expectation::Value(old), UpdateSlot::Inline(v.clone()))
                {
                    if observed == head {
                        unsafe { epoch::defer_free(head) };
                    }
                } else {
                    // CAS raced with a concurrent write; leave the chain
                    // as-is, it will be folded on a future pass.
                }
            }
            None => {
                let _ = map.remove(key);
            }
        }
    }
}

fn free_chain<V>(mut node: *mut UpdateRec<V>) {
    while !node.is_null() {
        let next = unsafe { (*node).prev.load(Ordering::Relaxed) };
        unsafe { epoch::defer_free(node) };
        node = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::MapHandle;

    #[test]
    fn basic_commit_and_conflict() {
        let map: MapHandle<&'static str, UpdateSlot<i64>> = MapHandle::hashtable();

        let t1 = begin(&map);
        let t2 = begin(&map);

        t1.set("k", 3);
        t1.set("k", 3); // no-op write, same value
        assert_eq!(t2.get(&"k"), None);
        t2.set("k", 4);
        assert_eq!(t2.commit(), TxnState::Validated);
        assert_eq!(t1.commit(), TxnState::Aborted);

        let t3 = begin(&map);
        assert_eq!(t3.get(&"k"), Some(4));
        assert_eq!(t3.commit(), TxnState::Validated);
    }

    #[test]
    fn gc_converges_to_short_chain() {
        let map: MapHandle<&'static str, UpdateSlot<i64>> = MapHandle::hashtable();
        for i in 0..100 {
            let t = begin(&map);
            t.set("k", i);
            assert_eq!(t.commit(), TxnState::Validated);
            collect_garbage(&map, &"k");
            let reader = begin(&map);
            assert_eq!(reader.get(&"k"), Some(i));
            let _ = reader.commit();
        }
        match map.get(&"k") {
            Some(UpdateSlot::Inline(v)) => assert_eq!(v, 99),
            Some(UpdateSlot::Chain(head)) => {
                let rec = unsafe { &*head };
                assert!(rec.prev.load(Ordering::SeqCst).is_null());
            }
            None => panic!("key vanished"),
        }
    }
}
