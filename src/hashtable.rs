//! Resizable, lock-free concurrent hash table (C8).
//!
//! Ground truth: `examples/original_source/map/hashtable.c`, a Rust
//! port of Cliff Click's non-blocking hash table. Enriched against
//! `examples/other_examples/.../ibraheemdev-cliff-map` for the
//! idiomatic-Rust shape of a generation-chained table (an `AtomicPtr`
//! to the newest generation, older generations reachable via `next`
//! until fully copied and retired).
//!
//! Unlike the original's raw `uint64_t` key/value words, keys and
//! values here are arbitrary `K: Hash + Eq` / `V` stored behind
//! `Box`. The encoding of an entry's value word is kept close to the
//! original's three-state design:
//!
//! * `0` -- absent (never written).
//! * `TOMBSTONE` (`usize::MAX` with `TAG1` cleared) -- removed, but
//!   deliberately left *un*tagged so a plain `is_tagged(v, TAG1)` check
//!   never mistakes it for a copy-in-progress marker.
//! * `COPIED` (`usize::MAX`) -- this slot's value has fully migrated to
//!   the next generation; note `TOMBSTONE | TAG1 == COPIED`, so
//!   marking a tombstone as copy-in-progress *is* the promotion to
//!   `COPIED`.
//! * any other word -- a tagged pointer to a boxed `V`; `TAG1` set
//!   means a migration of this slot to the next generation is in
//!   progress (the pointer is still valid while tagged).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering};

use crate::list::Expectation;
use crate::reclaim::epoch;
use crate::tagged::{is_tagged, strip_tag, tag, TAG1};

/// Minimum table scale: `2^4 == 16` entries.
pub const MIN_SCALE: u32 = 4;
/// Cache line size used to size a probed bucket.
pub const CACHE_LINE_SIZE: usize = 64;
/// Hard cap on the number of buckets probed before giving up and
/// growing the table.
const MAX_BUCKETS_TO_PROBE: usize = 250;

const ABSENT: usize = 0;
/// Deliberately *un*tagged (all-ones except bit 0), so that
/// `TOMBSTONE | TAG1 == COPIED` holds as a one-way promotion under
/// migration and a plain `is_tagged(v, TAG1)` check never mistakes a
/// real tombstone for a copy-in-progress marker.
const TOMBSTONE: usize = strip_tag(usize::MAX, TAG1);
const COPIED: usize = usize::MAX;

fn entries_per_bucket<K, V>() -> usize {
    (CACHE_LINE_SIZE / std::mem::size_of::<Entry<K, V>>()).max(1)
}

fn hash_key<K: Hash>(key: &K) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let full = hasher.finish();
    (full as u32) ^ ((full >> 32) as u32)
}

struct Entry<K, V> {
    key: AtomicPtr<K>,
    value: AtomicUsize,
    _marker: PhantomData<V>,
}

impl<K, V> Entry<K, V> {
    fn empty() -> Self {
        Entry {
            key: AtomicPtr::new(std::ptr::null_mut()),
            value: AtomicUsize::new(ABSENT),
            _marker: PhantomData,
        }
    }
}

/// Which bucket/slot a lookup landed on, and whether it was empty.
enum Probe<'t, K, V> {
    Found { entry: &'t Entry<K, V>, is_empty: bool },
    NoRoom,
}

struct Table<K, V> {
    entries: Box<[Entry<K, V>]>,
    scale: u32,
    max_probe: usize,
    next: AtomicPtr<Table<K, V>>,
    references: AtomicIsize,
    count: AtomicIsize,
    num_entries_copied: AtomicUsize,
    copy_scan: AtomicUsize,
}

impl<K, V> Table<K, V> {
    fn alloc(scale: u32) -> Box<Table<K, V>> {
        let len = 1usize << scale;
        let entries = (0..len).map(|_| Entry::empty()).collect::<Vec<_>>().into_boxed_slice();
        let epb = entries_per_bucket::<K, V>();
        let mut max_probe = ((1usize << (scale.saturating_sub(2))) / epb) + 4;
        if max_probe > MAX_BUCKETS_TO_PROBE {
            max_probe = MAX_BUCKETS_TO_PROBE;
        }
        Box::new(Table {
            entries,
            scale,
            max_probe,
            next: AtomicPtr::new(std::ptr::null_mut()),
            references: AtomicIsize::new(0),
            count: AtomicIsize::new(0),
            num_entries_copied: AtomicUsize::new(0),
            copy_scan: AtomicUsize::new(0),
        })
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get_next_ndx(&self, old_ndx: usize, key_hash: u32) -> usize {
        let mut incr = (key_hash >> (32 - self.scale)) as usize;
        if incr == 0 {
            incr = 1;
        }
        (old_ndx + incr) & (self.len() - 1)
    }

    /// Probe for `key`'s entry (or the slot it would occupy).
    fn lookup(&self, key: &K, key_hash: u32) -> Probe<'_, K, V>
    where
        K: Eq,
    {
        let epb = entries_per_bucket::<K, V>();
        let mut ndx = (key_hash as usize) & (self.len() - 1);
        for _ in 0..self.max_probe {
            let bucket_start = ndx & !(epb - 1);
            for j in 0..epb {
                let slot = bucket_start + ((ndx + j) & (epb - 1));
                let entry = &self.entries[slot];
                let key_ptr = entry.key.load(Ordering::SeqCst);
                if key_ptr.is_null() {
                    return Probe::Found { entry, is_empty: true };
                }
                if unsafe { &*key_ptr } == key {
                    return Probe::Found { entry, is_empty: false };
                }
            }
            ndx = self.get_next_ndx(ndx, key_hash);
        }
        Probe::NoRoom
    }

    /// Install a new, larger generation as `self.next`, if one isn't
    /// already installed.
    fn start_copy(&self, observed_count: isize) {
        if !self.next.load(Ordering::SeqCst).is_null() {
            return;
        }
        let quarter = 1isize << self.scale.saturating_sub(2);
        let mut new_scale = self.scale;
        if observed_count > quarter {
            new_scale += 1;
        }
        if observed_count > quarter << 1 {
            new_scale += 1;
        }
        let next = Box::into_raw(Table::alloc(new_scale.max(MIN_SCALE)));
        if self
            .next
            .compare_exchange(std::ptr::null_mut(), next, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            unsafe { drop(Box::from_raw(next)) };
        } else {
            crate::trace_log!(
                debug,
                "hashtable: starting resize {} -> {}",
                self.scale,
                new_scale.max(MIN_SCALE)
            );
        }
    }

    /// Copy one entry of `self` into `next`, recursing into `next.next`
    /// if `next` itself has no room. Returns `true` if this call is the
    /// one that completed the copy of this entry.
    fn copy_entry(&self, entry: &Entry<K, V>, mut key_hash: u32, next: &Table<K, V>) -> bool
    where
        K: Eq + Clone,
    {
        let mut val = entry.value.load(Ordering::SeqCst);
        if val == COPIED {
            return false;
        }

        if val == ABSENT {
            match entry.value.compare_exchange(ABSENT, COPIED, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return true,
                Err(actual) => {
                    if actual == COPIED {
                        return false;
                    }
                    val = actual;
                }
            }
        }

        // `fetch_or` reports the pre-OR value, which is what tells us
        // whether *this* call performed the promotion or merely
        // observed one already done: `TOMBSTONE | TAG1 == COPIED`, so
        // checking the post-OR value can't distinguish "I just turned
        // a tombstone into COPIED" from "it was already COPIED" --
        // only the previous value can.
        let prev_val = entry.value.fetch_or(TAG1, Ordering::SeqCst);
        if prev_val == COPIED {
            return false;
        }

        let key_ptr = entry.key.load(Ordering::SeqCst);
        if prev_val == TOMBSTONE {
            if !key_ptr.is_null() {
                unsafe { epoch::defer_free(key_ptr) };
            }
            return true;
        }

        val = prev_val | TAG1;

        if key_hash == 0 {
            key_hash = hash_key(unsafe { &*key_ptr });
        }
        let key_ref = unsafe { &*key_ptr };

        let mut target = next;
        loop {
            match target.lookup(key_ref, key_hash) {
                Probe::NoRoom => {
                    target.start_copy(target.count.load(Ordering::SeqCst));
                    let grandchild = target.next.load(Ordering::SeqCst);
                    debug_assert!(!grandchild.is_null());
                    target = unsafe { &*grandchild };
                    continue;
                }
                Probe::Found { entry: dst, is_empty } => {
                    if is_empty {
                        let cloned_key = Box::into_raw(Box::new(key_ref.clone()));
                        if dst
                            .key
                            .compare_exchange(
                                std::ptr::null_mut(),
                                cloned_key,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            )
                            .is_err()
                        {
                            unsafe { drop(Box::from_raw(cloned_key)) };
                            continue;
                        }
                    }

                    let stripped = strip_tag(val, TAG1);
                    let prev = dst.value.compare_exchange(
                        ABSENT,
                        stripped,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    match prev {
                        Ok(_) | Err(ABSENT) => {}
                        Err(COPIED) => {
                            let grandchild = target.next.load(Ordering::SeqCst);
                            debug_assert!(!grandchild.is_null());
                            target = unsafe { &*grandchild };
                            continue;
                        }
                        Err(_) => {}
                    }

                    entry.value.store(COPIED, Ordering::SeqCst);
                    if prev.is_ok() {
                        self.count.fetch_sub(1, Ordering::SeqCst);
                        next.count.fetch_add(1, Ordering::SeqCst);
                        return true;
                    }
                    return false;
                }
            }
        }
    }

    /// Drive the migration to this generation's `next` forward by one
    /// chunk of entries. Returns `true` once the whole table has been
    /// copied.
    fn help_copy(&self) -> bool
    where
        K: Eq + Clone,
    {
        let total_len = self.len();
        let mut total_copied = self.num_entries_copied.load(Ordering::SeqCst);
        if total_copied == total_len {
            return true;
        }

        let next = self.next.load(Ordering::SeqCst);
        if next.is_null() {
            return false;
        }
        let next = unsafe { &*next };

        let chunk = entries_per_bucket::<K, V>() * 2;
        let x = self.copy_scan.load(Ordering::SeqCst);
        let panic = x >= total_len * 2;

        let (start, limit) = if !panic {
            self.copy_scan.store(x + chunk, Ordering::SeqCst);
            (x & (total_len - 1), chunk)
        } else {
            crate::trace_log!(
                warn,
                "hashtable: copy_scan exceeded 2x table size ({}), falling back to full scan",
                total_len
            );
            (0, total_len)
        };

        let mut num_copied = 0usize;
        for i in 0..limit {
            let idx = (start + i) % total_len;
            if self.copy_entry(&self.entries[idx], 0, next) {
                num_copied += 1;
            }
        }
        if num_copied > 0 {
            total_copied = self.num_entries_copied.fetch_add(num_copied, Ordering::SeqCst) + num_copied;
        }
        total_copied >= total_len
    }

    fn next_table(&self) -> Option<&Table<K, V>> {
        let p = self.next.load(Ordering::SeqCst);
        if p.is_null() {
            None
        } else {
            Some(unsafe { &*p })
        }
    }
}

/// Outcome of attempting a CAS against a single generation.
enum GenCas<V> {
    Done(Option<V>),
    Retry,
}

fn cas_in_table<K, V>(
    table: &Table<K, V>,
    key: &K,
    key_hash: u32,
    expectation: &Expectation<V>,
    new_value: Option<V>,
) -> GenCas<V>
where
    K: Eq + Clone,
    V: Clone + PartialEq,
{
    loop {
        let (entry, is_empty) = match table.lookup(key, key_hash) {
            Probe::NoRoom => {
                table.start_copy(table.count.load(Ordering::SeqCst));
                return GenCas::Retry;
            }
            Probe::Found { entry, is_empty } => (entry, is_empty),
        };

        if is_empty {
            if !matches!(expectation, Expectation::Whatever | Expectation::DoesNotExist) {
                return GenCas::Done(None);
            }
            let Some(ref v) = new_value else {
                return GenCas::Done(None);
            };
            let new_key = Box::into_raw(Box::new(key.clone()));
            if entry
                .key
                .compare_exchange(std::ptr::null_mut(), new_key, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                unsafe { drop(Box::from_raw(new_key)) };
                continue; // another thread took this slot; retry lookup
            }
            let _ = v;
        }

        let ent_val = entry.value.load(Ordering::SeqCst);
        if is_tagged(ent_val, TAG1) {
            if ent_val != COPIED {
                if let Some(next) = table.next_table() {
                    table.copy_entry(entry, key_hash, next);
                }
            }
            return GenCas::Retry;
        }

        let old_existed = ent_val != TOMBSTONE && ent_val != ABSENT;
        match expectation {
            Expectation::Whatever => {}
            Expectation::DoesNotExist => {
                if old_existed {
                    return GenCas::Done(Some(load_value(ent_val)));
                }
            }
            Expectation::Exists => {
                if !old_existed {
                    return GenCas::Done(None);
                }
            }
            Expectation::Value(expected) => {
                if !old_existed || load_value(ent_val) != *expected {
                    return GenCas::Done(if old_existed { Some(load_value(ent_val)) } else { None });
                }
            }
        }

        if new_value.is_none() && !old_existed {
            return GenCas::Done(None);
        }

        let new_word = match &new_value {
            Some(v) => Box::into_raw(Box::new(v.clone())) as usize,
            None => TOMBSTONE,
        };

        match entry.value.compare_exchange(ent_val, new_word, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => {
                if old_existed && new_value.is_none() {
                    table.count.fetch_sub(1, Ordering::SeqCst);
                } else if !old_existed && new_value.is_some() {
                    table.count.fetch_add(1, Ordering::SeqCst);
                }
                if old_existed {
                    unsafe { epoch::defer_free(ent_val as *mut V) };
                }
                return GenCas::Done(if old_existed { Some(load_value(ent_val)) } else { None });
            }
            Err(_) => {
                if new_value.is_some() {
                    unsafe { drop(Box::from_raw(new_word as *mut V)) };
                }
                continue;
            }
        }
    }
}

fn load_value<V: Clone>(word: usize) -> V {
    let ptr = strip_tag(word, TAG1) as *const V;
    unsafe { (*ptr).clone() }
}

/// A resizable, lock-free concurrent hash table.
pub struct HashTable<K, V> {
    current: AtomicPtr<Table<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone + PartialEq> Default for HashTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone, V: Clone + PartialEq> HashTable<K, V> {
    /// Create an empty hash table with the minimum scale.
    pub fn new() -> Self {
        HashTable {
            current: AtomicPtr::new(Box::into_raw(Table::alloc(MIN_SCALE))),
        }
    }

    fn help_and_retire(&self, table: &Table<K, V>) {
        if table.next_table().is_none() {
            return;
        }
        let done = table.help_copy();
        if done && table.references.load(Ordering::SeqCst) == 0 {
            if table
                .references
                .compare_exchange(0, -1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let next = table.next.load(Ordering::SeqCst);
                let current = self.current.load(Ordering::SeqCst);
                if std::ptr::eq(current, table)
                    && self
                        .current
                        .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    // SAFETY: no reader can still be using `current`'s
                    // table once it is unlinked from `self.current` and
                    // a quiescent point has passed every thread.
                    unsafe { epoch::defer_free(current) };
                }
            }
        }
    }

    /// Look up `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        let key_hash = hash_key(key);
        let mut table = unsafe { &*self.current.load(Ordering::SeqCst) };
        loop {
            match table.lookup(key, key_hash) {
                Probe::NoRoom => match table.next_table() {
                    Some(next) => {
                        table = next;
                        continue;
                    }
                    None => return None,
                },
                Probe::Found { entry, is_empty } => {
                    if is_empty {
                        return None;
                    }
                    let val = entry.value.load(Ordering::SeqCst);
                    if is_tagged(val, TAG1) {
                        if val != COPIED {
                            if let Some(next) = table.next_table() {
                                table.copy_entry(entry, key_hash, next);
                            }
                        }
                        match table.next_table() {
                            Some(next) => {
                                table = next;
                                continue;
                            }
                            None => return None,
                        }
                    }
                    return if val == TOMBSTONE || val == ABSENT {
                        None
                    } else {
                        Some(load_value(val))
                    };
                }
            }
        }
    }

    /// Compare-and-swap `key`'s value. `new_value == None` removes the
    /// key. Returns the value observed before this call.
    pub fn cas(&self, key: K, expectation: Expectation<V>, new_value: Option<V>) -> Option<V> {
        let key_hash = hash_key(&key);
        let mut table = unsafe { &*self.current.load(Ordering::SeqCst) };
        loop {
            self.help_and_retire(table);
            match cas_in_table(table, &key, key_hash, &expectation, new_value.clone()) {
                GenCas::Done(v) => return v,
                GenCas::Retry => {
                    table = match table.next_table() {
                        Some(next) => next,
                        None => {
                            // start_copy was already invoked by cas_in_table / copy_entry.
                            std::thread::yield_now();
                            table
                        }
                    };
                }
            }
        }
    }

    /// Insert or overwrite `key`. Returns the previous value, if any.
    pub fn set(&self, key: K, value: V) -> Option<V> {
        self.cas(key, Expectation::Whatever, Some(value))
    }

    /// Remove `key`. Returns the removed value, if any.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.cas(key.clone(), Expectation::Whatever, None)
    }

    /// Best-effort live-entry count, summed across generations.
    pub fn count(&self) -> usize {
        let mut table = unsafe { &*self.current.load(Ordering::SeqCst) };
        let mut total = table.count.load(Ordering::SeqCst).max(0) as usize;
        while let Some(next) = table.next_table() {
            total += next.count.load(Ordering::SeqCst).max(0) as usize;
            table = next;
        }
        total
    }

    /// Best-effort snapshot iteration over the newest generation,
    /// resolving in-flight-copy entries into the next generation --
    /// mirroring `ht_iter_next`'s handling of `COPIED_VALUE`.
    ///
    /// Bumps the generation's reference count for the iterator's
    /// lifetime, so [`HashTable::cas`]'s
    /// `help_and_retire` cannot retire and `defer_free` this generation
    /// out from under a live iterator.
    pub fn iter(&self) -> HashTableIter<'_, K, V> {
        let table = unsafe { &*self.current.load(Ordering::SeqCst) };
        table.references.fetch_add(1, Ordering::SeqCst);
        HashTableIter { table, idx: 0 }
    }
}

/// Best-effort iterator over a [`HashTable`]'s newest generation.
///
/// Holds one reference on `table` (see [`HashTable::iter`]), released on
/// drop.
pub struct HashTableIter<'a, K, V> {
    table: &'a Table<K, V>,
    idx: usize,
}

impl<'a, K, V> Drop for HashTableIter<'a, K, V> {
    fn drop(&mut self) {
        self.table.references.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<'a, K: Hash + Eq + Clone, V: Clone> Iterator for HashTableIter<'a, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.idx >= self.table.len() {
                return None;
            }
            let entry = &self.table.entries[self.idx];
            self.idx += 1;
            let key_ptr = entry.key.load(Ordering::SeqCst);
            if key_ptr.is_null() {
                continue;
            }
            let val = entry.value.load(Ordering::SeqCst);
            if val == ABSENT || val == TOMBSTONE {
                continue;
            }
            let key = unsafe { (*key_ptr).clone() };
            if val == COPIED || is_tagged(val, TAG1) {
                if let Some(next) = self.table.next_table() {
                    let key_hash = hash_key(&key);
                    if let Probe::Found { entry: dst, is_empty: false } = next.lookup(&key, key_hash) {
                        let dst_val = dst.value.load(Ordering::SeqCst);
                        if dst_val != ABSENT && dst_val != TOMBSTONE {
                            return Some((key, load_value(dst_val)));
                        }
                    }
                }
                continue;
            }
            return Some((key, load_value(val)));
        }
    }
}

impl<K, V> Drop for HashTable<K, V> {
    fn drop(&mut self) {
        let mut table_ptr = *self.current.get_mut();
        while !table_ptr.is_null() {
            let mut table = unsafe { Box::from_raw(table_ptr) };
            for entry in table.entries.iter() {
                let key_ptr = entry.key.load(Ordering::Relaxed);
                if !key_ptr.is_null() {
                    unsafe { drop(Box::from_raw(key_ptr)) };
                }
                let val = entry.value.load(Ordering::Relaxed);
                if val != ABSENT && val != TOMBSTONE && val != COPIED {
                    let ptr = strip_tag(val, TAG1);
                    if ptr != ABSENT {
                        unsafe { drop(Box::from_raw(ptr as *mut V)) };
                    }
                }
            }
            table_ptr = *table.next.get_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_crud() {
        let ht: HashTable<i64, i64> = HashTable::new();
        assert_eq!(ht.set(1, 10), None);
        assert_eq!(ht.set(2, 20), None);
        assert_eq!(ht.get(&1), Some(10));
        assert_eq!(ht.set(1, 11), Some(10));
        assert_eq!(ht.remove(&1), Some(11));
        assert_eq!(ht.remove(&1), None);
        assert_eq!(ht.count(), 1);
    }

    #[test]
    fn cas_respects_expectation() {
        let ht: HashTable<i64, i64> = HashTable::new();
        assert_eq!(ht.cas(1, Expectation::Exists, Some(5)), None);
        assert_eq!(ht.cas(1, Expectation::DoesNotExist, Some(5)), None);
        assert_eq!(ht.get(&1), Some(5));
        assert_eq!(ht.cas(1, Expectation::Value(99), Some(6)), Some(5));
        assert_eq!(ht.get(&1), Some(5));
        assert_eq!(ht.cas(1, Expectation::Value(5), Some(6)), Some(5));
        assert_eq!(ht.get(&1), Some(6));
    }

    #[test]
    fn grows_past_initial_scale() {
        let ht: HashTable<i64, i64> = HashTable::new();
        for k in 0..5000 {
            ht.set(k, k * 2);
        }
        assert_eq!(ht.count(), 5000);
        for k in 0..5000 {
            assert_eq!(ht.get(&k), Some(k * 2));
        }
    }

    #[test]
    fn concurrent_growth() {
        use std::sync::Arc;
        use std::thread;

        let ht: Arc<HashTable<i64, i64>> = Arc::new(HashTable::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let ht = Arc::clone(&ht);
            handles.push(thread::spawn(move || {
                for k in (t..20_000).step_by(4) {
                    ht.set(k, k);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ht.count(), 20_000);
        for k in 0..20_000 {
            assert_eq!(ht.get(&k), Some(k));
        }
    }

    #[test]
    fn iteration_sees_inserted_keys() {
        let ht: HashTable<i64, i64> = HashTable::new();
        for k in 0..50 {
            ht.set(k, k);
        }
        let mut seen: Vec<i64> = ht.iter().map(|(k, _)| k).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }
}
