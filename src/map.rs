//! Uniform map façade (C9) over the three backend structures.
//!
//! One `get`/`set`/`add`/`cas`/`replace`/`remove`/`iter` surface shared
//! by all three backends. The idiomatic Rust equivalent of a
//! function-pointer vtable dispatched at runtime is a trait dispatched
//! statically, preferring generics over trait objects at enumerable
//! call sites (see `malloc.rs`'s `Allocator` type parameter).

use crate::hashtable::{HashTable, HashTableIter};
use crate::list::{Expectation, ListIter, OrderedList};
use crate::skiplist::{SkipList, SkipListIter};

/// The uniform operations every backend exposes.
///
/// Absence becomes `Option::None` throughout -- Rust has no
/// reserved-sentinel problem, so there is no separate "not found"
/// error kind, only `None` vs. a CAS-observed-value vs. a genuine
/// error (via [`crate::error::MapError`] at the call sites that need
/// one).
pub trait Map<K, V> {
    /// The iterator type this backend's [`Map::iter`] returns.
    type Iter<'a>: Iterator<Item = (K, V)>
    where
        Self: 'a;

    /// Look up `key`.
    fn get(&self, key: &K) -> Option<V>;

    /// Insert or overwrite `key`. Returns the previous value, if any.
    fn set(&self, key: K, value: V) -> Option<V>;

    /// Insert `key` only if it is absent. `Err(value)` returns the
    /// caller's value back unconsumed when `key` was already present.
    fn add(&self, key: K, value: V) -> Result<(), V>;

    /// Compare-and-swap. Returns the value observed before this call;
    /// success is the caller's own comparison of the returned value
    /// against `expect`, not a separate bool.
    fn cas(&self, key: K, expect: Expectation<V>, new: V) -> Option<V>;

    /// Overwrite `key` only if it is already present.
    fn replace(&self, key: K, value: V) -> Option<V>;

    /// Remove `key`. Returns the removed value, if any.
    fn remove(&self, key: &K) -> Option<V>;

    /// Best-effort live-entry count.
    fn count(&self) -> usize;

    /// Best-effort snapshot-style iteration: not consistent with
    /// concurrent writes.
    fn iter(&self) -> Self::Iter<'_>;
}

impl<K, V> Map<K, V> for OrderedList<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    type Iter<'a>
        = ListIter<'a, K, V>
    where
        Self: 'a;

    fn get(&self, key: &K) -> Option<V> {
        self.lookup(key)
    }

    fn set(&self, key: K, value: V) -> Option<V> {
        self.cas(key, Expectation::Whatever, value)
    }

    fn add(&self, key: K, value: V) -> Result<(), V> {
        match self.cas(key, Expectation::DoesNotExist, value) {
            None => Ok(()),
            Some(_existing) => Err(_existing),
        }
    }

    fn cas(&self, key: K, expect: Expectation<V>, new: V) -> Option<V> {
        OrderedList::cas(self, key, expect, new)
    }

    fn replace(&self, key: K, value: V) -> Option<V> {
        self.cas(key, Expectation::Exists, value)
    }

    fn remove(&self, key: &K) -> Option<V> {
        OrderedList::remove(self, key)
    }

    fn count(&self) -> usize {
        OrderedList::count(self)
    }

    fn iter(&self) -> Self::Iter<'_> {
        OrderedList::iter(self)
    }
}

impl<K, V> Map<K, V> for SkipList<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    type Iter<'a>
        = SkipListIter<'a, K, V>
    where
        Self: 'a;

    fn get(&self, key: &K) -> Option<V> {
        self.lookup(key)
    }

    fn set(&self, key: K, value: V) -> Option<V> {
        self.cas(key, Expectation::Whatever, value)
    }

    fn add(&self, key: K, value: V) -> Result<(), V> {
        match SkipList::cas(self, key, Expectation::DoesNotExist, value) {
            None => Ok(()),
            Some(existing) => Err(existing),
        }
    }

    fn cas(&self, key: K, expect: Expectation<V>, new: V) -> Option<V> {
        SkipList::cas(self, key, expect, new)
    }

    fn replace(&self, key: K, value: V) -> Option<V> {
        SkipList::cas(self, key, Expectation::Exists, value)
    }

    fn remove(&self, key: &K) -> Option<V> {
        SkipList::remove(self, key)
    }

    fn count(&self) -> usize {
        SkipList::count(self)
    }

    fn iter(&self) -> Self::Iter<'_> {
        SkipList::iter(self)
    }
}

impl<K, V> Map<K, V> for HashTable<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    type Iter<'a>
        = HashTableIter<'a, K, V>
    where
        Self: 'a;

    fn get(&self, key: &K) -> Option<V> {
        HashTable::get(self, key)
    }

    fn set(&self, key: K, value: V) -> Option<V> {
        HashTable::set(self, key, value)
    }

    fn add(&self, key: K, value: V) -> Result<(), V> {
        match HashTable::cas(self, key, Expectation::DoesNotExist, Some(value)) {
            None => Ok(()),
            Some(existing) => Err(existing),
        }
    }

    fn cas(&self, key: K, expect: Expectation<V>, new: V) -> Option<V> {
        HashTable::cas(self, key, expect, Some(new))
    }

    fn replace(&self, key: K, value: V) -> Option<V> {
        HashTable::cas(self, key, Expectation::Exists, Some(value))
    }

    fn remove(&self, key: &K) -> Option<V> {
        HashTable::remove(self, key)
    }

    fn count(&self) -> usize {
        HashTable::count(self)
    }

    fn iter(&self) -> Self::Iter<'_> {
        HashTable::iter(self)
    }
}

/// A statically-dispatched handle over the three backends, so callers
/// can pick a backend at construction time without paying for a trait
/// object. Mirrors `map_alloc(impl, ...)` choosing an implementation
/// vtable at allocation time.
pub enum MapHandle<K, V> {
    /// Backed by the ordered list (C6). Best for small maps or
    /// workloads that want strictly-ordered iteration.
    List(OrderedList<K, V>),
    /// Backed by the skiplist (C7). Logarithmic search with ordered
    /// iteration at larger sizes.
    Skip(SkipList<K, V>),
    /// Backed by the resizable hash table (C8). Best raw throughput,
    /// unordered iteration.
    Hash(HashTable<K, V>),
}

impl<K, V> MapHandle<K, V>
where
    K: Ord + Clone + std::hash::Hash,
    V: Clone + PartialEq,
{
    /// Build a handle over the ordered list backend.
    pub fn list() -> Self {
        MapHandle::List(OrderedList::new())
    }

    /// Build a handle over the skiplist backend.
    pub fn skiplist() -> Self {
        MapHandle::Skip(SkipList::new())
    }

    /// Build a handle over the hash table backend.
    pub fn hashtable() -> Self {
        MapHandle::Hash(HashTable::new())
    }

    /// Whether this handle's backend tracks `count()` cheaply. All
    /// three backends here do; kept for parity with the "unsupported
    /// configuration" error kind, which a future backend (e.g. an
    /// unsafe single-threaded one) could legitimately return for
    /// operations it does not track.
    pub fn supports_count(&self) -> bool {
        true
    }

    /// Declare the calling thread quiescent with respect to this map's
    /// reclamation domain. Read-only workloads that never observe a
    /// retry/helping event on their own do not otherwise get a natural
    /// point to call [`crate::reclaim::epoch::update`]; callers on a
    /// long-lived read path should tick this periodically so deferred
    /// frees from concurrent writers are not held onto indefinitely.
    pub fn maintain(&self) {
        crate::reclaim::epoch::update();
    }
}

impl<K, V> Map<K, V> for MapHandle<K, V>
where
    K: Ord + Clone + std::hash::Hash,
    V: Clone + PartialEq,
{
    type Iter<'a>
        = MapHandleIter<'a, K, V>
    where
        Self: 'a;

    fn get(&self, key: &K) -> Option<V> {
        match self {
            MapHandle::List(m) => Map::get(m, key),
            MapHandle::Skip(m) => Map::get(m, key),
            MapHandle::Hash(m) => Map::get(m, key),
        }
    }

    fn set(&self, key: K, value: V) -> Option<V> {
        match self {
            MapHandle::List(m) => Map::set(m, key, value),
            MapHandle::Skip(m) => Map::set(m, key, value),
            MapHandle::Hash(m) => Map::set(m, key, value),
        }
    }

    fn add(&self, key: K, value: V) -> Result<(), V> {
        match self {
            MapHandle::List(m) => Map::add(m, key, value),
            MapHandle::Skip(m) => Map::add(m, key, value),
            MapHandle::Hash(m) => Map::add(m, key, value),
        }
    }

    fn cas(&self, key: K, expect: Expectation<V>, new: V) -> Option<V> {
        match self {
            MapHandle::List(m) => Map::cas(m, key, expect, new),
            MapHandle::Skip(m) => Map::cas(m, key, expect, new),
            MapHandle::Hash(m) => Map::cas(m, key, expect, new),
        }
    }

    fn replace(&self, key: K, value: V) -> Option<V> {
        match self {
            MapHandle::List(m) => Map::replace(m, key, value),
            MapHandle::Skip(m) => Map::replace(m, key, value),
            MapHandle::Hash(m) => Map::replace(m, key, value),
        }
    }

    fn remove(&self, key: &K) -> Option<V> {
        match self {
            MapHandle::List(m) => Map::remove(m, key),
            MapHandle::Skip(m) => Map::remove(m, key),
            MapHandle::Hash(m) => Map::remove(m, key),
        }
    }

    fn count(&self) -> usize {
        match self {
            MapHandle::List(m) => Map::count(m),
            MapHandle::Skip(m) => Map::count(m),
            MapHandle::Hash(m) => Map::count(m),
        }
    }

    fn iter(&self) -> Self::Iter<'_> {
        match self {
            MapHandle::List(m) => MapHandleIter::List(Map::iter(m)),
            MapHandle::Skip(m) => MapHandleIter::Skip(Map::iter(m)),
            MapHandle::Hash(m) => MapHandleIter::Hash(Map::iter(m)),
        }
    }
}

/// The iterator returned by [`MapHandle::iter`], enumerating over
/// whichever backend variant is active.
pub enum MapHandleIter<'a, K, V> {
    List(ListIter<'a, K, V>),
    Skip(SkipListIter<'a, K, V>),
    Hash(HashTableIter<'a, K, V>),
}

impl<'a, K, V> Iterator for MapHandleIter<'a, K, V>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            MapHandleIter::List(it) => it.next(),
            MapHandleIter::Skip(it) => it.next(),
            MapHandleIter::Hash(it) => it.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic_crud_via_trait<M: Map<&'static str, i64>>(m: M) {
        assert_eq!(m.add("a", 10), Ok(()));
        assert_eq!(m.add("b", 20), Ok(()));
        assert_eq!(m.get(&"b"), Some(20));
        assert_eq!(m.set("a", 11), Some(10));
        assert_eq!(m.add("b", 22), Err(20));
        assert_eq!(m.remove(&"a"), Some(11));
        assert_eq!(m.remove(&"a"), None);
        assert_eq!(m.count(), 1);
    }

    #[test]
    fn list_backend_matches_s1() {
        basic_crud_via_trait(MapHandle::<&'static str, i64>::list());
    }

    #[test]
    fn skiplist_backend_matches_s1() {
        basic_crud_via_trait(MapHandle::<&'static str, i64>::skiplist());
    }

    #[test]
    fn hashtable_backend_matches_s1() {
        basic_crud_via_trait(MapHandle::<&'static str, i64>::hashtable());
    }
}
