//! IdentityMap: a chained hash table over `Arc` keys held weakly or softly, compared by
//! pointer identity or by value, stamped on every structural change.

use std::hash::{BuildHasher, Hash};
use std::mem;
use std::sync::Arc;

use ahash::RandomState;

use crate::error::{Error, Result};
use crate::reference::{KeySlot, Strength};
use crate::stamped::{next_stamp, Stamped, StampedMap};

// ================================================================================================
// CONSTANTS AND GLOBAL VARIABLES
// ================================================================================================

/// Default number of buckets
const DEFAULT_CAPACITY: usize = 16;

/// Largest bucket count; the table stops growing past this
const MAX_CAPACITY: usize = 1 << 30;

/// Load factor for determining when to resize
pub const DEFAULT_LOAD_FACTOR: f32 = 0.75;

/// Hash reserved for the explicit null key
const NULL_HASH: u64 = 0;

// ================================================================================================
// INTERNAL DATA STRUCTURES
// ================================================================================================

type Link<K, V> = Option<Box<Entry<K, V>>>;

/// Entry in a bucket chain
struct Entry<K, V> {
    key: KeySlot<K>,
    value: V,
    hash: u64,
    next: Link<K, V>,
}

/// How keys are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Equality {
    /// Two keys match only if they are the same allocation.
    #[default]
    Identity,
    /// Two keys match if their referents compare equal.
    Value,
}

// ================================================================================================
// MAIN MAP STRUCTURE
// ================================================================================================

/// Hash map keyed by `Arc<K>` that does not keep its keys alive.
///
/// Entries whose key has been dropped everywhere else are invisible to reads and
/// are purged by the next sweep. The map itself is single-writer; share it
/// through a [`StampedLock`](crate::StampedLock) or an
/// [`IdentityCache`](crate::IdentityCache).
///
/// A value that holds a strong `Arc` of its own key keeps that entry alive for
/// as long as the entry exists.
pub struct IdentityMap<K, V, S = RandomState> {
    table: Vec<Link<K, V>>,
    len: usize,
    threshold: usize,
    load_factor: f32,
    stamp: u64,
    reclaimed: u64,
    mutations_since_sweep: usize,
    equality: Equality,
    strength: Strength,
    hash_fn: fn(&S, &K) -> u64,
    eq_fn: fn(&K, &K) -> bool,
    hasher: S,
}

// ================================================================================================
// CONSTRUCTORS
// ================================================================================================

impl<K, V> IdentityMap<K, V, RandomState> {
    /// Create an empty identity map with weak keys.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an empty identity map with at least `capacity` buckets.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(capacity, DEFAULT_LOAD_FACTOR, Strength::Weak, RandomState::new())
    }

    /// Create an empty identity map holding keys with the given strength.
    pub fn with_strength(strength: Strength) -> Self {
        Self::build(DEFAULT_CAPACITY, DEFAULT_LOAD_FACTOR, strength, RandomState::new())
    }

    /// Create an empty identity map with at least `capacity` buckets and the given key strength.
    pub fn with_capacity_and_strength(capacity: usize, strength: Strength) -> Self {
        Self::build(capacity, DEFAULT_LOAD_FACTOR, strength, RandomState::new())
    }
}

impl<K, V, S: BuildHasher> IdentityMap<K, V, S> {
    /// Create an empty identity map using the provided hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self::build(DEFAULT_CAPACITY, DEFAULT_LOAD_FACTOR, Strength::Weak, hasher)
    }

    /// Create an empty identity map with every knob set explicitly.
    ///
    /// Fails if `load_factor` is not a finite positive number or `capacity` exceeds
    /// the largest supported table.
    pub fn with_config(
        capacity: usize,
        load_factor: f32,
        strength: Strength,
        hasher: S,
    ) -> Result<Self> {
        if !load_factor.is_finite() || load_factor <= 0.0 {
            return Err(Error::invalid_argument(format!(
                "load factor must be finite and positive, got {load_factor}"
            )));
        }
        if capacity > MAX_CAPACITY {
            return Err(Error::invalid_argument(format!(
                "capacity {capacity} exceeds maximum {MAX_CAPACITY}"
            )));
        }
        Ok(Self::build(capacity, load_factor, strength, hasher))
    }

    fn build(capacity: usize, load_factor: f32, strength: Strength, hasher: S) -> Self {
        let len = table_len_for(capacity);
        Self {
            table: empty_table(len),
            len: 0,
            threshold: threshold_for(len, load_factor),
            load_factor,
            stamp: next_stamp(),
            reclaimed: 0,
            mutations_since_sweep: 0,
            equality: Equality::Identity,
            strength,
            hash_fn: identity_hash::<K, S>,
            eq_fn: identity_eq::<K>,
            hasher,
        }
    }

    // ============================================================================================
    // CONFIGURATION
    // ============================================================================================

    /// Current equality mode.
    pub fn equality(&self) -> Equality {
        self.equality
    }

    /// Reference strength used for new entries.
    pub fn strength(&self) -> Strength {
        self.strength
    }

    /// Switch to pointer-identity comparison. Only allowed while the map is empty.
    pub fn use_identity_equality(&mut self) -> Result<()> {
        self.ensure_empty_for_mode_change()?;
        self.equality = Equality::Identity;
        self.hash_fn = identity_hash::<K, S>;
        self.eq_fn = identity_eq::<K>;
        Ok(())
    }

    fn ensure_empty_for_mode_change(&mut self) -> Result<()> {
        self.sweep();
        if self.len != 0 {
            return Err(Error::invalid_argument(format!(
                "equality mode can only change while the map is empty ({} entries)",
                self.len
            )));
        }
        Ok(())
    }

    // ============================================================================================
    // PUBLIC API METHODS
    // ============================================================================================

    /// Get a clone of the value mapped to `key`.
    ///
    /// Never returns a value whose key has been reclaimed, even before it is purged.
    pub fn get(&self, key: &Arc<K>) -> Option<V>
    where
        V: Clone,
    {
        let hash = (self.hash_fn)(&self.hasher, &**key);
        self.find(Some(key), hash).map(|e| e.value.clone())
    }

    /// Get a clone of the value mapped to the null key.
    pub fn get_null(&self) -> Option<V>
    where
        V: Clone,
    {
        self.find(None, NULL_HASH).map(|e| e.value.clone())
    }

    /// Check whether `key` is mapped.
    pub fn contains_key(&self, key: &Arc<K>) -> bool {
        let hash = (self.hash_fn)(&self.hasher, &**key);
        self.find(Some(key), hash).is_some()
    }

    /// Check whether the null key is mapped.
    pub fn contains_null_key(&self) -> bool {
        self.find(None, NULL_HASH).is_some()
    }

    /// Map `key` to `value`, returning the previous value.
    ///
    /// The map only holds `key` weakly (or softly); the caller keeps it alive.
    pub fn insert(&mut self, key: Arc<K>, value: V) -> Option<V> {
        self.expunge_stale();
        let hash = (self.hash_fn)(&self.hasher, &*key);
        self.put(Some(&key), hash, value)
    }

    /// Map the null key to `value`, returning the previous value.
    pub fn insert_null(&mut self, value: V) -> Option<V> {
        self.expunge_stale();
        self.put(None, NULL_HASH, value)
    }

    /// Remove the mapping for `key`, returning its value.
    pub fn remove(&mut self, key: &Arc<K>) -> Option<V> {
        self.expunge_stale();
        let hash = (self.hash_fn)(&self.hasher, &**key);
        self.unlink(Some(key), hash)
    }

    /// Remove the mapping for the null key, returning its value.
    pub fn remove_null(&mut self) -> Option<V> {
        self.expunge_stale();
        self.unlink(None, NULL_HASH)
    }

    /// Number of entries not yet purged.
    ///
    /// Entries whose key was reclaimed still count until a sweep removes them;
    /// call [`purge`](Self::purge) first for an exact live count.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current number of buckets.
    pub fn capacity(&self) -> usize {
        self.table.len()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.sweep();
        if self.len == 0 {
            return;
        }
        for bucket in self.table.iter_mut() {
            drop_chain(bucket.take());
        }
        self.len = 0;
        self.bump();
    }

    /// Remove every entry whose key has been reclaimed.
    ///
    /// Returns the number of entries removed; the same number is added to
    /// [`reclaimed_count`](Self::reclaimed_count).
    pub fn purge(&mut self) -> usize {
        self.sweep()
    }

    /// Total number of entries purged over the map's lifetime.
    pub fn reclaimed_count(&self) -> u64 {
        self.reclaimed
    }

    /// Signal memory pressure: release every soft key the map alone still owns.
    ///
    /// Returns the number of keys released. Their entries are removed by the next sweep.
    pub fn reclaim_soft_references(&mut self) -> usize {
        let mut released = 0;
        for bucket in self.table.iter_mut() {
            let mut cur = bucket.as_deref_mut();
            while let Some(e) = cur {
                if e.key.release_if_unshared() {
                    released += 1;
                }
                cur = e.next.as_deref_mut();
            }
        }
        if released > 0 {
            tracing::debug!(released, "released unshared soft keys");
        }
        released
    }

    /// Stamp that changes on every structural modification and never repeats.
    pub fn modification_stamp(&self) -> u64 {
        self.stamp
    }

    /// Iterate over live entries. The null key is yielded as `None`.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            table: &self.table,
            bucket: 0,
            cur: None,
        }
    }

    /// Iterate over live keys. The null key is yielded as `None`.
    pub fn keys(&self) -> impl Iterator<Item = Option<Arc<K>>> + '_ {
        self.iter().map(|(k, _)| k)
    }

    /// Iterate over the values of live entries.
    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.iter().map(|(_, v)| v)
    }

    /// Fail-fast cursor that does not borrow the map between steps.
    pub fn cursor(&self) -> Cursor {
        Cursor {
            bucket: 0,
            depth: 0,
            expected: self.stamp,
        }
    }

    // ============================================================================================
    // PRIVATE HELPER METHODS
    // ============================================================================================

    #[inline(always)]
    fn index_for(&self, hash: u64) -> usize {
        (hash as usize) & (self.table.len() - 1)
    }

    #[inline(always)]
    fn bump(&mut self) {
        self.stamp = next_stamp();
    }

    fn find(&self, key: Option<&Arc<K>>, hash: u64) -> Option<&Entry<K, V>> {
        let mut cur = self.table[self.index_for(hash)].as_deref();
        while let Some(e) = cur {
            if e.hash == hash && slot_matches(&e.key, key, self.eq_fn) {
                return Some(e);
            }
            cur = e.next.as_deref();
        }
        None
    }

    fn put(&mut self, key: Option<&Arc<K>>, hash: u64, value: V) -> Option<V> {
        let idx = self.index_for(hash);
        let eq = self.eq_fn;
        let mut cur = self.table[idx].as_deref_mut();
        while let Some(e) = cur {
            if e.hash == hash && slot_matches(&e.key, key, eq) {
                return Some(mem::replace(&mut e.value, value));
            }
            cur = e.next.as_deref_mut();
        }

        let slot = match key {
            Some(k) => KeySlot::new(k, self.strength),
            None => KeySlot::Null,
        };
        let next = self.table[idx].take();
        self.table[idx] = Some(Box::new(Entry {
            key: slot,
            value,
            hash,
            next,
        }));
        self.len += 1;
        self.bump();
        if self.len > self.threshold {
            self.resize(self.table.len() * 2);
        }
        None
    }

    fn unlink(&mut self, key: Option<&Arc<K>>, hash: u64) -> Option<V> {
        let idx = self.index_for(hash);
        let eq = self.eq_fn;
        let removed = unlink_first(&mut self.table[idx], |e| {
            e.hash == hash && slot_matches(&e.key, key, eq)
        })?;
        self.len -= 1;
        self.bump();
        Some(removed.value)
    }

    /// Amortized sweep: one full pass per table-length mutations keeps each operation O(1).
    #[inline(always)]
    fn expunge_stale(&mut self) {
        self.mutations_since_sweep += 1;
        if self.mutations_since_sweep >= self.table.len() {
            self.sweep();
        }
    }

    fn sweep(&mut self) -> usize {
        let mut removed = 0usize;
        for bucket in self.table.iter_mut() {
            let mut chain = bucket.take();
            while let Some(mut e) = chain {
                chain = e.next.take();
                if e.key.is_cleared() {
                    removed += 1;
                } else {
                    e.next = bucket.take();
                    *bucket = Some(e);
                }
            }
        }
        self.mutations_since_sweep = 0;
        if removed > 0 {
            self.len -= removed;
            self.reclaimed += removed as u64;
            self.bump();
            tracing::debug!(removed, live = self.len, "purged reclaimed entries");
        }
        removed
    }

    fn resize(&mut self, new_len: usize) {
        let old_len = self.table.len();
        if old_len >= MAX_CAPACITY {
            self.threshold = usize::MAX;
            return;
        }
        let old = mem::replace(&mut self.table, empty_table(new_len));
        let mut dropped = 0usize;
        for mut chain in old {
            while let Some(mut e) = chain {
                chain = e.next.take();
                if e.key.is_cleared() {
                    dropped += 1;
                    continue;
                }
                let idx = (e.hash as usize) & (new_len - 1);
                e.next = self.table[idx].take();
                self.table[idx] = Some(e);
            }
        }
        self.len -= dropped;
        self.reclaimed += dropped as u64;
        self.threshold = threshold_for(new_len, self.load_factor);
        self.bump();
        tracing::debug!(old_len, new_len, dropped, "identity map resized");
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> IdentityMap<K, V, S> {
    /// Switch to value comparison. Only allowed while the map is empty.
    pub fn use_value_equality(&mut self) -> Result<()> {
        self.ensure_empty_for_mode_change()?;
        self.equality = Equality::Value;
        self.hash_fn = value_hash::<K, S>;
        self.eq_fn = value_eq::<K>;
        Ok(())
    }
}

// ================================================================================================
// STAMPED MAP INTEGRATION
// ================================================================================================

impl<K, V, S: BuildHasher> Stamped for IdentityMap<K, V, S> {
    fn modification_stamp(&self) -> u64 {
        self.stamp
    }
}

impl<K, V: Clone, S: BuildHasher> StampedMap for IdentityMap<K, V, S> {
    type Key = Arc<K>;
    type Value = V;

    fn get(&self, key: &Arc<K>) -> Option<V> {
        IdentityMap::get(self, key)
    }

    fn insert(&mut self, key: Arc<K>, value: V) -> Option<V> {
        IdentityMap::insert(self, key, value)
    }

    fn remove(&mut self, key: &Arc<K>) -> Option<V> {
        IdentityMap::remove(self, key)
    }
}

// ================================================================================================
// DROP AND STANDARD TRAIT IMPLEMENTATIONS
// ================================================================================================

impl<K, V, S> Drop for IdentityMap<K, V, S> {
    fn drop(&mut self) {
        // Unlink chains iteratively so long chains never recurse through Box drops.
        for bucket in self.table.iter_mut() {
            drop_chain(bucket.take());
        }
    }
}

impl<K, V> Default for IdentityMap<K, V, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> std::fmt::Debug for IdentityMap<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap")
            .field("len", &self.len)
            .field("capacity", &self.table.len())
            .field("equality", &self.equality)
            .field("strength", &self.strength)
            .field("stamp", &self.stamp)
            .field("reclaimed", &self.reclaimed)
            .finish()
    }
}

// ================================================================================================
// UTILITY FUNCTIONS
// ================================================================================================

fn identity_hash<K, S: BuildHasher>(hasher: &S, key: &K) -> u64 {
    hasher.hash_one(key as *const K as usize)
}

fn value_hash<K: Hash, S: BuildHasher>(hasher: &S, key: &K) -> u64 {
    hasher.hash_one(key)
}

fn identity_eq<K>(a: &K, b: &K) -> bool {
    std::ptr::eq(a, b)
}

fn value_eq<K: Eq>(a: &K, b: &K) -> bool {
    a == b
}

#[inline(always)]
fn slot_matches<K>(slot: &KeySlot<K>, key: Option<&Arc<K>>, eq: fn(&K, &K) -> bool) -> bool {
    match key {
        None => slot.is_null(),
        Some(k) => slot.upgrade().is_some_and(|held| eq(&*held, &**k)),
    }
}

fn unlink_first<K, V>(
    head: &mut Link<K, V>,
    mut hit: impl FnMut(&Entry<K, V>) -> bool,
) -> Option<Box<Entry<K, V>>> {
    let mut link = head;
    loop {
        match link.as_deref() {
            None => return None,
            Some(e) if hit(e) => break,
            Some(_) => {}
        }
        link = &mut link.as_mut()?.next;
    }
    let mut removed = link.take()?;
    *link = removed.next.take();
    Some(removed)
}

fn drop_chain<K, V>(mut chain: Link<K, V>) {
    while let Some(mut e) = chain {
        chain = e.next.take();
    }
}

fn empty_table<K, V>(len: usize) -> Vec<Link<K, V>> {
    std::iter::repeat_with(|| None).take(len).collect()
}

fn table_len_for(capacity: usize) -> usize {
    capacity.clamp(1, MAX_CAPACITY).next_power_of_two()
}

fn threshold_for(table_len: usize, load_factor: f32) -> usize {
    ((table_len as f64) * (load_factor as f64)) as usize
}

// ================================================================================================
// ITERATOR IMPLEMENTATIONS
// ================================================================================================

/// Borrowing iterator over the live entries of an [`IdentityMap`].
pub struct Iter<'a, K, V> {
    table: &'a [Link<K, V>],
    bucket: usize,
    cur: Option<&'a Entry<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (Option<Arc<K>>, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            while self.cur.is_none() {
                let head = self.table.get(self.bucket)?;
                self.cur = head.as_deref();
                self.bucket += 1;
            }
            let e = self.cur?;
            self.cur = e.next.as_deref();
            if e.key.is_null() {
                return Some((None, &e.value));
            }
            if let Some(k) = e.key.upgrade() {
                return Some((Some(k), &e.value));
            }
        }
    }
}

/// Position in an [`IdentityMap`] that survives releasing the borrow.
///
/// Each step re-validates the map's modification stamp and fails with
/// [`Error::ConcurrentModification`] once the map has been structurally changed.
#[derive(Debug, Clone)]
pub struct Cursor {
    bucket: usize,
    depth: usize,
    expected: u64,
}

impl Cursor {
    /// Advance to the next live entry, cloning it out of the map.
    pub fn next<K, V: Clone, S>(
        &mut self,
        map: &IdentityMap<K, V, S>,
    ) -> Result<Option<(Option<Arc<K>>, V)>> {
        if map.stamp != self.expected {
            return Err(Error::ConcurrentModification {
                expected: self.expected,
                actual: map.stamp,
            });
        }
        while let Some(head) = map.table.get(self.bucket) {
            let mut cur = head.as_deref();
            for _ in 0..self.depth {
                cur = cur.and_then(|e| e.next.as_deref());
            }
            match cur {
                None => {
                    self.bucket += 1;
                    self.depth = 0;
                }
                Some(e) => {
                    self.depth += 1;
                    if e.key.is_null() {
                        return Ok(Some((None, e.value.clone())));
                    }
                    if let Some(k) = e.key.upgrade() {
                        return Ok(Some((Some(k), e.value.clone())));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Stamp the cursor was created against.
    pub fn expected_stamp(&self) -> u64 {
        self.expected
    }
}
