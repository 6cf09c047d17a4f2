//! Stamped structures and the stamped reader/writer lock that guards them.
//!
//! A stamped structure exposes a modification stamp that changes, uniquely, on
//! every structural mutation. The lock-upgrade protocol in [`crate::upgrade`]
//! uses it to detect interference across the window where no lock is held.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ahash::RandomState;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::interrupt::{deadline_after, take_raised, wake_at, Interrupt};

// Process-wide source of modification stamps, so no two mutations anywhere share one.
static NEXT_STAMP: AtomicU64 = AtomicU64::new(1);

#[inline(always)]
pub(crate) fn next_stamp() -> u64 {
    NEXT_STAMP.fetch_add(1, Ordering::Relaxed)
}

// ================================================================================================
// STAMPED STRUCTURE TRAITS
// ================================================================================================

/// A structure whose modification stamp changes on every structural mutation.
pub trait Stamped {
    /// Current modification stamp. Never repeats within the process.
    fn modification_stamp(&self) -> u64;
}

/// Map-like stamped structure the lock-upgrade protocol can drive.
pub trait StampedMap: Stamped {
    type Key;
    type Value: Clone;

    fn get(&self, key: &Self::Key) -> Option<Self::Value>;

    fn insert(&mut self, key: Self::Key, value: Self::Value) -> Option<Self::Value>;

    fn remove(&mut self, key: &Self::Key) -> Option<Self::Value>;
}

/// Strongly keyed hash map carrying a modification stamp.
pub struct StampedHashMap<K, V, S = RandomState> {
    inner: HashMap<K, V, S>,
    stamp: u64,
}

impl<K: Eq + Hash, V> StampedHashMap<K, V, RandomState> {
    /// Empty map with the default hasher.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }
}

impl<K: Eq + Hash, V, S: BuildHasher> StampedHashMap<K, V, S> {
    /// Empty map hashing with `hasher`.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            inner: HashMap::with_hasher(hasher),
            stamp: next_stamp(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Whether `key` has an entry.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Entries in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.inner.iter()
    }

    /// Remove every entry. Only a non-empty map gets a new stamp.
    pub fn clear(&mut self) {
        if !self.inner.is_empty() {
            self.inner.clear();
            self.stamp = next_stamp();
        }
    }
}

impl<K: Eq + Hash, V> Default for StampedHashMap<K, V, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Stamped for StampedHashMap<K, V, S> {
    fn modification_stamp(&self) -> u64 {
        self.stamp
    }
}

impl<K: Eq + Hash, V: Clone, S: BuildHasher> StampedMap for StampedHashMap<K, V, S> {
    type Key = K;
    type Value = V;

    fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).cloned()
    }

    fn insert(&mut self, key: K, value: V) -> Option<V> {
        let old = self.inner.insert(key, value);
        if old.is_none() {
            self.stamp = next_stamp();
        }
        old
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let old = self.inner.remove(key);
        if old.is_some() {
            self.stamp = next_stamp();
        }
        old
    }
}

// ================================================================================================
// LOCK STAMPS
// ================================================================================================

/// What a [`LockStamp`] grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampMode {
    /// No lock held.
    Unlocked,
    /// Shared read, held optimistically in the hope no write is needed.
    Read,
    /// Exclusive write.
    Write,
}

/// Opaque token describing a lock state and the lock version it was observed at.
///
/// The version advances every time a write stamp is released, so two stamps with
/// equal versions saw no completed write in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStamp {
    mode: StampMode,
    version: u64,
}

impl LockStamp {
    /// What the lock granted when the stamp was taken.
    pub fn mode(&self) -> StampMode {
        self.mode
    }

    /// Lock version the stamp was taken at.
    pub fn version(&self) -> u64 {
        self.version
    }
}

// ================================================================================================
// STAMPED LOCK
// ================================================================================================

struct StampState {
    readers: usize,
    writer: bool,
    version: u64,
}

/// Reader/writer lock owning a value, with in-place read-to-write conversion.
///
/// Not reentrant: a thread holding a stamp must not acquire another stamp on the
/// same lock, or it can wait on itself until its budget runs out.
pub struct StampedLock<T> {
    state: Mutex<StampState>,
    cond: Condvar,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only handed out through ReadStamp (shared) and WriteStamp
// (exclusive), whose existence is accounted for in `state` under the mutex.
unsafe impl<T: Send> Send for StampedLock<T> {}
unsafe impl<T: Send + Sync> Sync for StampedLock<T> {}

impl<T> StampedLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(StampState {
                readers: 0,
                writer: false,
                version: 0,
            }),
            cond: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire a read stamp, waiting as long as it takes.
    pub fn read(&self) -> ReadStamp<'_, T> {
        let mut st = self.state.lock();
        while st.writer {
            self.cond.wait(&mut st);
        }
        st.readers += 1;
        ReadStamp::issue(self, st.version)
    }

    /// Acquire a write stamp, waiting as long as it takes.
    pub fn write(&self) -> WriteStamp<'_, T> {
        let mut st = self.state.lock();
        while st.writer || st.readers > 0 {
            self.cond.wait(&mut st);
        }
        st.writer = true;
        WriteStamp::issue(self, st.version)
    }

    /// Acquire a read stamp only if no writer holds the lock.
    pub fn try_read(&self) -> Option<ReadStamp<'_, T>> {
        let mut st = self.state.lock();
        if st.writer {
            return None;
        }
        st.readers += 1;
        Some(ReadStamp::issue(self, st.version))
    }

    /// Acquire a write stamp only if the lock is free.
    pub fn try_write(&self) -> Option<WriteStamp<'_, T>> {
        let mut st = self.state.lock();
        if st.writer || st.readers > 0 {
            return None;
        }
        st.writer = true;
        Some(WriteStamp::issue(self, st.version))
    }

    /// Acquire a read stamp within `timeout`. A timeout too large for a deadline waits without one.
    pub fn try_read_for(&self, timeout: Duration) -> Result<ReadStamp<'_, T>> {
        self.try_read_until(deadline_after(timeout), None)
    }

    /// Acquire a write stamp within `timeout`.
    pub fn try_write_for(&self, timeout: Duration) -> Result<WriteStamp<'_, T>> {
        self.try_write_until(deadline_after(timeout), None)
    }

    /// Acquire a read stamp before `deadline` (if any), giving up when `interrupt` is raised.
    pub fn try_read_until(
        &self,
        deadline: Option<Instant>,
        interrupt: Option<&Interrupt>,
    ) -> Result<ReadStamp<'_, T>> {
        let mut st = self.wait_until(deadline, interrupt, "stamped read lock", |s| !s.writer)?;
        st.readers += 1;
        Ok(ReadStamp::issue(self, st.version))
    }

    /// Acquire a write stamp before `deadline` (if any), giving up when `interrupt` is raised.
    pub fn try_write_until(
        &self,
        deadline: Option<Instant>,
        interrupt: Option<&Interrupt>,
    ) -> Result<WriteStamp<'_, T>> {
        let mut st = self.wait_until(deadline, interrupt, "stamped write lock", |s| {
            !s.writer && s.readers == 0
        })?;
        st.writer = true;
        Ok(WriteStamp::issue(self, st.version))
    }

    /// Snapshot of the lock state.
    pub fn stamp(&self) -> LockStamp {
        let st = self.state.lock();
        let mode = if st.writer {
            StampMode::Write
        } else if st.readers > 0 {
            StampMode::Read
        } else {
            StampMode::Unlocked
        };
        LockStamp {
            mode,
            version: st.version,
        }
    }

    /// Number of completed writes so far.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Whether a write stamp is outstanding.
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer
    }

    /// Number of outstanding read stamps.
    pub fn read_count(&self) -> usize {
        self.state.lock().readers
    }

    /// Exclusive access without locking; the borrow checker proves nobody holds a stamp.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn wait_until<F>(
        &self,
        deadline: Option<Instant>,
        interrupt: Option<&Interrupt>,
        what: &'static str,
        admit: F,
    ) -> Result<MutexGuard<'_, StampState>>
    where
        F: Fn(&StampState) -> bool,
    {
        let started = Instant::now();
        let mut st = self.state.lock();
        loop {
            if take_raised(interrupt) {
                return Err(Error::Interrupted { what });
            }
            if admit(&*st) {
                return Ok(st);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::debug!(what, waited = ?started.elapsed(), "lock acquisition timed out");
                return Err(Error::Timeout {
                    what,
                    waited: started.elapsed(),
                });
            }
            match wake_at(deadline, interrupt) {
                Some(at) => {
                    let _ = self.cond.wait_until(&mut st, at);
                }
                None => self.cond.wait(&mut st),
            }
        }
    }

    fn release_read(&self) {
        let mut st = self.state.lock();
        st.readers -= 1;
        if st.readers == 0 {
            drop(st);
            self.cond.notify_all();
        }
    }

    fn release_write(&self) {
        let mut st = self.state.lock();
        st.writer = false;
        st.version += 1;
        drop(st);
        self.cond.notify_all();
    }
}

impl<T: Default> Default for StampedLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// ================================================================================================
// STAMP GUARDS
// ================================================================================================

/// Shared access to a [`StampedLock`]'s value. Released on drop.
pub struct ReadStamp<'a, T> {
    lock: &'a StampedLock<T>,
    stamp: LockStamp,
}

impl<'a, T> ReadStamp<'a, T> {
    fn issue(lock: &'a StampedLock<T>, version: u64) -> Self {
        Self {
            lock,
            stamp: LockStamp {
                mode: StampMode::Read,
                version,
            },
        }
    }

    pub fn stamp(&self) -> LockStamp {
        self.stamp
    }

    /// Convert to a write stamp in place. Succeeds only if this is the sole reader;
    /// otherwise the read stamp is handed back untouched.
    pub fn try_convert(self) -> std::result::Result<WriteStamp<'a, T>, Self> {
        let lock = self.lock;
        let mut st = lock.state.lock();
        if st.readers != 1 || st.writer {
            drop(st);
            return Err(self);
        }
        st.readers = 0;
        st.writer = true;
        let version = st.version;
        drop(st);
        mem::forget(self);
        Ok(WriteStamp::issue(lock, version))
    }
}

impl<T> Deref for ReadStamp<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a read stamp excludes every write stamp.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadStamp<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// Exclusive access to a [`StampedLock`]'s value. Released on drop.
pub struct WriteStamp<'a, T> {
    lock: &'a StampedLock<T>,
    stamp: LockStamp,
}

impl<'a, T> WriteStamp<'a, T> {
    fn issue(lock: &'a StampedLock<T>, version: u64) -> Self {
        Self {
            lock,
            stamp: LockStamp {
                mode: StampMode::Write,
                version,
            },
        }
    }

    pub fn stamp(&self) -> LockStamp {
        self.stamp
    }

    /// Trade the write stamp for a read stamp without letting another writer in.
    pub fn downgrade(self) -> ReadStamp<'a, T> {
        let lock = self.lock;
        let mut st = lock.state.lock();
        st.writer = false;
        st.version += 1;
        st.readers += 1;
        let version = st.version;
        drop(st);
        mem::forget(self);
        lock.cond.notify_all();
        ReadStamp::issue(lock, version)
    }
}

impl<T> Deref for WriteStamp<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a write stamp is the only stamp in existence.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteStamp<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above; `&mut self` rules out aliasing through this guard.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteStamp<'_, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}
