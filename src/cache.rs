//! IdentityCache: build at most one wrapper per delegate.
//!
//! Decorator constructors call [`IdentityCache::get_or_create`] with the delegate
//! they are about to wrap. A hit returns the existing wrapper without taking an
//! exclusive lock; a miss runs the factory once, under the exclusive lock, and
//! publishes its result.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::fair::FairLock;
use crate::interrupt::{deadline_after, Interrupt};
use crate::map::IdentityMap;
use crate::reference::Strength;
use crate::stamped::StampedLock;
use crate::upgrade::LockUpgrade;

/// Default wait budget for the guarding lock
pub const DEFAULT_WAIT_BUDGET: Duration = Duration::from_secs(10);

const DEFAULT_CAPACITY: usize = 16;

/// Which lock guards the cache's map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Stamped lock driven by the lock-upgrade protocol.
    #[default]
    Stamped,
    /// [`FairLock`] with a read-hold fast path and a write-hold re-check.
    Fair,
}

/// Knobs for an [`IdentityCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    strategy: Strategy,
    wait_budget: Duration,
    strength: Strength,
    capacity: usize,
    interrupt: Option<Interrupt>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Stamped,
            wait_budget: DEFAULT_WAIT_BUDGET,
            strength: Strength::Weak,
            capacity: DEFAULT_CAPACITY,
            interrupt: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Longest any cache operation waits for the guarding lock. Budgets too large
    /// for a deadline mean waiting without one.
    pub fn wait_budget(mut self, budget: Duration) -> Self {
        self.wait_budget = budget;
        self
    }

    pub fn strength(mut self, strength: Strength) -> Self {
        self.strength = strength;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Token that aborts waits for the guarding lock. Each abort lowers it again.
    pub fn interruptible(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }
}

struct FairMap<D, W> {
    lock: FairLock,
    map: UnsafeCell<IdentityMap<D, W>>,
}

// SAFETY: `map` is read only under a read hold and written only under the write hold of `lock`,
// and no reference into it outlives the hold it was taken under.
unsafe impl<D: Send + Sync, W: Send + Sync> Sync for FairMap<D, W> {}

enum Guarded<D, W> {
    Stamped(StampedLock<IdentityMap<D, W>>),
    Fair(FairMap<D, W>),
}

/// Wrap-once cache keyed by delegate identity.
///
/// Delegates are held weakly by default: once every outside `Arc` of a delegate
/// is gone its wrapper is released by the next purge. A wrapper that keeps a
/// strong `Arc` of its delegate keeps its own entry alive until it is removed.
pub struct IdentityCache<D, W> {
    guarded: Guarded<D, W>,
    budget: Duration,
    upgrade: LockUpgrade,
    interrupt: Option<Interrupt>,
}

impl<D: Send + Sync, W: Clone + Send + Sync> IdentityCache<D, W> {
    /// Cache guarded by the stamped lock with default settings.
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        let map = IdentityMap::with_capacity_and_strength(config.capacity, config.strength);
        let guarded = match config.strategy {
            Strategy::Stamped => Guarded::Stamped(StampedLock::new(map)),
            Strategy::Fair => Guarded::Fair(FairMap {
                lock: FairLock::new(),
                map: UnsafeCell::new(map),
            }),
        };
        let mut upgrade = LockUpgrade::new().timeout(config.wait_budget);
        if let Some(interrupt) = &config.interrupt {
            upgrade = upgrade.interruptible(interrupt.clone());
        }
        Self {
            guarded,
            budget: config.wait_budget,
            upgrade,
            interrupt: config.interrupt,
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self.guarded {
            Guarded::Stamped(_) => Strategy::Stamped,
            Guarded::Fair(_) => Strategy::Fair,
        }
    }

    /// Return the wrapper for `delegate`, building it with `factory` on first use.
    ///
    /// `factory` runs at most once per distinct delegate and must have no visible
    /// side effect beyond building the wrapper. Fails with a timeout error when the
    /// guarding lock cannot be obtained within the wait budget.
    pub fn get_or_create<F>(&self, delegate: &Arc<D>, factory: F) -> Result<W>
    where
        F: FnOnce(&Arc<D>) -> W,
    {
        match &self.guarded {
            Guarded::Stamped(lock) => {
                self.upgrade
                    .compute_if_absent(lock, Arc::clone(delegate), |d| {
                        tracing::trace!("building wrapper under stamped write lock");
                        factory(d)
                    })
            }
            Guarded::Fair(fair) => {
                let deadline = self.deadline();
                {
                    let _read = fair.lock.read_scope_until(deadline, self.interrupt.as_ref())?;
                    // SAFETY: read hold; the borrow ends within this block.
                    if let Some(existing) = unsafe { (*fair.map.get()).get(delegate) } {
                        return Ok(existing);
                    }
                }

                let _write = fair.lock.write_scope_until(deadline, self.interrupt.as_ref())?;
                // SAFETY: write hold; no borrow is kept across the factory call, so a
                // factory re-entering this cache on the same thread never aliases it.
                if let Some(existing) = unsafe { (*fair.map.get()).get(delegate) } {
                    return Ok(existing);
                }
                tracing::trace!("building wrapper under fair write lock");
                let wrapper = factory(delegate);
                // SAFETY: the write hold is still ours and the factory's borrows have ended.
                unsafe { (*fair.map.get()).insert(Arc::clone(delegate), wrapper.clone()) };
                Ok(wrapper)
            }
        }
    }

    /// Existing wrapper for `delegate`, if any.
    pub fn get(&self, delegate: &Arc<D>) -> Result<Option<W>> {
        self.with_map(|m| m.get(delegate))
    }

    /// Forget the wrapper for `delegate`, returning it.
    pub fn remove(&self, delegate: &Arc<D>) -> Result<Option<W>> {
        match &self.guarded {
            Guarded::Stamped(lock) => self.upgrade.remove(lock, delegate),
            Guarded::Fair(_) => self.with_map_mut(|m| m.remove(delegate)),
        }
    }

    /// Live entries. Entries whose delegate is gone are purged first.
    pub fn len(&self) -> Result<usize> {
        self.with_map_mut(|m| {
            m.purge();
            m.len()
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|n| n == 0)
    }

    /// Drop entries whose delegate is gone; returns how many were dropped.
    pub fn purge(&self) -> Result<usize> {
        self.with_map_mut(|m| m.purge())
    }

    pub fn reclaimed_count(&self) -> Result<u64> {
        self.with_map(|m| m.reclaimed_count())
    }

    /// Memory-pressure signal for soft caches; see [`IdentityMap::reclaim_soft_references`].
    pub fn reclaim_soft_references(&self) -> Result<usize> {
        self.with_map_mut(|m| m.reclaim_soft_references())
    }

    // ============================================================================================
    // PRIVATE HELPER METHODS
    // ============================================================================================

    fn deadline(&self) -> Option<Instant> {
        deadline_after(self.budget)
    }

    fn with_map<R>(&self, f: impl FnOnce(&IdentityMap<D, W>) -> R) -> Result<R> {
        let deadline = self.deadline();
        match &self.guarded {
            Guarded::Stamped(lock) => {
                let read = lock.try_read_until(deadline, self.interrupt.as_ref())?;
                Ok(f(&*read))
            }
            Guarded::Fair(fair) => {
                let _read = fair.lock.read_scope_until(deadline, self.interrupt.as_ref())?;
                // SAFETY: read hold for the duration of `f`.
                Ok(f(unsafe { &*fair.map.get() }))
            }
        }
    }

    fn with_map_mut<R>(&self, f: impl FnOnce(&mut IdentityMap<D, W>) -> R) -> Result<R> {
        let deadline = self.deadline();
        match &self.guarded {
            Guarded::Stamped(lock) => {
                let mut write = lock.try_write_until(deadline, self.interrupt.as_ref())?;
                Ok(f(&mut *write))
            }
            Guarded::Fair(fair) => {
                let _write = fair.lock.write_scope_until(deadline, self.interrupt.as_ref())?;
                // SAFETY: write hold for the duration of `f`, which cannot reach the cache.
                Ok(f(unsafe { &mut *fair.map.get() }))
            }
        }
    }
}

impl<D: Send + Sync, W: Clone + Send + Sync> Default for IdentityCache<D, W> {
    fn default() -> Self {
        Self::new()
    }
}
