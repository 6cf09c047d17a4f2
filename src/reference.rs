//! Key slots: how an entry holds on to its key.

use std::sync::{Arc, Weak};

/// How strongly an [`IdentityMap`](crate::IdentityMap) holds its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strength {
    /// The entry disappears as soon as the last outside `Arc` of its key is dropped.
    #[default]
    Weak,
    /// The map keeps the key alive until memory pressure is signalled with
    /// [`IdentityMap::reclaim_soft_references`](crate::IdentityMap::reclaim_soft_references)
    /// while the map is the key's only owner.
    Soft,
}

/// Key held by an entry.
///
/// `Null` is the explicit null key. A `Weak` slot whose referent is gone is a
/// cleared key: both read as "no key" but only the latter is ever purged.
pub(crate) enum KeySlot<K> {
    Null,
    Weak(Weak<K>),
    Soft(Arc<K>),
}

impl<K> KeySlot<K> {
    #[inline(always)]
    pub(crate) fn new(key: &Arc<K>, strength: Strength) -> Self {
        match strength {
            Strength::Weak => KeySlot::Weak(Arc::downgrade(key)),
            Strength::Soft => KeySlot::Soft(Arc::clone(key)),
        }
    }

    /// Strong handle to the key, or `None` for the null key and cleared keys.
    #[inline(always)]
    pub(crate) fn upgrade(&self) -> Option<Arc<K>> {
        match self {
            KeySlot::Null => None,
            KeySlot::Weak(w) => w.upgrade(),
            KeySlot::Soft(a) => Some(Arc::clone(a)),
        }
    }

    #[inline(always)]
    pub(crate) fn is_null(&self) -> bool {
        matches!(self, KeySlot::Null)
    }

    /// The collector has taken the key: the entry is dead and waits for a purge.
    #[inline(always)]
    pub(crate) fn is_cleared(&self) -> bool {
        match self {
            KeySlot::Weak(w) => w.strong_count() == 0,
            KeySlot::Null | KeySlot::Soft(_) => false,
        }
    }

    /// Memory pressure: give up a soft key nobody else owns.
    ///
    /// Returns true when the slot was cleared.
    pub(crate) fn release_if_unshared(&mut self) -> bool {
        let KeySlot::Soft(key) = self else {
            return false;
        };
        if Arc::strong_count(key) != 1 {
            return false;
        }
        let weak = Arc::downgrade(key);
        // Dropping the last strong handle clears the slot unless a Weak elsewhere upgraded meanwhile.
        *self = KeySlot::Weak(weak);
        self.is_cleared()
    }
}
