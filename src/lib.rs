//! identmap_rs: the concurrency core of a wrap-once decorator layer.
//!
//! - [`IdentityMap`]: hash map over `Arc` keys held weakly or softly, compared by
//!   identity or by value, with a modification stamp that never repeats.
//! - [`StampedLock`] and [`LockUpgrade`]: read-mostly compound operations that
//!   upgrade a shared hold only when a mutation is needed.
//! - [`FairLock`]: reentrant reader/writer lock where a waiting writer blocks new readers.
//! - [`IdentityCache`]: at most one wrapper per delegate, guarded by either lock.

mod cache;
mod error;
mod fair;
mod interrupt;
mod map;
mod reference;
mod stamped;
mod upgrade;

pub use cache::{CacheConfig, IdentityCache, Strategy, DEFAULT_WAIT_BUDGET};
pub use error::{Error, Result};
pub use fair::{FairLock, Phase, ReadScope, WriteScope};
pub use interrupt::Interrupt;
pub use map::{Cursor, Equality, IdentityMap, Iter, DEFAULT_LOAD_FACTOR};
pub use reference::Strength;
pub use stamped::{
    LockStamp, ReadStamp, StampMode, Stamped, StampedHashMap, StampedLock, StampedMap, WriteStamp,
};
pub use upgrade::{LockUpgrade, DEFAULT_CONVERT_ATTEMPTS, DEFAULT_TIMEOUT};
