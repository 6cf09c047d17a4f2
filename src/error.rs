//! Error type shared by the map, the locks and the cache facade.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by identity maps, stamped locks, fair locks and caches.
///
/// Every error is reported synchronously by the call that triggered it and
/// leaves no lock held by the calling thread.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// A constructor or configuration argument was rejected.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the argument.
        reason: String,
    },

    /// A lock could not be acquired within its wait budget.
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout {
        /// Which lock (and mode) was being acquired.
        what: &'static str,
        /// The budget that elapsed.
        waited: Duration,
    },

    /// The map was structurally modified while a cursor was walking it.
    #[error("map modified during iteration (stamp {expected} became {actual})")]
    ConcurrentModification {
        /// Stamp recorded when the cursor was created.
        expected: u64,
        /// Stamp observed at the failing step.
        actual: u64,
    },

    /// The waiting thread's interrupt token was raised.
    #[error("interrupted while waiting for {what}")]
    Interrupted {
        /// Which lock (and mode) was being acquired.
        what: &'static str,
    },

    /// A lock was released by a thread that does not hold it.
    #[error("illegal monitor state: {reason}")]
    IllegalMonitorState {
        /// Which release was attempted.
        reason: &'static str,
    },
}

impl Error {
    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Returns true for [`Error::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Returns true for [`Error::Interrupted`].
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
