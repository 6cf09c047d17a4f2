//! Explicit interruption tokens for blocking lock acquisition.
//!
//! Threads cannot be interrupted from the outside, so interruptible waits take a
//! token instead. Raising the token makes the next waiter that observes it give
//! up with [`Error::Interrupted`](crate::Error::Interrupted). Giving up consumes
//! the flag, so a retry with the same token proceeds normally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest a waiter sleeps before re-checking its interrupt token.
pub(crate) const INTERRUPT_POLL: Duration = Duration::from_millis(5);

/// Shared interrupt flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    raised: Arc<AtomicBool>,
}

impl Interrupt {
    /// Create a token that is not raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. A waiter notices within one poll slice and lowers it again.
    pub fn interrupt(&self) {
        self.raised.store(true, Ordering::Release);
    }

    /// Whether the flag is raised.
    pub fn is_interrupted(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Lower the flag and report whether it was raised.
    pub fn clear(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }
}

/// Next instant a waiter should wake at: the deadline, or sooner when it has to poll a token.
#[inline(always)]
pub(crate) fn wake_at(deadline: Option<Instant>, interrupt: Option<&Interrupt>) -> Option<Instant> {
    match (deadline, interrupt) {
        (d, None) => d,
        (None, Some(_)) => Some(Instant::now() + INTERRUPT_POLL),
        (Some(d), Some(_)) => Some(d.min(Instant::now() + INTERRUPT_POLL)),
    }
}

/// Lower a raised flag on behalf of a waiter that is about to give up.
#[inline(always)]
pub(crate) fn take_raised(interrupt: Option<&Interrupt>) -> bool {
    interrupt.is_some_and(Interrupt::clear)
}

/// Deadline `timeout` from now, or `None` when it lies beyond what `Instant` can represent.
#[inline(always)]
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}
