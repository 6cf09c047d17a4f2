//! Read-mostly compound operations over a [`StampedLock`]-guarded [`StampedMap`].
//!
//! Every operation starts under a read stamp and answers from there when it can.
//! Only when a mutation is needed does it try to convert the read stamp in place;
//! if conversion keeps failing it records the structure's modification stamp,
//! releases the read stamp, takes a write stamp and re-checks before writing.
//! That release/reacquire window is unguarded: interference during it is
//! detected through the modification stamp, not prevented.
//!
//! The calling thread must not already hold a stamp on the same lock.

use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::interrupt::{deadline_after, Interrupt};
use crate::stamped::{StampedLock, StampedMap, WriteStamp};

/// Default budget for acquiring a stamp
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of in-place read-to-write conversion attempts
pub const DEFAULT_CONVERT_ATTEMPTS: usize = 5;

/// Configuration for the lock-upgrade operations.
///
/// The operations themselves are stateless; one `LockUpgrade` can drive any
/// number of locks from any number of threads.
#[derive(Debug, Clone)]
pub struct LockUpgrade {
    timeout: Duration,
    convert_attempts: usize,
    interrupt: Option<Interrupt>,
}

impl Default for LockUpgrade {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            convert_attempts: DEFAULT_CONVERT_ATTEMPTS,
            interrupt: None,
        }
    }
}

impl LockUpgrade {
    pub fn new() -> Self {
        Self::default()
    }

    /// Budget shared by every stamp acquisition of one operation.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// How many times to try converting the read stamp before falling back.
    pub fn convert_attempts(mut self, attempts: usize) -> Self {
        self.convert_attempts = attempts;
        self
    }

    /// Abort waits with [`Error::Interrupted`](crate::Error::Interrupted) once `interrupt` is raised.
    /// The failing wait lowers the flag again, so the next operation runs normally.
    pub fn interruptible(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub fn budget(&self) -> Duration {
        self.timeout
    }

    // ============================================================================================
    // COMPOUND OPERATIONS
    // ============================================================================================

    /// Return the value for `key`, computing and inserting it with `f` if absent.
    ///
    /// `f` runs under the write stamp, so among racing callers exactly one computes.
    pub fn compute_if_absent<M, F>(&self, lock: &StampedLock<M>, key: M::Key, f: F) -> Result<M::Value>
    where
        M: StampedMap,
        F: FnOnce(&M::Key) -> M::Value,
    {
        self.read_then_write(
            lock,
            key,
            |m, key| m.get(key),
            |m, key| {
                let value = f(&key);
                m.insert(key, value.clone());
                value
            },
        )
    }

    /// Insert `value` unless `key` is present. Returns the value already present, if any.
    pub fn put_if_absent<M>(&self, lock: &StampedLock<M>, key: M::Key, value: M::Value) -> Result<Option<M::Value>>
    where
        M: StampedMap,
    {
        self.read_then_write(
            lock,
            key,
            |m, key| m.get(key).map(Some),
            |m, key| {
                m.insert(key, value);
                None
            },
        )
    }

    /// Recompute the value for a present `key`. Returns the new value; `None` from
    /// `f` removes the entry. Absent keys are left alone and yield `None`.
    pub fn compute_if_present<M, F>(&self, lock: &StampedLock<M>, key: M::Key, f: F) -> Result<Option<M::Value>>
    where
        M: StampedMap,
        F: FnOnce(&M::Key, &M::Value) -> Option<M::Value>,
    {
        self.read_then_write(
            lock,
            key,
            absent_is_done,
            |m, key| {
                let current = m.get(&key)?;
                match f(&key, &current) {
                    Some(next) => {
                        m.insert(key, next.clone());
                        Some(next)
                    }
                    None => {
                        m.remove(&key);
                        None
                    }
                }
            },
        )
    }

    /// Replace the value of a present `key`. Returns the previous value, or `None`
    /// (without inserting) when the key is absent.
    pub fn replace<M>(&self, lock: &StampedLock<M>, key: M::Key, value: M::Value) -> Result<Option<M::Value>>
    where
        M: StampedMap,
    {
        self.read_then_write(
            lock,
            key,
            absent_is_done,
            |m, key| {
                if m.get(&key).is_none() {
                    return None;
                }
                m.insert(key, value)
            },
        )
    }

    /// Remove `key`, returning its value. Absent keys never take a write stamp.
    pub fn remove<M>(&self, lock: &StampedLock<M>, key: &M::Key) -> Result<Option<M::Value>>
    where
        M: StampedMap,
    {
        self.read_then_write(
            lock,
            key,
            |m, key| absent_is_done(m, *key),
            |m, key| m.remove(key),
        )
    }

    // ============================================================================================
    // PROTOCOL
    // ============================================================================================

    /// `answer` decides from a shared view whether the operation is already done;
    /// `mutate` runs under an exclusive stamp otherwise. After a release/reacquire
    /// gap `answer` is consulted again if the structure changed meanwhile.
    fn read_then_write<M, Q, R, A, W>(
        &self,
        lock: &StampedLock<M>,
        key: Q,
        answer: A,
        mutate: W,
    ) -> Result<R>
    where
        M: StampedMap,
        A: Fn(&M, &Q) -> Option<R>,
        W: FnOnce(&mut M, Q) -> R,
    {
        let deadline = deadline_after(self.timeout);
        let interrupt = self.interrupt.as_ref();

        let read = lock.try_read_until(deadline, interrupt)?;
        if let Some(done) = answer(&*read, &key) {
            return Ok(done);
        }

        let mut read = read;
        for attempt in 0..self.convert_attempts {
            match read.try_convert() {
                Ok(mut write) => {
                    tracing::trace!(attempt, "read stamp converted in place");
                    return Ok(mutate(&mut *write, key));
                }
                Err(still_reading) => {
                    read = still_reading;
                    thread::yield_now();
                }
            }
        }

        let seen = read.modification_stamp();
        drop(read);
        tracing::trace!(seen, "conversion failed, reacquiring exclusively");

        let mut write: WriteStamp<'_, M> = lock.try_write_until(deadline, interrupt)?;
        if write.modification_stamp() != seen {
            if let Some(done) = answer(&*write, &key) {
                tracing::trace!("structure changed during reacquire, using the winner's result");
                return Ok(done);
            }
        }
        Ok(mutate(&mut *write, key))
    }
}

/// Shared-view answer for operations that only act on present keys.
fn absent_is_done<M: StampedMap>(m: &M, key: &M::Key) -> Option<Option<M::Value>> {
    if m.get(key).is_none() {
        Some(None)
    } else {
        None
    }
}
