//! FairLock: a reentrant reader/writer lock with writer preference.
//!
//! Admission rules:
//! - read: the caller holds the write lock, or no writer is active and either the
//!   caller already reads or no write request is pending;
//! - write: no other writer is active and either nobody reads or the caller is the
//!   sole reader (self-upgrade).
//!
//! A pending write request therefore blocks new readers, which keeps writers from
//! starving. A reader that shares the lock with other readers cannot upgrade in
//! place: it must release its read holds first, leaving a gap with no lock held.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use ahash::RandomState;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::interrupt::{deadline_after, take_raised, wake_at, Interrupt};

// ================================================================================================
// STATE MACHINE
// ================================================================================================

/// Coarse view of a [`FairLock`]'s state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nobody holds or requests the lock.
    Idle,
    /// Readers hold the lock and no writer is waiting.
    ReadHeld { readers: usize },
    /// A writer holds the lock `holds` times (it may also hold read holds).
    WriteHeld { owner: ThreadId, holds: usize },
    /// Writers are waiting; new readers are turned away until they are served.
    WriteRequested { readers: usize, pending: usize },
}

#[derive(Debug, Default)]
struct FairState {
    readers: HashMap<ThreadId, usize, RandomState>,
    writer: Option<ThreadId>,
    write_holds: usize,
    pending_writes: usize,
}

impl FairState {
    fn can_grant_read(&self, me: ThreadId) -> bool {
        if self.writer == Some(me) {
            return true;
        }
        self.writer.is_none() && (self.readers.contains_key(&me) || self.pending_writes == 0)
    }

    fn can_grant_write(&self, me: ThreadId) -> bool {
        let writer_free = self.writer.is_none() || self.writer == Some(me);
        let sole_reader = self.readers.len() == 1 && self.readers.contains_key(&me);
        writer_free && (self.readers.is_empty() || sole_reader)
    }

    fn grant_read(&mut self, me: ThreadId) {
        *self.readers.entry(me).or_insert(0) += 1;
    }

    fn grant_write(&mut self, me: ThreadId) {
        self.writer = Some(me);
        self.write_holds += 1;
    }

    fn phase(&self) -> Phase {
        match self.writer {
            Some(owner) => Phase::WriteHeld {
                owner,
                holds: self.write_holds,
            },
            None if self.pending_writes > 0 => Phase::WriteRequested {
                readers: self.readers.len(),
                pending: self.pending_writes,
            },
            None if !self.readers.is_empty() => Phase::ReadHeld {
                readers: self.readers.len(),
            },
            None => Phase::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

impl Mode {
    fn describe(self) -> &'static str {
        match self {
            Mode::Read => "fair read lock",
            Mode::Write => "fair write lock",
        }
    }
}

enum Outcome {
    Granted,
    TimedOut(Duration),
    Interrupted,
}

// ================================================================================================
// LOCK
// ================================================================================================

/// Reentrant reader/writer lock with writer preference.
///
/// Holds are tracked per thread; every `lock_*` must be paired with an `unlock_*`
/// on the same thread, or use the scoped variants.
#[derive(Debug, Default)]
pub struct FairLock {
    state: Mutex<FairState>,
    cond: Condvar,
}

impl FairLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a read hold, waiting as long as it takes.
    pub fn lock_read(&self) {
        let outcome = self.acquire(Mode::Read, None, None);
        debug_assert!(matches!(outcome, Outcome::Granted));
    }

    /// Acquire a write hold, waiting as long as it takes.
    pub fn lock_write(&self) {
        let outcome = self.acquire(Mode::Write, None, None);
        debug_assert!(matches!(outcome, Outcome::Granted));
    }

    /// Acquire a read hold only if it can be granted immediately.
    pub fn try_lock_read(&self) -> bool {
        self.try_acquire_now(Mode::Read)
    }

    /// Acquire a write hold only if it can be granted immediately.
    pub fn try_lock_write(&self) -> bool {
        self.try_acquire_now(Mode::Write)
    }

    /// Acquire a read hold, giving up after `timeout`.
    pub fn try_lock_read_for(&self, timeout: Duration) -> bool {
        matches!(
            self.acquire(Mode::Read, deadline_after(timeout), None),
            Outcome::Granted
        )
    }

    /// Acquire a write hold, giving up after `timeout`.
    pub fn try_lock_write_for(&self, timeout: Duration) -> bool {
        matches!(
            self.acquire(Mode::Write, deadline_after(timeout), None),
            Outcome::Granted
        )
    }

    /// Acquire a read hold unless `interrupt` is raised first.
    pub fn lock_read_interruptibly(&self, interrupt: &Interrupt) -> Result<()> {
        self.acquire_checked(Mode::Read, None, Some(interrupt))
    }

    /// Acquire a write hold unless `interrupt` is raised first.
    pub fn lock_write_interruptibly(&self, interrupt: &Interrupt) -> Result<()> {
        self.acquire_checked(Mode::Write, None, Some(interrupt))
    }

    /// Acquire a read hold before `deadline` (if any), failing with a timeout or interruption error.
    pub fn lock_read_until(&self, deadline: Option<Instant>, interrupt: Option<&Interrupt>) -> Result<()> {
        self.acquire_checked(Mode::Read, deadline, interrupt)
    }

    /// Acquire a write hold before `deadline` (if any), failing with a timeout or interruption error.
    pub fn lock_write_until(&self, deadline: Option<Instant>, interrupt: Option<&Interrupt>) -> Result<()> {
        self.acquire_checked(Mode::Write, deadline, interrupt)
    }

    /// Release one read hold of the calling thread.
    pub fn unlock_read(&self) -> Result<()> {
        let me = thread::current().id();
        let mut st = self.state.lock();
        let Some(holds) = st.readers.get(&me).copied() else {
            drop(st);
            tracing::warn!(thread = ?me, "read unlock by a thread holding no read lock");
            return Err(Error::IllegalMonitorState {
                reason: "unlock_read called by a thread that holds no read lock",
            });
        };
        if holds == 1 {
            st.readers.remove(&me);
        } else {
            st.readers.insert(me, holds - 1);
        }
        drop(st);
        self.cond.notify_all();
        Ok(())
    }

    /// Release one write hold of the calling thread.
    pub fn unlock_write(&self) -> Result<()> {
        let me = thread::current().id();
        let mut st = self.state.lock();
        if st.writer != Some(me) {
            drop(st);
            tracing::warn!(thread = ?me, "write unlock by a thread not holding the write lock");
            return Err(Error::IllegalMonitorState {
                reason: "unlock_write called by a thread that does not hold the write lock",
            });
        }
        st.write_holds -= 1;
        if st.write_holds == 0 {
            st.writer = None;
        }
        drop(st);
        self.cond.notify_all();
        Ok(())
    }

    // ============================================================================================
    // SCOPED ACQUISITION
    // ============================================================================================

    /// Acquire a read hold released when the returned scope closes or drops.
    pub fn read_scope(&self) -> ReadScope<'_> {
        self.lock_read();
        ReadScope::new(self)
    }

    /// Acquire a write hold released when the returned scope closes or drops.
    pub fn write_scope(&self) -> WriteScope<'_> {
        self.lock_write();
        WriteScope::new(self)
    }

    pub fn try_read_scope_for(&self, timeout: Duration) -> Option<ReadScope<'_>> {
        self.try_lock_read_for(timeout).then(|| ReadScope::new(self))
    }

    pub fn try_write_scope_for(&self, timeout: Duration) -> Option<WriteScope<'_>> {
        self.try_lock_write_for(timeout).then(|| WriteScope::new(self))
    }

    /// Read scope acquired before `deadline`, failing with a timeout or interruption error.
    pub fn read_scope_until(
        &self,
        deadline: Option<Instant>,
        interrupt: Option<&Interrupt>,
    ) -> Result<ReadScope<'_>> {
        self.lock_read_until(deadline, interrupt)?;
        Ok(ReadScope::new(self))
    }

    /// Write scope acquired before `deadline`, failing with a timeout or interruption error.
    pub fn write_scope_until(
        &self,
        deadline: Option<Instant>,
        interrupt: Option<&Interrupt>,
    ) -> Result<WriteScope<'_>> {
        self.lock_write_until(deadline, interrupt)?;
        Ok(WriteScope::new(self))
    }

    pub fn read_scope_interruptibly(&self, interrupt: &Interrupt) -> Result<ReadScope<'_>> {
        self.lock_read_interruptibly(interrupt)?;
        Ok(ReadScope::new(self))
    }

    pub fn write_scope_interruptibly(&self, interrupt: &Interrupt) -> Result<WriteScope<'_>> {
        self.lock_write_interruptibly(interrupt)?;
        Ok(WriteScope::new(self))
    }

    // ============================================================================================
    // INTROSPECTION
    // ============================================================================================

    /// Read holds of the calling thread.
    pub fn read_hold_count(&self) -> usize {
        let me = thread::current().id();
        self.state.lock().readers.get(&me).copied().unwrap_or(0)
    }

    /// Write holds of the calling thread.
    pub fn write_hold_count(&self) -> usize {
        let me = thread::current().id();
        let st = self.state.lock();
        if st.writer == Some(me) {
            st.write_holds
        } else {
            0
        }
    }

    /// Number of distinct threads holding read holds.
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.state.lock().writer == Some(thread::current().id())
    }

    pub fn has_queued_writers(&self) -> bool {
        self.state.lock().pending_writes > 0
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase()
    }

    // ============================================================================================
    // PRIVATE HELPER METHODS
    // ============================================================================================

    fn try_acquire_now(&self, mode: Mode) -> bool {
        let me = thread::current().id();
        let mut st = self.state.lock();
        match mode {
            Mode::Read if st.can_grant_read(me) => st.grant_read(me),
            Mode::Write if st.can_grant_write(me) => st.grant_write(me),
            _ => return false,
        }
        true
    }

    fn acquire_checked(
        &self,
        mode: Mode,
        deadline: Option<Instant>,
        interrupt: Option<&Interrupt>,
    ) -> Result<()> {
        match self.acquire(mode, deadline, interrupt) {
            Outcome::Granted => Ok(()),
            Outcome::TimedOut(waited) => Err(Error::Timeout {
                what: mode.describe(),
                waited,
            }),
            Outcome::Interrupted => Err(Error::Interrupted {
                what: mode.describe(),
            }),
        }
    }

    fn acquire(&self, mode: Mode, deadline: Option<Instant>, interrupt: Option<&Interrupt>) -> Outcome {
        let me = thread::current().id();
        let started = Instant::now();
        let mut st = self.state.lock();
        if mode == Mode::Write {
            st.pending_writes += 1;
        }

        let outcome = loop {
            if take_raised(interrupt) {
                break Outcome::Interrupted;
            }
            let admitted = match mode {
                Mode::Read => st.can_grant_read(me),
                Mode::Write => st.can_grant_write(me),
            };
            if admitted {
                match mode {
                    Mode::Read => st.grant_read(me),
                    Mode::Write => st.grant_write(me),
                }
                break Outcome::Granted;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break Outcome::TimedOut(started.elapsed());
            }
            match wake_at(deadline, interrupt) {
                Some(at) => {
                    let _ = self.cond.wait_until(&mut st, at);
                }
                None => self.cond.wait(&mut st),
            }
        };

        if mode == Mode::Write {
            st.pending_writes -= 1;
            if !matches!(outcome, Outcome::Granted) {
                // Readers turned away by this request may proceed now.
                drop(st);
                self.cond.notify_all();
            }
        }
        match outcome {
            Outcome::TimedOut(waited) => {
                tracing::debug!(what = mode.describe(), ?waited, "fair lock acquisition timed out")
            }
            Outcome::Interrupted => {
                tracing::debug!(what = mode.describe(), "fair lock acquisition interrupted")
            }
            Outcome::Granted => {}
        }
        outcome
    }
}

// ================================================================================================
// SCOPES
// ================================================================================================

/// Read hold released exactly once, by [`close`](ReadScope::close) or on drop.
///
/// Not `Send`: holds belong to the acquiring thread.
pub struct ReadScope<'a> {
    lock: &'a FairLock,
    released: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ReadScope<'a> {
    fn new(lock: &'a FairLock) -> Self {
        Self {
            lock,
            released: false,
            _not_send: PhantomData,
        }
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.lock.unlock_read();
        }
    }
}

impl Drop for ReadScope<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Write hold released exactly once, by [`close`](WriteScope::close) or on drop.
pub struct WriteScope<'a> {
    lock: &'a FairLock,
    released: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'a> WriteScope<'a> {
    fn new(lock: &'a FairLock) -> Self {
        Self {
            lock,
            released: false,
            _not_send: PhantomData,
        }
    }

    /// Keep a read hold while giving up the write hold.
    pub fn downgrade(mut self) -> ReadScope<'a> {
        self.lock.lock_read();
        self.release();
        ReadScope::new(self.lock)
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.lock.unlock_write();
        }
    }
}

impl Drop for WriteScope<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
