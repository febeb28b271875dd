//! Synchronization utilities shared across the crate.
//!
//! The pipeline runs on plain OS threads: reader/writer locks order table
//! mutations, per-object mutexes guard counters, and condition variables
//! signal transitions out of the `BeingCreated` states. Poisoned locks are
//! recovered rather than propagated, so a panicking peer cannot wedge the
//! tables for every other thread.

pub use std::sync::{Arc, Weak};

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub fn lock_mutex<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub fn wait_condvar<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// A one-shot completion event.
///
/// Used for asynchronous net-root resolution: the resolving thread calls
/// [`Event::signal`] once, and the suspended create operation resumes from
/// [`Event::wait`]. Single-consumer; the value is handed over exactly once.
pub struct Event<T> {
    slot: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Completes the event, waking the waiter.
    pub fn signal(&self, value: T) {
        let mut slot = lock_mutex(&self.slot);
        debug_assert!(slot.is_none(), "event signalled twice");
        *slot = Some(value);
        self.cond.notify_all();
    }

    /// Blocks until the event is signalled and takes the value.
    pub fn wait(&self) -> T {
        let mut slot = lock_mutex(&self.slot);
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            slot = wait_condvar(&self.cond, slot);
        }
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}
