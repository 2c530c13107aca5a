//! Exclusive step gate.
//!
//! Every operation that mutates an active model (or its uncertain set) runs
//! while holding the model's gate. The gate owns the state it protects, so the
//! only way to reach that state is through a `GateGuard`, and dropping the guard
//! is the only way to release it.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{GnomeError, GnomeResult};

/// Binary lock over the state of one active model.
///
/// Waiters are woken in roughly arrival order: `parking_lot` hands the lock over
/// fairly whenever a waiter has been starved for more than half a millisecond.
pub struct StepGate<T> {
    inner: Mutex<T>,
}

impl<T> StepGate<T> {
    /// Create a released gate around `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Block until the gate is free, then hold it.
    pub fn acquire(&self) -> GateGuard<'_, T> {
        GateGuard::new(self.inner.lock())
    }

    /// Hold the gate, waiting at most `timeout` (`None` waits indefinitely).
    ///
    /// # Errors
    /// - `GnomeError::Timeout` if the gate is still held when `timeout` expires.
    pub fn acquire_timeout(&self, timeout: Option<Duration>) -> GnomeResult<GateGuard<'_, T>> {
        let Some(timeout) = timeout else {
            return Ok(self.acquire());
        };
        self.inner
            .try_lock_for(timeout)
            .map(GateGuard::new)
            .ok_or_else(|| GnomeError::timeout(timeout))
    }

    /// Hold the gate only if it is free right now.
    pub fn try_acquire(&self) -> Option<GateGuard<'_, T>> {
        self.inner.try_lock().map(GateGuard::new)
    }

    /// Returns true while some caller holds the gate.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T> fmt::Debug for StepGate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepGate")
            .field("held", &self.is_held())
            .finish_non_exhaustive()
    }
}

/// Scoped hold on a `StepGate`. The gate is released when the guard drops.
pub struct GateGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    acquired_at: Instant,
}

impl<'a, T> GateGuard<'a, T> {
    fn new(guard: MutexGuard<'a, T>) -> Self {
        tracing::debug!("step gate acquired");
        Self {
            guard,
            acquired_at: Instant::now(),
        }
    }

    /// Time since the gate was acquired.
    #[must_use]
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl<T> Deref for GateGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for GateGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for GateGuard<'_, T> {
    fn drop(&mut self) {
        // The inner MutexGuard unlocks right after this runs.
        tracing::debug!(held_us = self.held_for().as_micros() as u64, "step gate released");
    }
}
