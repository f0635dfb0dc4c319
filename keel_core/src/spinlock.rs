//! Minimal mutual exclusion for process-wide tables.
//!
//! Only the process-wide singletons (communicator registry, shared text
//! streams) are locked; per-object state follows a single-writer rule.
//!
//! # Implementations
//!
//! - default: a test-and-test-and-set lock on one `AtomicBool`. An
//!   uncontended acquire is a single compare-exchange, which is the whole
//!   cost in the single-threaded configuration.
//! - `threadsafe` feature: a `parking_lot` mutex, which spins briefly and
//!   then parks, for programs that really call in from several threads.

use std::fmt;
use std::ops::{Deref, DerefMut};

#[cfg(not(feature = "threadsafe"))]
use std::cell::UnsafeCell;
#[cfg(not(feature = "threadsafe"))]
use std::sync::atomic::{AtomicBool, Ordering};

// =============================================================================
// Spinlock
// =============================================================================

/// A lock protecting a value of type `T`.
pub struct Spinlock<T> {
    #[cfg(feature = "threadsafe")]
    inner: parking_lot::Mutex<T>,

    #[cfg(not(feature = "threadsafe"))]
    locked: AtomicBool,
    #[cfg(not(feature = "threadsafe"))]
    value: UnsafeCell<T>,
}

// Safety: access to `value` is serialized by `locked`.
#[cfg(not(feature = "threadsafe"))]
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Create an unlocked spinlock.
    #[cfg(feature = "threadsafe")]
    pub const fn new(value: T) -> Self {
        Self {
            inner: parking_lot::const_mutex(value),
        }
    }

    /// Create an unlocked spinlock.
    #[cfg(not(feature = "threadsafe"))]
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning until it is available.
    #[cfg(feature = "threadsafe")]
    #[inline]
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        SpinlockGuard {
            guard: self.inner.lock(),
        }
    }

    /// Acquire the lock, spinning until it is available.
    #[cfg(not(feature = "threadsafe"))]
    #[inline]
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        SpinlockGuard { lock: self }
    }

    /// Acquire the lock only if it is free right now.
    #[cfg(feature = "threadsafe")]
    #[inline]
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        self.inner.try_lock().map(|guard| SpinlockGuard { guard })
    }

    /// Acquire the lock only if it is free right now.
    #[cfg(not(feature = "threadsafe"))]
    #[inline]
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinlockGuard { lock: self })
    }

    /// Mutable access without locking; the borrow proves exclusivity.
    #[cfg(feature = "threadsafe")]
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Mutable access without locking; the borrow proves exclusivity.
    #[cfg(not(feature = "threadsafe"))]
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Consume the lock and return the protected value.
    #[cfg(feature = "threadsafe")]
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    /// Consume the lock and return the protected value.
    #[cfg(not(feature = "threadsafe"))]
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for Spinlock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.try_lock().is_some() {
            "unlocked"
        } else {
            "locked"
        };
        f.debug_struct("Spinlock").field("state", &state).finish()
    }
}

// =============================================================================
// Guard
// =============================================================================

/// RAII guard; the lock is released when dropped.
pub struct SpinlockGuard<'a, T> {
    #[cfg(feature = "threadsafe")]
    guard: parking_lot::MutexGuard<'a, T>,
    #[cfg(not(feature = "threadsafe"))]
    lock: &'a Spinlock<T>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    #[cfg(feature = "threadsafe")]
    #[inline]
    fn deref(&self) -> &T {
        &self.guard
    }

    #[cfg(not(feature = "threadsafe"))]
    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard holds the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    #[cfg(feature = "threadsafe")]
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }

    #[cfg(not(feature = "threadsafe"))]
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.value.get() }
    }
}

#[cfg(not(feature = "threadsafe"))]
impl<T> Drop for SpinlockGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// =============================================================================
// Named Stream Locks
// =============================================================================

/// Serializes writes to standard output from concurrent viewers.
pub static ASCII_STDOUT_LOCK: Spinlock<()> = Spinlock::new(());

/// Serializes writes to standard error from concurrent viewers.
pub static ASCII_STDERR_LOCK: Spinlock<()> = Spinlock::new(());

/// A shared text-output stream with its own lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsciiStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl AsciiStream {
    /// Acquire the stream's lock.
    pub fn lock(self) -> SpinlockGuard<'static, ()> {
        match self {
            AsciiStream::Stdout => ASCII_STDOUT_LOCK.lock(),
            AsciiStream::Stderr => ASCII_STDERR_LOCK.lock(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lock_and_mutate() {
        let lock = Spinlock::new(1);
        *lock.lock() += 41;
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = Spinlock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_into_inner_and_get_mut() {
        let mut lock = Spinlock::new(vec![1, 2]);
        lock.get_mut().push(3);
        assert_eq!(lock.into_inner(), vec![1, 2, 3]);
    }

    #[test]
    fn test_concurrent_increments() {
        let lock = Arc::new(Spinlock::new(0usize));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }

    #[test]
    fn test_stream_locks_are_distinct() {
        let _out = AsciiStream::Stdout.lock();
        assert!(ASCII_STDERR_LOCK.try_lock().is_some());
    }
}
