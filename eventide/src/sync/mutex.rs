//! Spin-yield exclusive mutex built from a single atomic flag.
//!
//! [`AtomicMutex`] trades fairness and parking for a tiny footprint: one
//! `AtomicBool`, no waiter queue, no OS handle. It is intended for short
//! critical sections that never block while holding the lock (the timer
//! queue is the main consumer in this crate). Uncontended acquisition is a
//! single test-and-set.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use super::atomic::Backoff;

/// Exclusive spinlock wrapping a value of type `T`.
///
/// `lock` spins with test-and-set and yields under contention; `unlock` (on
/// guard drop) clears the flag. There is no fairness guarantee.
///
/// # Example
///
/// ```
/// use eventide::AtomicMutex;
///
/// static COUNTER: AtomicMutex<u32> = AtomicMutex::new(0);
///
/// *COUNTER.lock() += 1;
/// assert_eq!(*COUNTER.lock(), 1);
/// ```
pub struct AtomicMutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the atomic flag grants exclusive access to `data`, so the mutex
// can be shared between threads whenever the payload can be sent.
unsafe impl<T: Send> Send for AtomicMutex<T> {}
// SAFETY: same argument; `&AtomicMutex<T>` only hands out `T` through the
// exclusive guard.
unsafe impl<T: Send> Sync for AtomicMutex<T> {}

impl<T> AtomicMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning until it becomes available.
    pub fn lock(&self) -> AtomicMutexGuard<'_, T> {
        let mut backoff = Backoff::new();
        while self.locked.swap(true, Ordering::Acquire) {
            backoff.snooze();
        }
        AtomicMutexGuard { mutex: self }
    }

    /// Acquire the lock without spinning; `None` if it is already held.
    pub fn try_lock(&self) -> Option<AtomicMutexGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(AtomicMutexGuard { mutex: self })
        }
    }

    /// Access the value without locking; exclusive borrow makes this safe.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> Drop for AtomicMutex<T> {
    fn drop(&mut self) {
        // A held lock at destruction means a guard was leaked.
        debug_assert!(
            !*self.locked.get_mut(),
            "AtomicMutex dropped while locked"
        );
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for AtomicMutex<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("AtomicMutex").field("data", &*guard).finish(),
            None => f.write_str("AtomicMutex { <locked> }"),
        }
    }
}

/// RAII guard for [`AtomicMutex`]; releases the lock on drop.
pub struct AtomicMutexGuard<'a, T> {
    mutex: &'a AtomicMutex<T>,
}

impl<T> Deref for AtomicMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock, so access is exclusive.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for AtomicMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock, so access is exclusive.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for AtomicMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
    }
}
