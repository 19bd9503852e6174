//! Exclusive-or-shared lock built from two atomic counters.
//!
//! [`AtomicSharedMutex`] allows either one unique holder or any number of
//! shared holders. Beyond the usual reader/writer operations it supports a
//! *partial* unique lock (unique intent taken, existing readers still
//! inside), downgrading a unique lock to shared, and upgrading a shared
//! lock to unique. The lock carries no data: it guards state that lives
//! elsewhere (the queue uses it to fence read-block replacement, the
//! exception code table uses it around its map).
//!
//! The lock is writer-preferring while a unique holder is present: once
//! `unique` is set, new shared takers back off until it clears.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::atomic::Backoff;

/// Lock allowing one unique holder or multiple shared holders.
#[derive(Debug)]
pub struct AtomicSharedMutex {
    /// Unique-intent flag; 0 or 1.
    unique: AtomicBool,
    /// Number of shared holders.
    sharing: AtomicU32,
}

impl AtomicSharedMutex {
    pub const fn new() -> Self {
        Self {
            unique: AtomicBool::new(false),
            sharing: AtomicU32::new(0),
        }
    }

    /// Acquire the unique lock, waiting for readers to drain.
    pub fn lock(&self) {
        let mut backoff = Backoff::new();
        while self.unique.swap(true, Ordering::AcqRel) {
            backoff.snooze();
        }
        backoff.reset();
        while self.sharing.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
    }

    /// Release the unique lock.
    pub fn unlock(&self) {
        let was_unique = self.unique.swap(false, Ordering::Release);
        debug_assert!(was_unique, "unlock of an AtomicSharedMutex not uniquely held");
    }

    /// Try to acquire the unique lock; fails if any holder exists.
    pub fn try_lock(&self) -> bool {
        if self.unique.swap(true, Ordering::AcqRel) {
            return false; // Already locked for unique
        }
        if self.sharing.load(Ordering::Acquire) != 0 {
            // Unique intent taken but readers are inside; revert.
            self.unique.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Acquire a shared lock.
    pub fn lock_shared(&self) {
        let mut backoff = Backoff::new();
        self.sharing.fetch_add(1, Ordering::AcqRel);
        while self.unique.load(Ordering::Acquire) {
            // A unique holder (or intent) is present: step aside so it can
            // finish, then re-register.
            self.sharing.fetch_sub(1, Ordering::AcqRel);
            while self.unique.load(Ordering::Acquire) {
                backoff.snooze();
            }
            self.sharing.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Release a shared lock.
    pub fn unlock_shared(&self) {
        let prev = self.sharing.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "unlock_shared without a shared holder");
    }

    /// Try to acquire a shared lock; fails while a unique holder is present.
    pub fn try_lock_shared(&self) -> bool {
        self.sharing.fetch_add(1, Ordering::AcqRel);
        if self.unique.load(Ordering::Acquire) {
            self.sharing.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Take unique intent without waiting for readers to drain.
    ///
    /// Existing shared holders keep running; new shared takers are blocked.
    /// The partial lock must be finished with either
    /// [`complete_partial`](Self::complete_partial) or
    /// [`cancel_partial`](Self::cancel_partial).
    pub fn partial_lock(&self) {
        let mut backoff = Backoff::new();
        while self.unique.swap(true, Ordering::AcqRel) {
            backoff.snooze();
        }
    }

    /// Try to take unique intent; fails if another unique holder exists.
    pub fn try_partial_lock(&self) -> bool {
        !self.unique.swap(true, Ordering::AcqRel)
    }

    /// Abandon a partial lock without completing it.
    pub fn cancel_partial(&self) {
        let was_unique = self.unique.swap(false, Ordering::Release);
        debug_assert!(was_unique, "cancel_partial without a partial lock");
    }

    /// Wait for the remaining shared holders; the partial lock becomes a
    /// full unique lock.
    pub fn complete_partial(&self) {
        debug_assert!(self.unique.load(Ordering::Relaxed));
        let mut backoff = Backoff::new();
        while self.sharing.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
    }

    /// Turn a unique (or partial unique) lock into a shared lock.
    ///
    /// The shared registration happens before unique is released, so no
    /// exclusive taker can slip in between.
    pub fn downgrade(&self) {
        self.sharing.fetch_add(1, Ordering::AcqRel);
        let was_unique = self.unique.swap(false, Ordering::Release);
        debug_assert!(was_unique, "downgrade without a unique lock");
    }

    /// Turn a shared lock into a unique lock.
    ///
    /// Deadlocks if two shared holders upgrade simultaneously: each waits
    /// for the other's share to drain. Callers must ensure a single
    /// upgrader; this crate never upgrades internally.
    pub fn upgrade(&self) {
        let mut backoff = Backoff::new();
        while self.unique.swap(true, Ordering::AcqRel) {
            backoff.snooze();
        }
        backoff.reset();
        self.sharing.fetch_sub(1, Ordering::AcqRel);
        while self.sharing.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
    }

    /// Whether a unique or partial unique lock is currently present.
    pub fn is_locked(&self) -> bool {
        self.unique.load(Ordering::Acquire)
    }
}

impl Default for AtomicSharedMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AtomicSharedMutex {
    fn drop(&mut self) {
        debug_assert!(
            !*self.unique.get_mut() && *self.sharing.get_mut() == 0,
            "AtomicSharedMutex dropped while held"
        );
    }
}
