//! Cross-thread wake flag with optional manual reset and timeout.
//!
//! An [`EventFlag`] parks threads until another thread sets it. In the
//! default (auto-reset) mode the first successful wait consumes the flag and
//! wakes exactly one waiter; in manual-reset mode the flag stays set and
//! every waiter passes until [`reset`](EventFlag::reset) is called.
//!
//! Tearing a flag down while threads are parked on it is defined behavior:
//! [`destroy`](EventFlag::destroy) wakes every waiter and each observes
//! [`ErrorKind::Destroyed`] instead of a satisfied wait.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::error::ErrorKind;

bitflags! {
    /// Construction options for [`EventFlag`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlagOptions: u32 {
        /// `set` leaves the flag set until `reset`; wakes all waiters.
        const MANUAL_RESET = 1 << 0;
        /// The flag starts in the set state.
        const INITIAL_SET = 1 << 1;
    }
}

#[derive(Debug)]
struct FlagState {
    /// Current flag value.
    flag: bool,
    /// Value the flag takes after a satisfied wait; `true` for manual-reset.
    reset_value: bool,
    /// A reset was requested; applied by the next thread entering a wait.
    /// Does not kick threads that are already parked.
    reset_pending: bool,
    /// Number of threads currently inside a wait.
    waiting: u32,
    /// The flag was destroyed; all waits fail with `Destroyed`.
    destroyed: bool,
}

/// One-shot or manual-reset cross-thread wake primitive.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use eventide::EventFlag;
///
/// let flag = Arc::new(EventFlag::new());
/// let f = Arc::clone(&flag);
/// let waiter = thread::spawn(move || f.wait());
/// flag.set();
/// assert_eq!(waiter.join().unwrap(), Ok(()));
/// ```
pub struct EventFlag {
    state: Mutex<FlagState>,
    cond: Condvar,
}

impl EventFlag {
    /// Auto-reset flag starting unset.
    pub fn new() -> Self {
        Self::with_options(FlagOptions::empty())
    }

    pub fn with_options(options: FlagOptions) -> Self {
        let manual = options.contains(FlagOptions::MANUAL_RESET);
        Self {
            state: Mutex::new(FlagState {
                flag: options.contains(FlagOptions::INITIAL_SET),
                reset_value: manual,
                reset_pending: false,
                waiting: 0,
                destroyed: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, FlagState> {
        // The critical sections below never panic, so a poisoned state can
        // only come from a panicking waiter's unwind; the data is still
        // consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the flag is set.
    ///
    /// An auto-reset flag is consumed by the satisfied wait; a manual-reset
    /// flag stays set. Fails with [`ErrorKind::Destroyed`] if the flag is
    /// destroyed while waiting.
    pub fn wait(&self) -> Result<(), ErrorKind> {
        let mut s = self.state();
        s.waiting += 1;
        if s.reset_pending {
            // A pending reset cannot keep an already-parked thread blocked,
            // but it does apply to threads entering the wait.
            s.flag = false;
        }
        while !s.flag && !s.destroyed {
            s = self
                .cond
                .wait(s)
                .unwrap_or_else(PoisonError::into_inner);
        }
        s.waiting -= 1;
        if s.destroyed {
            return Err(ErrorKind::Destroyed);
        }
        s.flag = s.reset_value;
        Ok(())
    }

    /// Block until the flag is set or `timeout_ms` elapses.
    ///
    /// Returns `Ok(true)` when the wait was satisfied, `Ok(false)` on
    /// timeout, and [`ErrorKind::Destroyed`] if the flag is destroyed while
    /// waiting.
    pub fn wait_for(&self, timeout_ms: u64) -> Result<bool, ErrorKind> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut s = self.state();
        s.waiting += 1;
        if s.reset_pending {
            s.flag = false;
        }
        loop {
            if s.destroyed {
                s.waiting -= 1;
                return Err(ErrorKind::Destroyed);
            }
            if s.flag {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                s.waiting -= 1;
                return Ok(false);
            }
            let (guard, _) = self
                .cond
                .wait_timeout(s, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            s = guard;
        }
        s.waiting -= 1;
        s.flag = s.reset_value;
        Ok(true)
    }

    /// Set the flag, waking one waiter (auto-reset) or all waiters
    /// (manual-reset). Clears any pending reset.
    pub fn set(&self) {
        let mut s = self.state();
        s.reset_pending = false;
        s.flag = true;
        if s.reset_value {
            self.cond.notify_all();
        } else {
            self.cond.notify_one();
        }
    }

    /// Request a reset. Threads already parked are not kicked; the reset
    /// takes effect for threads entering a wait afterwards.
    pub fn reset(&self) {
        let mut s = self.state();
        s.reset_pending = true;
    }

    /// Tear the flag down: every current and future waiter observes
    /// [`ErrorKind::Destroyed`]. Idempotent.
    pub fn destroy(&self) {
        let mut s = self.state();
        s.destroyed = true;
        self.cond.notify_all();
    }
}

impl Default for EventFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventFlag {
    fn drop(&mut self) {
        // Exclusive access at drop means no waiter can still be parked.
        let s = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        debug_assert_eq!(s.waiting, 0, "EventFlag dropped with live waiters");
    }
}

impl core::fmt::Debug for EventFlag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = self.state();
        f.debug_struct("EventFlag")
            .field("flag", &s.flag)
            .field("manual_reset", &s.reset_value)
            .field("waiting", &s.waiting)
            .field("destroyed", &s.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_set_passes_immediately() {
        let flag = EventFlag::with_options(FlagOptions::INITIAL_SET);
        assert_eq!(flag.wait_for(0), Ok(true));
        // Auto-reset consumed the flag.
        assert_eq!(flag.wait_for(10), Ok(false));
    }

    #[test]
    fn test_auto_reset_wakes_exactly_one() {
        let flag = EventFlag::new();
        flag.set();
        assert_eq!(flag.wait_for(0), Ok(true));
        assert_eq!(flag.wait_for(10), Ok(false));
    }

    #[test]
    fn test_manual_reset_stays_set() {
        let flag = EventFlag::with_options(FlagOptions::MANUAL_RESET);
        flag.set();
        assert_eq!(flag.wait_for(0), Ok(true));
        assert_eq!(flag.wait_for(0), Ok(true));
        flag.reset();
        assert_eq!(flag.wait_for(10), Ok(false));
    }

    #[test]
    fn test_set_clears_pending_reset() {
        let flag = EventFlag::with_options(FlagOptions::MANUAL_RESET);
        flag.set();
        flag.reset();
        flag.set();
        assert_eq!(flag.wait_for(0), Ok(true));
    }

    #[test]
    fn test_destroyed_flag_fails_waits() {
        let flag = EventFlag::new();
        flag.destroy();
        assert_eq!(flag.wait(), Err(ErrorKind::Destroyed));
        assert_eq!(flag.wait_for(5), Err(ErrorKind::Destroyed));
    }
}
