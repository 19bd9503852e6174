//! Synchronization primitives.
//!
//! The crate builds its locking from atomics rather than OS mutexes where a
//! spin-yield discipline is enough: [`AtomicMutex`] for short exclusive
//! sections, [`AtomicSharedMutex`] for the reader/writer fences inside the
//! queue, and [`EventFlag`] (condition-variable based) wherever a thread
//! actually has to park.

pub mod atomic;
pub mod event_flag;
pub mod mutex;
pub mod shared_mutex;

pub use atomic::{thread_yield, Backoff};
pub use event_flag::{EventFlag, FlagOptions};
pub use mutex::{AtomicMutex, AtomicMutexGuard};
pub use shared_mutex::AtomicSharedMutex;
