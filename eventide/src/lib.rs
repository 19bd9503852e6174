//! Eventide: concurrency primitives and a multi-threaded event loop.
//!
//! The crate is built around two tightly coupled pieces:
//!
//! - [`ConcurrentFunctorQueue`]: a lock-free multi-producer multi-consumer
//!   queue that stores variable-sized, type-erased callables inline inside
//!   fixed-size blocks, so a warm queue pushes without allocating.
//! - [`EventLoop`]: a pool of worker threads draining that queue, plus a
//!   timer queue for delayed and periodic tasks, with panics carried
//!   across thread boundaries as [`Exception`] handles.
//!
//! Underneath sit the primitives they are made of: spin-yield locks
//! ([`AtomicMutex`], [`AtomicSharedMutex`]), a parking wake flag
//! ([`EventFlag`]), and the type-erased callable containers ([`Functor`],
//! [`FunctorView`], [`FunctorVt`]). All of them are usable on their own.
//!
//! # Example
//!
//! ```
//! use eventide::{Completion, EventLoop};
//!
//! let el = EventLoop::new().unwrap();
//! el.run(|err| {
//!     eprintln!("task failed: {err}");
//!     err.discard();
//! })
//! .unwrap();
//!
//! el.invoke(|_| {
//!     println!("on a worker thread");
//!     Completion::Done
//! })
//! .unwrap();
//!
//! el.stop();
//! ```

pub mod error;
pub mod event_loop;
pub mod exception;
pub mod functor;
pub mod queue;
pub mod sync;

pub use error::{Completion, ErrorKind, EventResult};
pub use event_loop::EventLoop;
pub use exception::{fault, Exception, Fault};
pub use functor::{Functor, FunctorView, FunctorVt, FUNCTOR_ALIGN, INLINE_CAPACITY};
pub use queue::{ConcurrentFunctorQueue, DEFAULT_BLOCK_SIZE};
pub use sync::{AtomicMutex, AtomicSharedMutex, EventFlag, FlagOptions};
