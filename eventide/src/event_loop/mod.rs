//! Multi-threaded event loop over the concurrent functor queue.
//!
//! Worker threads drain the queue and fire due timer entries; when there is
//! nothing to do they park on a wake flag. Threads come in two kinds:
//! *managed* threads spawned by [`run`](EventLoop::run) (which also routes
//! loop errors to a handler), and *borrowed* threads where the caller pumps
//! the loop itself via [`pump`](EventLoop::pump), for work that must stay
//! on a specific thread.
//!
//! Panics and failed completions inside tasks never tear a worker down:
//! they are captured into [`Exception`] handles and surfaced at the
//! [`invoke`](EventLoop::invoke) call site or the error handler passed to
//! `run`. A panicking error handler terminates the process.

pub mod timer;

use std::cell::Cell;
use std::collections::BinaryHeap;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::error::{Completion, ErrorKind};
use crate::exception::Exception;
use crate::functor::Functor;
use crate::queue::{ConcurrentFunctorQueue, DEFAULT_BLOCK_SIZE};
use crate::sync::{AtomicMutex, EventFlag};

use timer::TimerEntry;

/// Cap on one timed park in milliseconds; the loop re-checks its state at
/// least this often while a timer deadline is pending.
const MAX_PARK_MS: u64 = 0xFFFF;

thread_local! {
    /// Whether the current thread is inside `pump` of some loop; lets
    /// `stop` called from a task avoid waiting for its own exit.
    static IN_PUMP: Cell<bool> = const { Cell::new(false) };
}

/// Multi-threaded event loop: a functor queue, a worker pool, and a timer
/// queue for delayed and periodic tasks.
///
/// Tasks are callables `FnMut(&EventLoop) -> Completion`. Returning
/// [`Completion::Canceled`] from a periodic task stops its rescheduling;
/// returning it from anything else is treated as a failure. Failures and
/// panics surface through the error handler given to [`run`](Self::run),
/// or at the [`invoke`](Self::invoke) call site.
pub struct EventLoop {
    queue: ConcurrentFunctorQueue<EventLoop, Completion>,
    /// Queued items: immediate queue entries plus pending timer entries.
    queue_items: AtomicUsize,
    running: AtomicBool,
    stopping: AtomicBool,
    /// Threads currently inside `pump` (managed and borrowed).
    threads: AtomicU32,
    /// Threads currently parked on the wake flag.
    threads_waiting: AtomicU32,
    wake: EventFlag,
    loop_ended: EventFlag,
    managed: Mutex<Vec<thread::JoinHandle<()>>>,
    timers: AtomicMutex<BinaryHeap<TimerEntry>>,
}

/// Erased call packet for `invoke`: raw pointers into the invoking caller's
/// frame, which stays alive because the caller parks until the packet
/// completes.
struct InvokePacket {
    call: unsafe fn(*mut (), &EventLoop) -> Completion,
    data: *mut (),
    slot: *mut Option<Exception>,
    done: *const EventFlag,
}

// SAFETY: the pointers target the invoking caller's stack frame; the caller
// blocks on `done` until the packet has run, so the frame outlives every
// access from the worker thread. The callable itself is required to be
// `Send` by `invoke`.
unsafe impl Send for InvokePacket {}

/// # Safety
///
/// `data` must point at a live `Option<F>` that no other code accesses for
/// the duration of the call.
unsafe fn invoke_shim<F: FnOnce(&EventLoop) -> Completion>(
    data: *mut (),
    el: &EventLoop,
) -> Completion {
    // SAFETY: `data` points at the caller's `Option<F>`, alive and not
    // accessed by the caller until the completion flag is set.
    match unsafe { (*data.cast::<Option<F>>()).take() } {
        Some(f) => f(el),
        None => Completion::Failed(ErrorKind::BadCall),
    }
}

impl EventLoop {
    /// Event loop with the default queue block size.
    pub fn new() -> Result<Arc<Self>, ErrorKind> {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(block_size: usize) -> Result<Arc<Self>, ErrorKind> {
        Ok(Arc::new(Self {
            queue: ConcurrentFunctorQueue::with_block_size(block_size)?,
            queue_items: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            threads: AtomicU32::new(0),
            threads_waiting: AtomicU32::new(0),
            wake: EventFlag::new(),
            loop_ended: EventFlag::new(),
            managed: Mutex::new(Vec::new()),
            timers: AtomicMutex::new(BinaryHeap::new()),
        }))
    }

    /// Number of pending items (queue entries plus timer entries).
    pub fn pending(&self) -> usize {
        self.queue_items.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue a task and return immediately.
    ///
    /// The task's failure (or panic) surfaces through the loop's error
    /// handler, never to the poster.
    pub fn post<F>(&self, f: F) -> Result<(), ErrorKind>
    where
        F: FnMut(&EventLoop) -> Completion + Send + 'static,
    {
        self.queue_items.fetch_add(1, Ordering::SeqCst);
        match self.queue.push(f) {
            Ok(()) => {
                self.wake.set();
                Ok(())
            }
            Err(kind) => {
                self.queue_items.fetch_sub(1, Ordering::SeqCst);
                Err(kind)
            }
        }
    }

    /// Queue an owning [`Functor`] and return immediately.
    pub fn post_functor(&self, f: Functor<EventLoop, Completion>) -> Result<(), ErrorKind> {
        self.queue_items.fetch_add(1, Ordering::SeqCst);
        match self.queue.push_functor(f) {
            Ok(()) => {
                self.wake.set();
                Ok(())
            }
            Err(kind) => {
                self.queue_items.fetch_sub(1, Ordering::SeqCst);
                Err(kind)
            }
        }
    }

    /// Run a task on the loop and wait for it to finish.
    ///
    /// The task's failure or panic is rethrown here as an [`Exception`],
    /// not routed to the error handler. The loop must be pumped by some
    /// thread for this to return; invoking from inside the only loop
    /// thread deadlocks.
    pub fn invoke<F>(&self, f: F) -> Result<(), Exception>
    where
        F: FnOnce(&EventLoop) -> Completion + Send,
    {
        let done = EventFlag::new();
        let mut slot: Option<Exception> = None;
        let mut cell = Some(f);
        let packet = InvokePacket {
            call: invoke_shim::<F>,
            data: (&mut cell as *mut Option<F>).cast(),
            slot: &mut slot,
            done: &done,
        };

        self.queue_items.fetch_add(1, Ordering::SeqCst);
        let pushed = self.queue.push(move |el: &EventLoop| {
            let packet = &packet;
            let outcome = match Exception::catch(||
                // SAFETY: the caller of `invoke` is parked on `done`, so
                // the packet's targets are alive.
                unsafe { (packet.call)(packet.data, el) })
            {
                Ok(c) => c.err().map(Exception::from_kind),
                Err(e) => Some(e),
            };
            // SAFETY: as above; the slot write happens before the flag is
            // set, and the caller reads it only after the wait returns.
            unsafe {
                *packet.slot = outcome;
                (*packet.done).set();
            }
            Completion::Done
        });

        match pushed {
            Ok(()) => {
                self.wake.set();
                // The flag lives on this frame; it cannot be destroyed
                // while we wait.
                let _ = done.wait();
            }
            Err(kind) => {
                self.queue_items.fetch_sub(1, Ordering::SeqCst);
                return Err(Exception::from_kind(kind));
            }
        }

        match slot.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Schedule `f` to run once after `delay_ms` milliseconds.
    pub fn timeout<F>(&self, f: F, delay_ms: u64)
    where
        F: FnMut(&EventLoop) -> Completion + Send + 'static,
    {
        self.schedule(Functor::new(f), delay_ms, Duration::ZERO);
    }

    /// Schedule `f` to run every `interval_ms` milliseconds, starting one
    /// interval from now, until it returns [`Completion::Canceled`].
    pub fn interval<F>(&self, f: F, interval_ms: u64)
    where
        F: FnMut(&EventLoop) -> Completion + Send + 'static,
    {
        self.schedule(
            Functor::new(f),
            interval_ms,
            Duration::from_millis(interval_ms),
        );
    }

    /// Schedule a prebuilt [`Functor`] to run once after `delay_ms`
    /// milliseconds.
    pub fn timeout_functor(&self, f: Functor<EventLoop, Completion>, delay_ms: u64) {
        self.schedule(f, delay_ms, Duration::ZERO);
    }

    /// Schedule a prebuilt [`Functor`] to run every `interval_ms`
    /// milliseconds until it returns [`Completion::Canceled`].
    pub fn interval_functor(&self, f: Functor<EventLoop, Completion>, interval_ms: u64) {
        self.schedule(f, interval_ms, Duration::from_millis(interval_ms));
    }

    fn schedule(&self, functor: Functor<EventLoop, Completion>, delay_ms: u64, interval: Duration) {
        let deadline = Instant::now() + Duration::from_millis(delay_ms);
        self.queue_items.fetch_add(1, Ordering::SeqCst);
        self.timers.lock().push(TimerEntry {
            functor,
            deadline,
            interval,
        });
        self.wake.set();
    }

    /// Spawn a managed worker thread that pumps the loop until
    /// [`stop`](Self::stop).
    ///
    /// Loop errors (failed completions, task panics) are passed to
    /// `on_error`. If `on_error` itself panics the process is aborted;
    /// there is nowhere left to surface the failure.
    pub fn run<E>(self: &Arc<Self>, mut on_error: E) -> Result<(), ErrorKind>
    where
        E: FnMut(Exception) + Send + 'static,
    {
        let el = Arc::clone(self);
        let mut guard = self.managed.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = thread::Builder::new()
            .name("eventide-worker".into())
            .spawn(move || {
                debug!("event loop worker started");
                loop {
                    if let Err(e) = el.pump() {
                        if let Err(handler_err) = Exception::catch(|| on_error(e)) {
                            error!("event loop error handler panicked: {handler_err}");
                            handler_err.discard();
                            process::abort();
                        }
                    }
                    if !el.running.load(Ordering::Acquire) {
                        break;
                    }
                }
                debug!("event loop worker stopped");
            })
            .map_err(|_| ErrorKind::WouldBlock)?;
        guard.push(handle);
        Ok(())
    }

    /// Run `work` on a fresh detached thread, then post `callback` to the
    /// loop with the work finished.
    ///
    /// Keeps blocking work off the loop's workers while the continuation
    /// still runs on them.
    pub fn offload<W, C>(self: &Arc<Self>, work: W, callback: C) -> Result<(), ErrorKind>
    where
        W: FnOnce() + Send + 'static,
        C: FnMut(&EventLoop) -> Completion + Send + 'static,
    {
        let el = Arc::clone(self);
        thread::Builder::new()
            .name("eventide-offload".into())
            .spawn(move || {
                work();
                if let Err(kind) = el.post(callback) {
                    error!("offload callback could not be queued: {kind}");
                }
            })
            .map(drop)
            .map_err(|_| ErrorKind::WouldBlock)
    }

    /// Pump the loop on the calling (borrowed) thread.
    ///
    /// Returns when the loop is stopped, or with an [`Exception`] when a
    /// task failed; the caller decides how to surface it. Re-enter to keep
    /// pumping after an error.
    pub fn pump(&self) -> Result<(), Exception> {
        if self.stopping.load(Ordering::Acquire) {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        if self.stopping.load(Ordering::Acquire) {
            self.running.store(false, Ordering::SeqCst);
            return Ok(());
        }
        self.threads.fetch_add(1, Ordering::AcqRel);
        IN_PUMP.with(|c| c.set(true));
        let result = self.pump_inner();
        IN_PUMP.with(|c| c.set(false));
        self.threads.fetch_sub(1, Ordering::AcqRel);
        // Cascade the wake so sibling workers re-check the running flag.
        self.wake.set();
        self.loop_ended.set();
        result
    }

    fn pump_inner(&self) -> Result<(), Exception> {
        while self.running.load(Ordering::Acquire) {
            // Drain the immediate queue.
            while self.queue_items.load(Ordering::Acquire) != 0 {
                match self.queue.try_call_and_pop(self) {
                    Ok(Some(completion)) => {
                        self.queue_items.fetch_sub(1, Ordering::SeqCst);
                        if let Some(kind) = completion.err() {
                            return Err(Exception::from_kind(kind));
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.queue_items.fetch_sub(1, Ordering::SeqCst);
                        return Err(e);
                    }
                }
            }

            // Fire due timers; when the nearest deadline is in the future
            // this parks with a capped timeout instead.
            let parked = self.process_timers()?;

            if !self.running.load(Ordering::Acquire) {
                break;
            }

            if !parked {
                self.threads_waiting.fetch_add(1, Ordering::AcqRel);
                let wait = self.wake.wait();
                self.threads_waiting.fetch_sub(1, Ordering::AcqRel);
                if let Err(kind) = wait {
                    return Err(Exception::from_kind(kind));
                }
                self.wake_siblings();
            }
        }
        Ok(())
    }

    /// Process the timer queue. Returns `Ok(true)` when the thread parked
    /// (timed) waiting for a future deadline.
    fn process_timers(&self) -> Result<bool, Exception> {
        loop {
            let mut timers = self.timers.lock();
            let deadline = match timers.peek() {
                Some(top) => top.deadline,
                None => return Ok(false),
            };
            let now = Instant::now();
            if deadline > now {
                drop(timers);
                let wait_ms = ((deadline - now).as_millis() as u64).clamp(1, MAX_PARK_MS);
                self.threads_waiting.fetch_add(1, Ordering::AcqRel);
                let wait = self.wake.wait_for(wait_ms);
                self.threads_waiting.fetch_sub(1, Ordering::AcqRel);
                if let Err(kind) = wait {
                    return Err(Exception::from_kind(kind));
                }
                self.wake_siblings();
                return Ok(true);
            }
            let entry = timers.pop();
            drop(timers);
            let Some(mut entry) = entry else {
                return Ok(false);
            };

            let mut slot: Option<Exception> = None;
            let completion = entry.functor.try_call(&mut slot, self);
            self.queue_items.fetch_sub(1, Ordering::SeqCst);

            let canceled = completion.is_canceled();
            if slot.is_none() {
                if let Completion::Failed(kind) = completion {
                    slot = Some(Exception::from_kind(kind));
                }
            }
            // A failing periodic entry is still rescheduled; only an
            // explicit cancel stops it.
            if !canceled && entry.is_periodic() {
                entry.deadline += entry.interval;
                self.queue_items.fetch_add(1, Ordering::SeqCst);
                self.timers.lock().push(entry);
            }
            if let Some(e) = slot {
                return Err(e);
            }
        }
    }

    fn wake_siblings(&self) {
        // More than one item left and more than one sibling parked: pass
        // the wake along so another worker picks up the next item.
        if self.queue_items.load(Ordering::Acquire) > 1
            && self.threads_waiting.load(Ordering::Acquire) > 1
        {
            self.wake.set();
        }
    }

    /// Stop the loop: managed threads are joined, borrowed threads are
    /// waited for until they leave [`pump`](Self::pump). Idempotent.
    ///
    /// Queued items that no thread got to are discarded with the queue,
    /// not run; use [`join`](Self::join) first to drain.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let mut guard = self.managed.lock().unwrap_or_else(PoisonError::into_inner);
        self.stopping.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.wake.set();

        let current = thread::current().id();
        for handle in guard.drain(..) {
            if handle.thread().id() == current {
                // stop() from inside a managed task: the thread cannot
                // join itself; it unwinds out of pump on its own.
                continue;
            }
            let _ = handle.join();
        }

        // Borrowed threads (and a self-stopping managed thread) leave pump
        // on their own; wait for them.
        let still_pumping = u32::from(IN_PUMP.with(|c| c.get()));
        while self.threads.load(Ordering::Acquire) > still_pumping {
            self.wake.set();
            let _ = self.loop_ended.wait_for(10);
        }
        self.stopping.store(false, Ordering::SeqCst);
    }

    /// Wait until the tasks queued before this call have been processed.
    /// With `empty`, keep waiting until the item count reaches zero.
    ///
    /// Requires the loop to be pumped by some other thread.
    pub fn join(&self, empty: bool) {
        loop {
            if let Err(e) = self.invoke(|_| Completion::Done) {
                e.discard();
                break;
            }
            if !empty || self.queue_items.load(Ordering::Acquire) == 0 {
                break;
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

impl core::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventLoop")
            .field("running", &self.is_running())
            .field("pending", &self.pending())
            .field("threads", &self.threads.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_loop_is_idle() {
        let el = EventLoop::new().unwrap();
        assert!(!el.is_running());
        assert_eq!(el.pending(), 0);
    }

    #[test]
    fn test_post_counts_pending() {
        let el = EventLoop::new().unwrap();
        el.post(|_| Completion::Done).unwrap();
        el.post(|_| Completion::Done).unwrap();
        assert_eq!(el.pending(), 2);
    }

    #[test]
    fn test_timeout_counts_pending() {
        let el = EventLoop::new().unwrap();
        el.timeout(|_| Completion::Done, 1_000);
        assert_eq!(el.pending(), 1);
    }

    #[test]
    fn test_stop_without_threads_is_noop() {
        let el = EventLoop::new().unwrap();
        el.stop();
        el.stop();
        assert!(!el.is_running());
    }
}
