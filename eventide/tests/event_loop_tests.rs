//! Event Loop Tests
//!
//! Behavior tests for the multi-threaded event loop: posting and draining,
//! synchronous invoke with exception transport, timer ordering, interval
//! self-cancellation, error-handler routing, and stop/join semantics.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use eventide::{fault, Completion, ErrorKind, EventLoop, Exception};

fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Error handler that records the kinds it sees.
fn recording_handler(seen: &Arc<Mutex<Vec<ErrorKind>>>) -> impl FnMut(Exception) + Send + 'static {
    let seen = Arc::clone(seen);
    move |e: Exception| {
        seen.lock().unwrap().push(e.kind());
        e.discard();
    }
}

fn ignoring_handler() -> impl FnMut(Exception) + Send + 'static {
    |e: Exception| e.discard()
}

// ===== Posting and draining =====

#[test]
fn test_post_runs_tasks_in_order_on_single_worker() {
    let el = EventLoop::new().unwrap();
    el.run(ignoring_handler()).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for value in 1..=5u32 {
        let order = Arc::clone(&order);
        el.post(move |_| {
            order.lock().unwrap().push(value);
            Completion::Done
        })
        .unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || order.lock().unwrap().len() == 5));
    assert_eq!(*order.lock().unwrap(), [1, 2, 3, 4, 5]);
    el.stop();
}

#[test]
fn test_many_workers_drain_everything() {
    let el = EventLoop::new().unwrap();
    for _ in 0..4 {
        el.run(ignoring_handler()).unwrap();
    }

    let counter = Arc::new(AtomicU32::new(0));
    for _ in 0..200 {
        let counter = Arc::clone(&counter);
        el.post(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Completion::Done
        })
        .unwrap();
    }

    el.join(true);
    assert_eq!(counter.load(Ordering::SeqCst), 200);
    assert_eq!(el.pending(), 0);
    el.stop();
}

#[test]
fn test_post_functor_runs_prebuilt_task() {
    use eventide::Functor;

    let el = EventLoop::new().unwrap();
    el.run(ignoring_handler()).unwrap();

    let hits = Arc::new(AtomicU32::new(0));
    let h = Arc::clone(&hits);
    let task: Functor<EventLoop> = Functor::new(move |_| {
        h.fetch_add(1, Ordering::SeqCst);
        Completion::Done
    });
    el.post_functor(task).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        hits.load(Ordering::SeqCst) == 1
    }));
    el.stop();
}

#[test]
fn test_task_can_post_from_inside_the_loop() {
    let el = EventLoop::new().unwrap();
    el.run(ignoring_handler()).unwrap();

    let hits = Arc::new(AtomicU32::new(0));
    let h = Arc::clone(&hits);
    el.post(move |el: &EventLoop| {
        let h = Arc::clone(&h);
        el.post(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Completion::Done
        })
        .unwrap();
        Completion::Done
    })
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        hits.load(Ordering::SeqCst) == 1
    }));
    el.stop();
}

// ===== Invoke and exception transport =====

#[test]
fn test_invoke_runs_synchronously() {
    let el = EventLoop::new().unwrap();
    el.run(ignoring_handler()).unwrap();

    let hits = Arc::new(AtomicU32::new(0));
    let h = Arc::clone(&hits);
    el.invoke(move |_| {
        h.fetch_add(1, Ordering::SeqCst);
        Completion::Done
    })
    .unwrap();
    // Happens-before the return from invoke.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    el.stop();
}

#[test]
fn test_invoke_surfaces_raised_fault() {
    let el = EventLoop::new().unwrap();
    el.run(ignoring_handler()).unwrap();

    let err = el
        .invoke(|_| fault(ErrorKind::InvalidArgument, "bad"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(err.message(), "bad");

    // Rethrowing reproduces the invalid-argument category and message.
    let again = Exception::catch(move || -> () { err.rethrow() }).unwrap_err();
    assert_eq!(again.kind(), ErrorKind::InvalidArgument);
    assert_eq!(again.message(), "bad");
    again.discard();
    el.stop();
}

#[test]
fn test_invoke_surfaces_failed_completion() {
    let el = EventLoop::new().unwrap();
    el.run(ignoring_handler()).unwrap();

    let err = el
        .invoke(|_| Completion::Failed(ErrorKind::Domain))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Domain);
    err.discard();

    // Canceled outside an interval is a failure as well.
    let err = el.invoke(|_| Completion::Canceled).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);
    err.discard();
    el.stop();
}

// ===== Error handler routing =====

#[test]
fn test_post_failures_go_to_error_handler() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let el = EventLoop::new().unwrap();
    el.run(recording_handler(&seen)).unwrap();

    el.post(|_| Completion::Failed(ErrorKind::Range)).unwrap();
    el.post(|_| -> Completion { panic!("task panic") }).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        seen.lock().unwrap().len() == 2
    }));
    let seen = seen.lock().unwrap();
    assert!(seen.contains(&ErrorKind::Range));
    assert!(seen.contains(&ErrorKind::Other));
    el.stop();
}

// ===== Timers =====

#[test]
fn test_timeouts_fire_in_deadline_order() {
    let el = EventLoop::new().unwrap();
    el.run(ignoring_handler()).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for delay in [30u64, 10, 20] {
        let order = Arc::clone(&order);
        el.timeout(
            move |_| {
                order.lock().unwrap().push(delay);
                Completion::Done
            },
            delay,
        );
    }

    assert!(wait_until(Duration::from_secs(5), || order.lock().unwrap().len() == 3));
    assert_eq!(*order.lock().unwrap(), [10, 20, 30]);
    el.stop();
}

#[test]
fn test_zero_timeout_fires_promptly() {
    let el = EventLoop::new().unwrap();
    el.run(ignoring_handler()).unwrap();

    let hits = Arc::new(AtomicU32::new(0));
    let h = Arc::clone(&hits);
    el.timeout(
        move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Completion::Done
        },
        0,
    );
    assert!(wait_until(Duration::from_secs(5), || {
        hits.load(Ordering::SeqCst) == 1
    }));
    el.stop();
}

#[test]
fn test_interval_cancels_after_third_run() {
    let el = EventLoop::new().unwrap();
    el.run(ignoring_handler()).unwrap();

    let start = Instant::now();
    let count = Arc::new(AtomicU32::new(0));
    let third_at = Arc::new(Mutex::new(None));
    let c = Arc::clone(&count);
    let t = Arc::clone(&third_at);
    el.interval(
        move |_| {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= 3 {
                *t.lock().unwrap() = Some(start.elapsed());
                Completion::Canceled
            } else {
                Completion::Done
            }
        },
        10,
    );

    assert!(wait_until(Duration::from_secs(5), || {
        count.load(Ordering::SeqCst) >= 3
    }));
    // No further invocation after the cancel.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(count.load(Ordering::SeqCst), 3);
    // Three 10 ms intervals cannot complete before 30 ms.
    let elapsed = third_at.lock().unwrap().expect("third run recorded");
    assert!(elapsed >= Duration::from_millis(30), "third at {elapsed:?}");
    assert_eq!(el.pending(), 0);
    el.stop();
}

#[test]
fn test_functor_timer_entry_points() {
    use eventide::Functor;

    let el = EventLoop::new().unwrap();
    el.run(ignoring_handler()).unwrap();

    let hits = Arc::new(AtomicU32::new(0));
    let h = Arc::clone(&hits);
    el.timeout_functor(
        Functor::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Completion::Done
        }),
        5,
    );
    let h = Arc::clone(&hits);
    el.interval_functor(
        Functor::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Completion::Canceled
        }),
        5,
    );

    assert!(wait_until(Duration::from_secs(5), || {
        hits.load(Ordering::SeqCst) == 2
    }));
    // The interval canceled itself on its first run.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    el.stop();
}

// ===== Offloaded work =====

#[test]
fn test_offload_runs_work_then_callback_on_loop() {
    let el = EventLoop::new().unwrap();
    el.run(ignoring_handler()).unwrap();

    let stages = Arc::new(Mutex::new(Vec::new()));
    let s1 = Arc::clone(&stages);
    let s2 = Arc::clone(&stages);
    el.offload(
        move || s1.lock().unwrap().push("work"),
        move |_| {
            s2.lock().unwrap().push("callback");
            Completion::Done
        },
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        stages.lock().unwrap().len() == 2
    }));
    assert_eq!(*stages.lock().unwrap(), ["work", "callback"]);
    el.stop();
}

// ===== Borrowed threads, stop, join =====

#[test]
fn test_borrowed_thread_pumps_the_loop() {
    let el = EventLoop::new().unwrap();
    let pump_el = Arc::clone(&el);
    let pumper = thread::spawn(move || pump_el.pump());

    let hits = Arc::new(AtomicU32::new(0));
    let h = Arc::clone(&hits);
    el.invoke(move |_| {
        h.fetch_add(1, Ordering::SeqCst);
        Completion::Done
    })
    .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    el.stop();
    assert!(pumper.join().unwrap().is_ok());
}

#[test]
fn test_stop_is_idempotent_and_joins_workers() {
    let el = EventLoop::new().unwrap();
    for _ in 0..2 {
        el.run(ignoring_handler()).unwrap();
    }
    // Give the workers something to chew on first.
    let counter = Arc::new(AtomicU32::new(0));
    for _ in 0..10 {
        let counter = Arc::clone(&counter);
        el.post(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Completion::Done
        })
        .unwrap();
    }
    el.join(true);

    el.stop();
    assert!(!el.is_running());
    el.stop();
    assert!(!el.is_running());
    assert_eq!(counter.load(Ordering::SeqCst), 10);
}

#[test]
fn test_join_empty_waits_for_queue_drain() {
    let el = EventLoop::new().unwrap();
    el.run(ignoring_handler()).unwrap();

    let counter = Arc::new(AtomicU32::new(0));
    for _ in 0..50 {
        let counter = Arc::clone(&counter);
        el.post(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Completion::Done
        })
        .unwrap();
    }
    el.join(true);
    assert_eq!(counter.load(Ordering::SeqCst), 50);
    assert_eq!(el.pending(), 0);
    el.stop();
}
