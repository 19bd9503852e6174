//! Concurrent Functor Queue Tests
//!
//! Correctness tests for the block-allocated MPMC queue: single-producer
//! FIFO, block spanning and recycling, and a multi-producer/multi-consumer
//! stress run checking the no-loss/no-duplication and per-producer order
//! properties.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use eventide::{Completion, ConcurrentFunctorQueue, ErrorKind};

/// Entries append into the sink the consumer passes as the call argument.
type Sink = Mutex<Vec<(u32, u32)>>;

fn push_value(queue: &ConcurrentFunctorQueue<Sink>, producer: u32, seq: u32) {
    queue
        .push(move |sink: &Sink| {
            sink.lock().unwrap().push((producer, seq));
            Completion::Done
        })
        .expect("push");
}

fn drain_into(queue: &ConcurrentFunctorQueue<Sink>, sink: &Sink) {
    loop {
        match queue.try_call_and_pop(sink) {
            Ok(Some(Completion::Done)) => {}
            Ok(Some(other)) => panic!("unexpected completion {other:?}"),
            Ok(None) => break,
            Err(e) => panic!("unexpected entry panic: {e}"),
        }
    }
}

// ===== FIFO and boundary behaviour =====

#[test]
fn test_single_producer_single_consumer_fifo() {
    let queue = ConcurrentFunctorQueue::<Sink>::new().unwrap();
    for seq in 1..=5 {
        push_value(&queue, 0, seq);
    }
    let sink = Sink::default();
    drain_into(&queue, &sink);
    let values: Vec<u32> = sink.lock().unwrap().iter().map(|&(_, s)| s).collect();
    assert_eq!(values, [1, 2, 3, 4, 5]);
}

#[test]
fn test_pop_empty_is_nonblocking_and_stateless() {
    let queue = ConcurrentFunctorQueue::<Sink>::new().unwrap();
    let sink = Sink::default();
    assert!(matches!(queue.try_call_and_pop(&sink), Ok(None)));
    // Still works normally afterwards.
    push_value(&queue, 0, 9);
    drain_into(&queue, &sink);
    assert_eq!(sink.lock().unwrap().as_slice(), &[(0, 9)]);
    assert!(matches!(queue.try_call_and_pop(&sink), Ok(None)));
}

#[test]
fn test_oversized_entry_fails_deterministically() {
    let queue = ConcurrentFunctorQueue::<Sink>::with_block_size(256).unwrap();
    let ballast = [0u8; 1024];
    for _ in 0..3 {
        let err = queue.push(move |_: &Sink| {
            let _ = &ballast;
            Completion::Done
        });
        assert_eq!(err.err(), Some(ErrorKind::OutOfMemory));
    }
    let sink = Sink::default();
    assert!(matches!(queue.try_call_and_pop(&sink), Ok(None)));
}

// ===== Block spanning and recycling =====

#[test]
fn test_block_spanning_preserves_order_and_recycles() {
    // 256-byte blocks hold exactly three entries of this closure type
    // (64-byte preamble region, 64 bytes per aligned entry).
    let queue = ConcurrentFunctorQueue::<Sink>::with_block_size(256).unwrap();
    let queue = Arc::new(queue);

    let producer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            for seq in 0..10 {
                push_value(&queue, 1, seq);
            }
        })
    };
    producer.join().unwrap();

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let sink = Sink::default();
            drain_into(&queue, &sink);
            sink.into_inner().unwrap()
        })
    };
    let seen = consumer.join().unwrap();

    let values: Vec<u32> = seen.iter().map(|&(_, s)| s).collect();
    assert_eq!(values, (0..10).collect::<Vec<_>>());
    // Ten entries at three per block forced several block installs.
    assert!(
        queue.blocks_allocated() >= 3,
        "expected at least 3 blocks, saw {}",
        queue.blocks_allocated()
    );
    // After the drain at most one empty block is cached.
    assert!(queue.has_spare());
}

// ===== MPMC stress =====

#[test]
fn test_concurrent_drain_no_loss_no_duplication() {
    const PRODUCERS: u32 = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: u32 = 1024;

    // Small blocks on purpose: constant flipping and recycling.
    let queue = Arc::new(ConcurrentFunctorQueue::<Sink>::with_block_size(1024).unwrap());
    let done_producing = Arc::new(AtomicBool::new(false));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    push_value(&queue, producer, seq);
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let done = Arc::clone(&done_producing);
            thread::spawn(move || {
                let sink = Sink::default();
                loop {
                    match queue.try_call_and_pop(&sink) {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            if done.load(Ordering::SeqCst) {
                                // One more sweep after the producers are
                                // finished settles the race.
                                if matches!(queue.try_call_and_pop(&sink), Ok(None)) {
                                    break;
                                }
                            } else {
                                thread::sleep(Duration::from_micros(50));
                            }
                        }
                        Err(e) => panic!("unexpected entry panic: {e}"),
                    }
                }
                sink.into_inner().unwrap()
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    done_producing.store(true, Ordering::SeqCst);

    let per_consumer: Vec<Vec<(u32, u32)>> =
        consumers.into_iter().map(|c| c.join().unwrap()).collect();

    // Property: per consumer, each producer's entries appear in push order.
    for observed in &per_consumer {
        for producer in 0..PRODUCERS {
            let seqs: Vec<u32> = observed
                .iter()
                .filter(|&&(p, _)| p == producer)
                .map(|&(_, s)| s)
                .collect();
            assert!(
                seqs.windows(2).all(|w| w[0] < w[1]),
                "producer {producer} order violated: {seqs:?}"
            );
        }
    }

    // Property: the popped multiset equals the pushed multiset.
    let mut all: Vec<(u32, u32)> = per_consumer.into_iter().flatten().collect();
    all.sort_unstable();
    let mut expected: Vec<(u32, u32)> = (0..PRODUCERS)
        .flat_map(|p| (0..PER_PRODUCER).map(move |s| (p, s)))
        .collect();
    expected.sort_unstable();
    assert_eq!(all, expected);
}
