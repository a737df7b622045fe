//! Multi-thread stress tests shared by all three queues: conservation (the
//! multiset out equals the multiset in), no duplication or fabrication,
//! per-producer FIFO, capacity enforcement, and empty observation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use lockfree_queues::{BasketQueue, BoundedQueue, MsQueue};

/// Tag a value with its producer so consumers can check per-producer order.
fn encode(producer: usize, seq: usize) -> u64 {
    ((producer as u64) << 32) | seq as u64
}

fn producer_of(value: u64) -> usize {
    (value >> 32) as usize
}

fn seq_of(value: u64) -> u64 {
    value & 0xFFFF_FFFF
}

/// Check one consumer's log: within it, each producer's sequence numbers
/// must be strictly increasing (queue FIFO + sequential consumption).
fn assert_per_producer_order(log: &[u64]) {
    let mut last: HashMap<usize, u64> = HashMap::new();
    for &value in log {
        let producer = producer_of(value);
        let seq = seq_of(value);
        if let Some(&prev) = last.get(&producer) {
            assert!(
                seq > prev,
                "producer {producer} reordered: saw {seq} after {prev}"
            );
        }
        last.insert(producer, seq);
    }
}

/// Merge consumer logs and compare against everything the producers sent.
fn assert_conservation(logs: &[Vec<u64>], producers: usize, per_producer: usize) {
    let mut got: Vec<u64> = logs.iter().flatten().copied().collect();
    let mut want: Vec<u64> = (0..producers)
        .flat_map(|p| (0..per_producer).map(move |i| encode(p, i)))
        .collect();
    got.sort_unstable();
    want.sort_unstable();
    assert_eq!(got, want, "dequeued multiset differs from enqueued multiset");
}

/// Generic producers/consumers run, returning one log per consumer.
fn run_mpmc<Q>(
    queue: &Q,
    producers: usize,
    consumers: usize,
    per_producer: usize,
    enqueue: impl Fn(&Q, u64) + Sync,
    dequeue: impl Fn(&Q) -> Option<u64> + Sync,
) -> Vec<Vec<u64>>
where
    Q: Sync,
{
    let total = producers * per_producer;
    let received = AtomicUsize::new(0);
    let enqueue = &enqueue;
    let dequeue = &dequeue;
    let received = &received;

    thread::scope(|scope| {
        for p in 0..producers {
            scope.spawn(move || {
                for i in 0..per_producer {
                    enqueue(queue, encode(p, i));
                }
            });
        }

        let handles: Vec<_> = (0..consumers)
            .map(|_| {
                scope.spawn(move || {
                    let mut log = Vec::new();
                    loop {
                        if let Some(value) = dequeue(queue) {
                            log.push(value);
                            received.fetch_add(1, Ordering::Relaxed);
                        } else if received.load(Ordering::Relaxed) >= total {
                            break;
                        } else {
                            thread::yield_now();
                        }
                    }
                    log
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

// ---------------------------------------------------------------------------
// Michael-Scott queue
// ---------------------------------------------------------------------------

#[test]
fn ms_two_producers_one_consumer_keeps_order() {
    let q = MsQueue::new();
    let logs = run_mpmc(&q, 2, 1, 3, |q, v| q.enqueue(v), |q| q.dequeue());
    assert_eq!(logs[0].len(), 6);
    assert_per_producer_order(&logs[0]);
    assert_conservation(&logs, 2, 3);
    assert!(q.is_empty());
}

#[test]
fn ms_mpmc_conserves_values() {
    let q = MsQueue::new();
    let logs = run_mpmc(&q, 4, 4, 2000, |q, v| q.enqueue(v), |q| q.dequeue());
    for log in &logs {
        assert_per_producer_order(log);
    }
    assert_conservation(&logs, 4, 2000);
    assert_eq!(q.dequeue(), None);
    assert_eq!(q.len(), 0);
}

#[test]
fn ms_concurrent_dequeue_on_empty_returns_none() {
    let q = MsQueue::<u64>::new();
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..100 {
                    assert_eq!(q.dequeue(), None);
                }
            });
        }
    });
    assert!(q.is_empty());
}

// ---------------------------------------------------------------------------
// Baskets queue
// ---------------------------------------------------------------------------

#[test]
fn basket_eight_producers_eight_consumers() {
    let q = BasketQueue::new();
    let logs = run_mpmc(&q, 8, 8, 1000, |q, v| q.enqueue(v), |q| q.dequeue());
    let total: usize = logs.iter().map(Vec::len).sum();
    assert_eq!(total, 8000);
    for log in &logs {
        assert_per_producer_order(log);
    }
    assert_conservation(&logs, 8, 1000);
    assert_eq!(q.dequeue(), None);
}

#[test]
fn basket_concurrent_dequeue_on_empty_returns_none() {
    let q = BasketQueue::<u64>::new();
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..100 {
                    assert_eq!(q.dequeue(), None);
                }
            });
        }
    });
    assert!(q.is_empty());
}

// ---------------------------------------------------------------------------
// Bounded queue
// ---------------------------------------------------------------------------

#[test]
fn bounded_backpressure_with_slow_consumer() {
    let q = BoundedQueue::new(16);
    let logs = run_mpmc(
        &q,
        4,
        1,
        50,
        |q, v| q.enqueue_with_backoff(v),
        |q| {
            thread::sleep(Duration::from_millis(1));
            q.dequeue()
        },
    );
    assert_eq!(logs[0].len(), 200);
    assert_per_producer_order(&logs[0]);
    assert_conservation(&logs, 4, 50);
    assert!(q.is_empty());
}

#[test]
fn bounded_never_exceeds_capacity() {
    let q = BoundedQueue::new(16);

    // Producers race with no consumer until each observes the queue full;
    // fullness is stable without dequeues, so every success linearized
    // before the first Err.
    let successes = AtomicUsize::new(0);
    let successes_ref = &successes;
    let q_ref = &q;
    thread::scope(|scope| {
        for p in 0..4 {
            scope.spawn(move || {
                let mut i = 0;
                while q_ref.enqueue(encode(p, i)).is_ok() {
                    successes_ref.fetch_add(1, Ordering::Relaxed);
                    i += 1;
                }
            });
        }
    });
    assert_eq!(successes.load(Ordering::Relaxed), 16);

    let mut drained = 0;
    while q.dequeue().is_some() {
        drained += 1;
    }
    assert_eq!(drained, 16);
    assert!(q.is_empty());
}

#[test]
fn bounded_mpmc_conserves_values() {
    let q = BoundedQueue::new(8);
    let logs = run_mpmc(
        &q,
        4,
        4,
        500,
        |q, v| q.enqueue_with_backoff(v),
        |q| q.dequeue(),
    );
    for log in &logs {
        assert_per_producer_order(log);
    }
    assert_conservation(&logs, 4, 500);
    assert_eq!(q.dequeue(), None);
}

#[test]
fn bounded_concurrent_dequeue_on_empty_returns_none() {
    let q = BoundedQueue::<u64>::new(4);
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..100 {
                    assert_eq!(q.dequeue(), None);
                }
            });
        }
    });
    assert!(q.is_empty());
}
