//! Cross-module concurrency stress tests.
//!
//! # Running with tracing
//!
//! To see full debug output, run with the tracing feature and no capture:
//! ```bash
//! cargo test --features tracing controlled_delete -- --nocapture
//! RUST_LOG=talos=trace cargo test --features tracing -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

use talos::pool::{Pool, Reusable, ReusableCore, recycle};
use talos::queue::{BoundedQueue, Links, MpscQueue, Node};
use talos::reclaim::Reclaimer;
use talos::registry::HandleRegistry;

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        talos::init_tracing();
    });
}

fn reclaimer(grace_ms: u64) -> Arc<Reclaimer> {
    Reclaimer::start(Duration::from_millis(grace_ms))
}

/// Tagged queue element for the intrusive engines.
struct Tagged {
    links: Links<Tagged>,
    tag: usize,
}

unsafe impl Node for Tagged {
    fn links(&self) -> &Links<Self> {
        &self.links
    }
}

fn tagged(tag: usize) -> Arc<Tagged> {
    Arc::new(Tagged {
        links: Links::new(),
        tag,
    })
}

/// Pooled scratch element.
struct Job {
    core: ReusableCore<Job>,
    touched: AtomicUsize,
}

// SAFETY: links live in the embedded core; the pool protocol keeps the
// element in at most one queue.
unsafe impl Node for Job {
    fn links(&self) -> &Links<Self> {
        self.core.links()
    }
}

impl Reusable for Job {
    fn core(&self) -> &ReusableCore<Self> {
        &self.core
    }
}

fn job() -> Arc<Job> {
    Arc::new(Job {
        core: ReusableCore::new(),
        touched: AtomicUsize::new(0),
    })
}

#[test]
fn mpsc_multiset_is_preserved_across_producers() {
    init_test_tracing();
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 5_000;

    let queue = Arc::new(MpscQueue::new());
    let handles: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.enqueue(tagged(p * PER_PRODUCER + i));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Full drain after all producers joined: the dequeued multiset must
    // equal the enqueued multiset — no loss, no duplication.
    let mut seen = vec![false; PRODUCERS * PER_PRODUCER];
    let mut buffer = Vec::with_capacity(PRODUCERS * PER_PRODUCER);
    while queue.dequeue_all(&mut buffer, 1024) > 0 {}
    assert_eq!(buffer.len(), PRODUCERS * PER_PRODUCER);
    for element in &buffer {
        assert!(!seen[element.tag], "duplicate tag {}", element.tag);
        seen[element.tag] = true;
    }
}

#[test]
fn mpsc_no_loss_with_live_consumer() {
    init_test_tracing();
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 10_000;

    let queue = Arc::new(MpscQueue::new());
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.enqueue(tagged(p * PER_PRODUCER + i));
                    // Random jitter shakes out producer/consumer interleavings.
                    if rand::random::<u8>() < 4 {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    // Consumer drains continuously while producers run; "spuriously
    // empty" reads are retried by polling.
    let mut seen = vec![false; PRODUCERS * PER_PRODUCER];
    let mut count = 0;
    while count < PRODUCERS * PER_PRODUCER {
        if let Some(element) = queue.dequeue() {
            assert!(!seen[element.tag], "duplicate tag {}", element.tag);
            seen[element.tag] = true;
            count += 1;
        } else {
            std::hint::spin_loop();
        }
    }
    for producer in producers {
        producer.join().unwrap();
    }
    assert!(queue.dequeue().is_none());
}

#[test]
fn mpsc_per_producer_order_is_fifo() {
    init_test_tracing();
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 5_000;

    let queue = Arc::new(MpscQueue::new());
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.enqueue(tagged(p * PER_PRODUCER + i));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    // Elements of one producer must come out in the order that producer
    // enqueued them, whatever the interleaving between producers.
    let mut last_seen = vec![None::<usize>; PRODUCERS];
    while let Some(element) = queue.dequeue() {
        let producer = element.tag / PER_PRODUCER;
        let sequence = element.tag % PER_PRODUCER;
        if let Some(previous) = last_seen[producer] {
            assert!(sequence > previous, "producer {producer} reordered");
        }
        last_seen[producer] = Some(sequence);
    }
    for (producer, last) in last_seen.iter().enumerate() {
        assert_eq!(*last, Some(PER_PRODUCER - 1), "producer {producer} lost items");
    }
}

#[test]
fn bounded_length_converges_to_the_soft_bound() {
    init_test_tracing();
    const MAX: usize = 64;
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 5_000;

    let queue = Arc::new(BoundedQueue::new(Some(MAX), reclaimer(50)));
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.enqueue((p * PER_PRODUCER + i) as u64);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    // Once enqueue traffic stops the estimate must sit at or near the
    // bound; the eviction loop is best-effort, so allow a small slack.
    let len = queue.len_estimate();
    assert!(len <= MAX + PRODUCERS, "length {len} did not converge");

    let mut drained = 0;
    while queue.dequeue().is_some() {
        drained += 1;
    }
    assert!(drained <= MAX + PRODUCERS);
    assert!(drained > 0);
}

#[test]
fn bounded_dequeue_all_returns_exact_sequence() {
    init_test_tracing();
    let queue = BoundedQueue::new(None, reclaimer(50));
    queue.enqueue('A');
    queue.enqueue('B');
    queue.enqueue('C');

    let mut fragment = queue.dequeue_all();
    let mut drained = Vec::new();
    while let Some(value) = fragment.dequeue() {
        drained.push(value);
    }
    drop(fragment);

    assert_eq!(drained, vec!['A', 'B', 'C']);
    assert!(queue.is_empty());
    assert!(queue.dequeue().is_none());
}

#[test]
fn recycle_round_trip_across_threads() {
    init_test_tracing();
    let pool = Pool::new(reclaimer(50));
    let element = job();
    pool.attach(&element, false).unwrap();

    element.touched.fetch_add(1, Ordering::Relaxed);
    let worker = thread::spawn(move || recycle(element));
    worker.join().unwrap();

    let again = pool.get_unused().expect("element came back to the pool");
    assert_eq!(again.touched.load(Ordering::Relaxed), 1);
}

#[test]
fn controlled_delete_races_recyclers_without_corruption() {
    init_test_tracing();
    let reclaimer = reclaimer(30);

    for _round in 0..25 {
        let pool = Pool::new(Arc::clone(&reclaimer));
        for _ in 0..8 {
            pool.attach(&job(), true).unwrap();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let recycler = {
            let pool = Arc::clone(&pool);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut cycles = 0usize;
                while !stop.load(Ordering::Acquire) {
                    if let Some(element) = pool.get_unused() {
                        element.touched.fetch_add(1, Ordering::Relaxed);
                        recycle(element);
                        cycles += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
                cycles
            })
        };

        thread::sleep(Duration::from_millis(2));
        pool.controlled_delete();
        stop.store(true, Ordering::Release);

        // Elements caught mid-recycle must self-destruct, not corrupt the
        // half-dismantled pool: the join surfaces any panic.
        recycler.join().unwrap();
    }

    thread::sleep(Duration::from_millis(60));
    reclaimer.sweep_now();
}

#[test]
fn registry_handles_stay_unique_under_churn() {
    init_test_tracing();
    const THREADS: usize = 4;
    const ITERATIONS: usize = 2_000;

    let registry = Arc::new(HandleRegistry::new(reclaimer(30)));
    let live = Arc::new(Mutex::new(std::collections::HashSet::new()));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let live = Arc::clone(&live);
            thread::spawn(move || {
                for i in 0..ITERATIONS {
                    let object = Arc::new(i as u64);
                    let handle = registry.register(&object);
                    {
                        let mut live = live.lock().unwrap();
                        assert!(
                            live.insert(u32::from(handle)),
                            "handle {handle} assigned to two live objects"
                        );
                    }
                    assert!(registry.resolve(handle).is_some());
                    {
                        let mut live = live.lock().unwrap();
                        live.remove(&u32::from(handle));
                    }
                    registry.unregister(handle);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}
