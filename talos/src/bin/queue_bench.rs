//! Queue throughput and round-trip benchmark.
//!
//! Usage:
//!     cargo run --release --bin queue_bench
//!
//! Environment variables:
//!     PRODUCER_CPU=0  Pin the producer to CPU 0 (default: 0)
//!     CONSUMER_CPU=2  Pin the consumer to CPU 2 (default: 2)

use std::env;
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use talos::queue::{Links, MpscQueue, Node, ValueQueue};
use talos::reclaim::Reclaimer;

const ITERATIONS: usize = 1 << 20;

struct Payload {
    links: Links<Payload>,
    value: u64,
}

unsafe impl Node for Payload {
    fn links(&self) -> &Links<Self> {
        &self.links
    }
}

fn get_cpu_affinity() -> (Option<usize>, Option<usize>) {
    let producer_cpu = env::var("PRODUCER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(0));
    let consumer_cpu = env::var("CONSUMER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(2));
    (producer_cpu, consumer_cpu)
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
}

fn bench_mpsc_throughput(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let queue = Arc::new(MpscQueue::<Payload>::new());
    let ready = Arc::new(AtomicBool::new(false));

    let consumer_thread = {
        let queue = Arc::clone(&queue);
        let ready = Arc::clone(&ready);
        std::thread::spawn(move || {
            pin_to_cpu(consumer_cpu);
            ready.store(true, Ordering::Release);

            let mut expected = 0u64;
            while expected < ITERATIONS as u64 {
                if let Some(element) = queue.dequeue() {
                    if element.value != expected {
                        panic!("reordered: expected {}, got {}", expected, element.value);
                    }
                    expected += 1;
                } else {
                    hint::spin_loop();
                }
            }
        })
    };

    while !ready.load(Ordering::Acquire) {
        hint::spin_loop();
    }
    pin_to_cpu(producer_cpu);

    let start = Instant::now();
    for i in 0..ITERATIONS as u64 {
        queue.enqueue(Arc::new(Payload {
            links: Links::new(),
            value: i,
        }));
    }
    consumer_thread.join().unwrap();
    let elapsed = start.elapsed();

    let ops_per_ms = ITERATIONS as u128 * 1_000_000 / elapsed.as_nanos();
    println!("mpsc enqueue+dequeue: {} ops/ms", ops_per_ms);
}

fn bench_value_queue_round_trip(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let reclaimer = Reclaimer::start(Reclaimer::DEFAULT_GRACE);
    let queue = Arc::new(ValueQueue::new(reclaimer));
    let ready = Arc::new(AtomicBool::new(false));

    let consumer_thread = {
        let queue = Arc::clone(&queue);
        let ready = Arc::clone(&ready);
        std::thread::spawn(move || {
            pin_to_cpu(consumer_cpu);
            ready.store(true, Ordering::Release);

            let mut received = 0usize;
            while received < ITERATIONS {
                if queue.pop().is_some() {
                    received += 1;
                } else {
                    hint::spin_loop();
                }
            }
        })
    };

    while !ready.load(Ordering::Acquire) {
        hint::spin_loop();
    }
    pin_to_cpu(producer_cpu);

    let start = Instant::now();
    for i in 0..ITERATIONS as u64 {
        queue.push(i);
    }
    consumer_thread.join().unwrap();
    let elapsed = start.elapsed();

    let ops_per_ms = ITERATIONS as u128 * 1_000_000 / elapsed.as_nanos();
    println!("value queue (pooled envelopes): {} ops/ms", ops_per_ms);
}

fn main() {
    let (producer_cpu, consumer_cpu) = get_cpu_affinity();

    println!("talos queues (iters={}):", ITERATIONS);
    bench_mpsc_throughput(producer_cpu, consumer_cpu);
    bench_value_queue_round_trip(producer_cpu, consumer_cpu);
}
