//! Unbounded multi-producer queue that always keeps one node resident.
//!
//! Trades the ability to drain fully for a shorter dequeue hot path: a
//! stub node provided at construction is always somewhere in the chain,
//! so the consumer never has to special-case a truly empty list beyond a
//! null successor check.
//!
//! Two dequeue flavors exist:
//!
//! - a single-consumer path ([`ResidentQueue::dequeue`], guarded by a
//!   consumer flag) that can skip past the stub and re-enqueue it when the
//!   producer and consumer ends meet;
//! - a concurrent-consumer path ([`ResidentQueue::dequeue_concurrent`])
//!   that advances the consumer word with a CAS retry loop and, when it
//!   wins the queue's own stub, puts the stub back and retries the whole
//!   operation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use thiserror::Error;

use super::CachePadded;
use super::node::{Node, from_queue_ptr, into_queue_ptr};

/// Errors returned by [`ResidentQueue::try_dequeue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryDequeueError {
    /// Nothing is available.
    #[error("queue is empty")]
    Empty,
    /// A producer was preempted between its swap and its link store; the
    /// state is momentarily unreadable and a retry will succeed soon.
    #[error("queue is momentarily inconsistent")]
    Inconsistent,
    /// Another thread currently holds the consumer flag.
    #[error("another consumer holds the queue")]
    Busy,
}

/// Unbounded MPSC queue with an always-resident node.
pub struct ResidentQueue<T: Node> {
    /// Producer word: most recently enqueued node.
    head: CachePadded<AtomicPtr<T>>,

    /// Consumer word: oldest candidate node.
    tail: CachePadded<AtomicPtr<T>>,

    /// Consumer exclusion flag for the single-consumer flavor.
    consumer: AtomicBool,

    /// The stub node. Owned by the queue; one strong count held raw.
    stub: *mut T,
}

// SAFETY: raw pointers are elements whose strong counts the queue owns;
// handoff goes through the atomic words.
unsafe impl<T: Node> Send for ResidentQueue<T> {}
unsafe impl<T: Node> Sync for ResidentQueue<T> {}

impl<T: Node + Default> ResidentQueue<T> {
    /// Creates an empty queue using `T::default()` as the stub.
    #[must_use]
    pub fn new() -> Self {
        Self::new_with_stub(Arc::new(T::default()))
    }
}

impl<T: Node + Default> Default for ResidentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Node> ResidentQueue<T> {
    /// Creates an empty queue with the provided stub node.
    ///
    /// The stub must never be enqueued by the caller; the queue owns it
    /// for its whole life.
    #[must_use]
    pub fn new_with_stub(stub: Arc<T>) -> Self {
        let stub = into_queue_ptr(stub);
        Self {
            head: CachePadded(AtomicPtr::new(stub)),
            tail: CachePadded(AtomicPtr::new(stub)),
            consumer: AtomicBool::new(false),
            stub,
        }
    }

    /// Enqueues an element (wait-free: one swap, one store).
    pub fn enqueue(&self, element: Arc<T>) {
        self.enqueue_inner(into_queue_ptr(element));
    }

    fn enqueue_inner(&self, ptr: *mut T) {
        // SAFETY: we own the node until it is linked below.
        unsafe { (*ptr).links().next().store(std::ptr::null_mut(), Ordering::Relaxed) };
        let prev = self.head.swap(ptr, Ordering::AcqRel);
        // SAFETY: the stub guarantees `prev` is never null, and only the
        // producer that swapped it out writes its link.
        unsafe { (*prev).links().next().store(ptr, Ordering::Release) };
    }

    /// Attempts a single-consumer dequeue without waiting.
    ///
    /// # Errors
    ///
    /// [`TryDequeueError::Busy`] if another thread holds the consumer
    /// flag, [`TryDequeueError::Inconsistent`] while a preempted producer
    /// finishes linking, [`TryDequeueError::Empty`] otherwise.
    pub fn try_dequeue(&self) -> Result<Arc<T>, TryDequeueError> {
        if self
            .consumer
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TryDequeueError::Busy);
        }
        // SAFETY: the consumer flag is held.
        let res = unsafe { self.pop_single() };
        self.consumer.store(false, Ordering::Release);
        res.map(|ptr| {
            // SAFETY: the pointer was transferred in by `enqueue`.
            unsafe { from_queue_ptr(ptr) }
        })
    }

    /// Single-consumer dequeue; spins only while another thread holds the
    /// consumer flag. Transient inconsistency reads as `None`; poll.
    #[must_use]
    pub fn dequeue(&self) -> Option<Arc<T>> {
        loop {
            match self.try_dequeue() {
                Ok(element) => return Some(element),
                Err(TryDequeueError::Empty | TryDequeueError::Inconsistent) => return None,
                Err(TryDequeueError::Busy) => std::hint::spin_loop(),
            }
        }
    }

    /// Concurrent-consumer dequeue: CAS-advance the consumer word,
    /// retrying on contention.
    ///
    /// # Safety
    ///
    /// Every element that has ever been enqueued must remain allocated
    /// while any thread may still be inside this method — the caller must
    /// keep a strong reference elsewhere (pool-attached elements satisfy
    /// this via the pool's all-elements chain) or defer frees past the
    /// last racing reader.
    pub unsafe fn dequeue_concurrent(&self) -> Option<Arc<T>> {
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: liveness of `tail` is the caller's contract above.
            let next = unsafe { (*tail).links().next().load(Ordering::Acquire) };
            if next.is_null() || next == tail {
                // No successor: only the resident node remains.
                return None;
            }
            if self
                .tail
                .compare_exchange_weak(tail, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if tail == self.stub {
                    // Drained down to our own stub: give it back at the
                    // producer end and retry the whole operation.
                    self.enqueue_inner(self.stub);
                    continue;
                }
                // SAFETY: winning the CAS took ownership of the node.
                return Some(unsafe { from_queue_ptr(tail) });
            }
        }
    }

    /// Whether nothing but the resident stub is in the queue.
    ///
    /// Conservative: reports non-empty whenever any non-stub node is
    /// resident, even one that a racing consumer is about to win.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let tail = self.tail.load(Ordering::Acquire);
        if tail != self.stub {
            return false;
        }
        // SAFETY: the stub is owned by the queue and alive until Drop.
        unsafe { (*tail).links().next().load(Ordering::Acquire).is_null() }
    }

    /// The mycelium-style single-consumer pop: skip the stub, re-enqueue
    /// it when the ends meet.
    unsafe fn pop_single(&self) -> Result<*mut T, TryDequeueError> {
        // SAFETY: consumer exclusivity is the caller's contract; plain
        // load/store on the consumer word is then race-free.
        unsafe {
            let mut tail_node = self.tail.load(Ordering::Relaxed);
            let mut next = (*tail_node).links().next().load(Ordering::Acquire);

            if tail_node == self.stub {
                if next.is_null() {
                    return Err(TryDequeueError::Empty);
                }
                self.tail.store(next, Ordering::Relaxed);
                tail_node = next;
                next = (*tail_node).links().next().load(Ordering::Acquire);
            }

            if !next.is_null() {
                self.tail.store(next, Ordering::Relaxed);
                return Ok(tail_node);
            }

            let head = self.head.load(Ordering::Acquire);
            if tail_node != head {
                // A producer is between its swap and its link store.
                return Err(TryDequeueError::Inconsistent);
            }

            // Producer and consumer ends met on a real node: park the stub
            // behind it so the node gains a successor, then take it.
            self.enqueue_inner(self.stub);
            next = (*tail_node).links().next().load(Ordering::Acquire);
            if next.is_null() {
                return Err(TryDequeueError::Empty);
            }
            self.tail.store(next, Ordering::Relaxed);
            Ok(tail_node)
        }
    }
}

impl<T: Node> Drop for ResidentQueue<T> {
    fn drop(&mut self) {
        let mut current = self.tail.load(Ordering::Relaxed);
        while !current.is_null() {
            // SAFETY: &mut self — no racing producers or consumers.
            let next = unsafe { (*current).links().next().load(Ordering::Relaxed) };
            if current != self.stub {
                // The resident trailing node is freed here too.
                // SAFETY: the queue owns one strong count per linked node.
                drop(unsafe { from_queue_ptr(current) });
            }
            current = next;
        }
        // SAFETY: the stub's strong count was transferred in at
        // construction and is released exactly once, here.
        drop(unsafe { from_queue_ptr(self.stub) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::node::Links;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Item {
        links: Links<Item>,
        value: usize,
    }

    unsafe impl Node for Item {
        fn links(&self) -> &Links<Self> {
            &self.links
        }
    }

    fn item(value: usize) -> Arc<Item> {
        Arc::new(Item {
            links: Links::new(),
            value,
        })
    }

    #[test]
    fn test_fifo_single_consumer() {
        let queue: ResidentQueue<Item> = ResidentQueue::new();
        assert!(queue.is_empty());

        for i in 0..10 {
            queue.enqueue(item(i));
        }
        for i in 0..10 {
            assert_eq!(queue.dequeue().unwrap().value, i);
        }
        assert!(queue.dequeue().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_and_refill() {
        let queue: ResidentQueue<Item> = ResidentQueue::new();

        // Drain forces the stub to cycle through the chain; the queue must
        // stay usable afterwards.
        for round in 0..5 {
            queue.enqueue(item(round));
            assert_eq!(queue.dequeue().unwrap().value, round);
            assert!(queue.dequeue().is_none());
        }
    }

    #[test]
    fn test_concurrent_producers_single_consumer() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1_000;

        let queue: Arc<ResidentQueue<Item>> = Arc::new(ResidentQueue::new());
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.enqueue(item(p * PER_PRODUCER + i));
                    }
                })
            })
            .collect();

        let mut seen = vec![false; PRODUCERS * PER_PRODUCER];
        let mut count = 0;
        while count < PRODUCERS * PER_PRODUCER {
            if let Some(element) = queue.dequeue() {
                assert!(!seen[element.value]);
                seen[element.value] = true;
                count += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_concurrent_consumers_share_the_drain() {
        const TOTAL: usize = 4_000;
        const CONSUMERS: usize = 3;

        let queue: Arc<ResidentQueue<Item>> = Arc::new(ResidentQueue::new());

        // Keep every element alive for the duration of the concurrent
        // dequeues, as the safety contract requires.
        let elements: Vec<Arc<Item>> = (0..TOTAL).map(item).collect();
        for element in &elements {
            queue.enqueue(Arc::clone(element));
        }

        let counted = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let counted = Arc::clone(&counted);
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    // SAFETY: `elements` outlives every consumer thread
                    // (joined below, before the vec drops).
                    while let Some(element) = unsafe { queue.dequeue_concurrent() } {
                        mine.push(element.value);
                    }
                    counted.fetch_add(mine.len(), Ordering::Relaxed);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // One element stays resident by design; everything else drained.
        let drained = counted.load(Ordering::Relaxed);
        assert!(drained >= TOTAL - 1, "drained {drained} of {TOTAL}");
        drop(queue);
        drop(elements);
    }

    #[test]
    fn test_resident_element_freed_on_drop() {
        let queue: ResidentQueue<Item> = ResidentQueue::new();
        queue.enqueue(item(1));
        queue.enqueue(item(2));
        assert_eq!(queue.dequeue().unwrap().value, 1);
        // One element still resident; Drop must free it and the stub.
        drop(queue);
    }
}
