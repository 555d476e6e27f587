//! Unbounded multi-producer, single-consumer intrusive queue that can
//! drain fully.
//!
//! Enqueueing is wait-free: one atomic swap on the producer word plus one
//! link store. The consumer works in *segments*: when its private cursor
//! runs out, it claims the chain head a producer published, and closes the
//! open segment by swapping the producer word back to the queue's
//! sentinel. Elements enqueued afterwards start a fresh segment.
//!
//! A producer that is preempted between the swap and the link store leaves
//! the chain momentarily torn; the consumer then reports empty rather than
//! waiting ("spuriously empty"). Callers that need to observe the element
//! eventually must poll.
//!
//! Exactly one thread may consume at a time. [`MpscQueue::dequeue`] and
//! [`MpscQueue::dequeue_all`] guard this with a short spin-acquired
//! consumer flag, which also serves callers that want multi-reader
//! dequeue at the cost of that spin.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use super::CachePadded;
use super::node::{Links, Node, from_queue_ptr, into_queue_ptr};

/// Unbounded MPSC queue, drainable to empty.
pub struct MpscQueue<T: Node> {
    /// Producer word: the most recently enqueued element, or the sentinel
    /// when no segment is open.
    head: CachePadded<AtomicPtr<T>>,

    /// Head of a newly published chain, awaiting consumer pickup.
    published: AtomicPtr<T>,

    /// Consumer cursor: next element to hand out in the claimed segment.
    cursor: UnsafeCell<*mut T>,

    /// Last element of the claimed segment.
    cursor_end: UnsafeCell<*mut T>,

    /// Consumer exclusion flag.
    consumer: AtomicBool,

    /// Heap-stable marker address. Compared, never dereferenced as `T`.
    sentinel: *mut T,
}

// SAFETY: the raw pointers are either the queue-private sentinel or
// elements whose ownership the queue holds; all cross-thread handoff goes
// through the atomic words above.
unsafe impl<T: Node> Send for MpscQueue<T> {}
unsafe impl<T: Node> Sync for MpscQueue<T> {}

impl<T: Node> MpscQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let sentinel = Box::into_raw(Box::new(Links::<T>::new())).cast::<T>();
        Self {
            head: CachePadded(AtomicPtr::new(sentinel)),
            published: AtomicPtr::new(ptr::null_mut()),
            cursor: UnsafeCell::new(ptr::null_mut()),
            cursor_end: UnsafeCell::new(ptr::null_mut()),
            consumer: AtomicBool::new(false),
            sentinel,
        }
    }

    /// Enqueues an element (wait-free: one swap, one store).
    ///
    /// Any number of threads may enqueue concurrently.
    pub fn enqueue(&self, element: Arc<T>) {
        let ptr = into_queue_ptr(element);
        // SAFETY: we own the element until it is published below.
        unsafe { (*ptr).links().next().store(ptr::null_mut(), Ordering::Relaxed) };

        let prev = self.head.swap(ptr, Ordering::AcqRel);
        if prev == self.sentinel {
            // First element of a fresh segment. Publishing through a
            // dedicated word avoids racing a dequeue that is concurrently
            // tearing down the previous segment.
            self.published.store(ptr, Ordering::Release);
        } else {
            // SAFETY: only the producer that swapped `prev` out of the
            // producer word writes its link; the consumer reads it with
            // acquire ordering.
            unsafe { (*prev).links().next().store(ptr, Ordering::Release) };
        }
    }

    /// Dequeues the oldest available element.
    ///
    /// Spins briefly if another thread is currently consuming. Returns
    /// `None` when nothing is claimable right now — which may be a
    /// transient state while a preempted producer finishes linking.
    #[must_use]
    pub fn dequeue(&self) -> Option<Arc<T>> {
        self.lock_consumer();
        // SAFETY: the consumer flag is held.
        let res = unsafe { self.dequeue_unchecked() };
        self.consumer.store(false, Ordering::Release);
        res
    }

    /// Dequeues up to `max` elements into `buffer`, returning the count.
    ///
    /// Claims the consumer flag once for the whole batch.
    pub fn dequeue_all(&self, buffer: &mut Vec<Arc<T>>, max: usize) -> usize {
        self.lock_consumer();
        let mut count = 0;
        while count < max {
            // SAFETY: the consumer flag is held.
            match unsafe { self.dequeue_unchecked() } {
                Some(element) => {
                    buffer.push(element);
                    count += 1;
                }
                None => break,
            }
        }
        self.consumer.store(false, Ordering::Release);
        count
    }

    /// Dequeues without taking the consumer flag.
    ///
    /// # Safety
    ///
    /// The caller must guarantee no other thread is consuming
    /// concurrently.
    pub unsafe fn dequeue_unchecked(&self) -> Option<Arc<T>> {
        // SAFETY: exclusivity forwarded to the caller; the pointer was
        // transferred into the queue by `enqueue`.
        unsafe { self.pop_ptr().map(|ptr| from_queue_ptr(ptr)) }
    }

    /// Whether the shared portion of the queue is empty.
    ///
    /// The consumer may still hold an unfinished claimed segment; this
    /// only reports that nothing new has been published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.sentinel
            && self.published.load(Ordering::Acquire).is_null()
    }

    unsafe fn pop_ptr(&self) -> Option<*mut T> {
        // SAFETY: caller guarantees consumer exclusivity, so the cursor
        // cells are ours alone.
        unsafe {
            let cursor = self.cursor.get();
            let mut cur = *cursor;
            if cur.is_null() {
                let claimed = self.published.swap(ptr::null_mut(), Ordering::Acquire);
                if claimed.is_null() {
                    return None;
                }
                // Close the segment: producers finding the sentinel will
                // publish a fresh chain head instead of linking onto the
                // chain we are about to walk.
                *self.cursor_end.get() = self.head.swap(self.sentinel, Ordering::AcqRel);
                cur = claimed;
            }
            if cur == *self.cursor_end.get() {
                *cursor = ptr::null_mut();
                return Some(cur);
            }
            let succ = (*cur).links().next().load(Ordering::Acquire);
            if succ.is_null() {
                // The producer of cur's successor swapped the producer word
                // but has not stored the link yet. Keep the cursor and
                // report empty; the element surfaces once the store lands.
                *cursor = cur;
                return None;
            }
            *cursor = succ;
            Some(cur)
        }
    }

    fn lock_consumer(&self) {
        while self
            .consumer
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            while self.consumer.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }
}

impl<T: Node> Default for MpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Node> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: no producer is mid-link, so a None is final.
        // SAFETY: &mut self guarantees a single consumer.
        while let Some(ptr) = unsafe { self.pop_ptr() } {
            // SAFETY: the strong count held by the queue leaves with us.
            drop(unsafe { from_queue_ptr(ptr) });
        }
        // SAFETY: the sentinel was allocated as a `Links<T>` box in `new`
        // and never freed elsewhere.
        drop(unsafe { Box::from_raw(self.sentinel.cast::<Links<T>>()) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Item {
        links: Links<Item>,
        value: usize,
        drops: Arc<AtomicUsize>,
    }

    unsafe impl Node for Item {
        fn links(&self) -> &Links<Self> {
            &self.links
        }
    }

    impl Drop for Item {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn item(value: usize, drops: &Arc<AtomicUsize>) -> Arc<Item> {
        Arc::new(Item {
            links: Links::new(),
            value,
            drops: Arc::clone(drops),
        })
    }

    #[test]
    fn test_fifo_single_thread() {
        let drops = Arc::new(AtomicUsize::new(0));
        let queue = MpscQueue::new();
        assert!(queue.is_empty());

        for i in 0..10 {
            queue.enqueue(item(i, &drops));
        }
        assert!(!queue.is_empty());

        for i in 0..10 {
            assert_eq!(queue.dequeue().unwrap().value, i);
        }
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_empty_queue_yields_none() {
        let queue: MpscQueue<Item> = MpscQueue::new();
        assert!(queue.dequeue().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_interleaved_segments() {
        let drops = Arc::new(AtomicUsize::new(0));
        let queue = MpscQueue::new();

        queue.enqueue(item(1, &drops));
        queue.enqueue(item(2, &drops));
        assert_eq!(queue.dequeue().unwrap().value, 1);

        // New segment opens while the old one is still being walked.
        queue.enqueue(item(3, &drops));
        assert_eq!(queue.dequeue().unwrap().value, 2);
        assert_eq!(queue.dequeue().unwrap().value, 3);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_dequeue_all_batch() {
        let drops = Arc::new(AtomicUsize::new(0));
        let queue = MpscQueue::new();
        for i in 0..8 {
            queue.enqueue(item(i, &drops));
        }

        let mut buffer = Vec::new();
        assert_eq!(queue.dequeue_all(&mut buffer, 5), 5);
        assert_eq!(queue.dequeue_all(&mut buffer, 16), 3);
        let values: Vec<_> = buffer.iter().map(|e| e.value).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_concurrent_producers_no_loss() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1_000;

        let drops = Arc::new(AtomicUsize::new(0));
        let queue = Arc::new(MpscQueue::new());

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                let drops = Arc::clone(&drops);
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.enqueue(item(p * PER_PRODUCER + i, &drops));
                    }
                })
            })
            .collect();

        let mut seen = vec![false; PRODUCERS * PER_PRODUCER];
        let mut count = 0;
        while count < PRODUCERS * PER_PRODUCER {
            if let Some(element) = queue.dequeue() {
                assert!(!seen[element.value], "duplicate delivery");
                seen[element.value] = true;
                count += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(queue.dequeue().is_none());
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_drop_frees_enqueued_elements() {
        let drops = Arc::new(AtomicUsize::new(0));
        let queue = MpscQueue::new();
        for i in 0..4 {
            queue.enqueue(item(i, &drops));
        }
        // Claim a segment but leave elements in it.
        assert_eq!(queue.dequeue().unwrap().value, 0);
        drop(queue);
        assert_eq!(drops.load(Ordering::Relaxed), 4);
    }
}
