//! Bounded multi-producer, single-consumer queue with stamped-pointer
//! ABA protection.
//!
//! Control words (`first`, `last`, `pending`) hold registry *handles*
//! rather than pointers, packed next to a 29-bit wrapping counter and
//! flag bits (see [`crate::stamp`]), so one 64-bit CAS covers the whole
//! triple. Payloads travel in [`Container`]s drawn from an internal
//! [`SharedPool`]; a new container is only allocated when the pool runs
//! dry.
//!
//! The maximum length is a *soft* bound: the live length may transiently
//! exceed it under race, but the best-effort eviction loop run by every
//! enqueuer converges it back. Length itself is a counter-difference
//! estimate — explicitly racy, good enough for the bound.
//!
//! The last remaining element is never physically unlinked: its payload
//! is claimed by CAS-setting the `CONSUMED` flag on `first`, and the spent
//! container stays resident until a successor shows up. This keeps one
//! container in the chain through normal operation; the chain only goes
//! to the `NIL` marker state through [`dequeue_all`], which detaches the
//! whole chain as a [`Fragment`].
//!
//! [`dequeue_all`]: BoundedQueue::dequeue_all

pub mod container;
pub mod fragment;

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::pool::{Reusable, SharedPool, recycle};
use crate::reclaim::Reclaimer;
use crate::registry::{Handle, HandleRegistry};
use crate::stamp::{AtomicStamped, COUNTER_MASK, Stamped};
use crate::trace;

use super::CachePadded;
pub use container::Container;
pub use fragment::Fragment;

/// The absent handle inside stamped words.
pub(crate) const NIL: u32 = 0;

/// Size of the dummy ring; power of two.
pub(crate) const DUMMY_RING: u32 = 8;
const DUMMY_MASK: u32 = DUMMY_RING - 1;

/// Internal step outcome: contention is a distinct signal from
/// emptiness and from a value, and is never surfaced to callers.
enum Step<T> {
    Empty,
    Retry,
    Value(T),
}

/// Bounded MPSC queue over stamped registry handles.
pub struct BoundedQueue<T: Send + 'static> {
    first: CachePadded<AtomicStamped>,
    last: CachePadded<AtomicStamped>,
    /// Reuse-keyed seed published by the producer that reopened an empty
    /// chain; promoted into `first` by the consumer after validation.
    pending: AtomicStamped,
    consumer: AtomicBool,
    max_len: Option<usize>,
    registry: HandleRegistry<Container<T>>,
    pool: Arc<SharedPool<Container<T>>>,
    /// Pre-registered dummy containers, handles `1..=DUMMY_RING`. Their
    /// only job is to give recycled containers' forward links a non-null
    /// resting place distinguishable from a real successor.
    dummies: Vec<Arc<Container<T>>>,
}

impl<T: Send + 'static> BoundedQueue<T> {
    /// Creates a queue with an optional soft maximum length.
    pub fn new(max_len: Option<usize>, reclaimer: Arc<Reclaimer>) -> Self {
        let registry = HandleRegistry::new(Arc::clone(&reclaimer));
        let pool = SharedPool::new_with_stub(reclaimer, Arc::new(Container::new()));
        let dummies: Vec<Arc<Container<T>>> = (0..DUMMY_RING)
            .map(|i| {
                let dummy = Arc::new(Container::new());
                let handle = registry.register(&dummy);
                assert_eq!(u32::from(handle), i + 1, "dummy ring must claim the low handles");
                dummy.core().set_handle(handle);
                dummy
            })
            .collect();
        Self {
            first: CachePadded(AtomicStamped::new(Stamped::ZERO)),
            last: CachePadded(AtomicStamped::new(Stamped::ZERO)),
            pending: AtomicStamped::new(Stamped::ZERO),
            consumer: AtomicBool::new(false),
            max_len,
            registry,
            pool,
            dummies,
        }
    }

    /// The configured soft bound, if any.
    #[must_use]
    pub fn max_len(&self) -> Option<usize> {
        self.max_len
    }

    /// Racy length estimate: the difference of the control-word counters.
    ///
    /// Off by a transient slack under contention, and by one while a
    /// spent container sits resident. Good enough for the soft bound.
    #[must_use]
    pub fn len_estimate(&self) -> usize {
        let first = self.first.load(Ordering::Acquire);
        let last = self.last.load(Ordering::Acquire);
        (last.counter().wrapping_sub(first.counter()) & COUNTER_MASK) as usize
    }

    /// Whether no payload is currently claimable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let first = self.first.load(Ordering::Acquire);
        if first.index() == NIL {
            if self.last.load(Ordering::Acquire).index() != NIL {
                return false;
            }
            let seed = self.pending.load(Ordering::Acquire);
            if seed.index() == NIL {
                return true;
            }
            let Some(head) = self.registry.resolve(Handle::from(seed.index())) else {
                return true;
            };
            // A stale seed — its chain was detached and the container
            // recycled — does not count as content.
            // SAFETY: containers stay registered while the queue lives.
            return unsafe { head.as_ref() }.reuse() & COUNTER_MASK != seed.counter();
        }
        if !first.is_consumed() {
            return false;
        }
        let Some(head) = self.registry.resolve(Handle::from(first.index())) else {
            return true;
        };
        // SAFETY: containers stay registered (and allocated) while the
        // queue lives.
        let next = unsafe { head.as_ref() }.next.load(Ordering::Acquire);
        Self::is_dummy(next.index())
    }

    /// Enqueues a payload. Never fails and never blocks; any number of
    /// threads may enqueue concurrently.
    ///
    /// When a soft bound is configured, runs the best-effort eviction
    /// loop afterwards, dropping the oldest payloads until the length
    /// estimate is back at or under the bound.
    pub fn enqueue(&self, value: T) {
        let container = self.acquire();
        // SAFETY: the container is exclusively ours until published.
        unsafe { container.fill(value) };
        let handle = u32::from(container.core().handle());
        let my_reuse = container.reuse();

        loop {
            let last = self.last.load(Ordering::Acquire);
            if last.index() == NIL {
                container.clear_prev();
                let relinked = Stamped::new(handle, last.next_counter());
                if self
                    .last
                    .compare_exchange(last, relinked, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // Reopened an empty chain: seed through the pending
                    // word; the consumer promotes it after validating the
                    // reuse key, so a seed whose chain was since detached
                    // is discarded rather than trusted.
                    self.pending
                        .store(Stamped::new(handle, my_reuse), Ordering::Release);
                    break;
                }
            } else {
                let Some(prev) = self.registry.resolve(Handle::from(last.index())) else {
                    continue;
                };
                // SAFETY: containers stay registered while the queue lives.
                let prev_ref = unsafe { prev.as_ref() };
                let prev_reuse = prev_ref.reuse();
                container.set_prev(Stamped::new(last.index(), prev_reuse));
                let relinked = Stamped::new(handle, last.next_counter());
                if self
                    .last
                    .compare_exchange(last, relinked, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // Publish the forward link, keyed to the predecessor's
                    // reuse at the moment it was the tail: a no-op if a
                    // detach-all claimed and recycled it in between.
                    let _ = prev_ref.next.compare_exchange(
                        Self::dummy_stamp(prev_reuse),
                        Stamped::new(handle, my_reuse),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    break;
                }
                container.clear_prev();
            }
        }

        if let Some(max) = self.max_len {
            self.trim(max);
        }
    }

    /// Dequeues the oldest payload.
    ///
    /// Single consumer; spins briefly if another thread holds the
    /// consumer right. `None` may be transient while a preempted producer
    /// finishes publishing.
    #[must_use]
    pub fn dequeue(&self) -> Option<T> {
        self.lock_consumer();
        let result = loop {
            match self.dequeue_step() {
                Step::Value(value) => break Some(value),
                Step::Empty => break None,
                Step::Retry => continue,
            }
        };
        self.consumer.store(false, Ordering::Release);
        result
    }

    /// Detaches the entire chain as a [`Fragment`].
    ///
    /// The fragment holds the consumer right until it is dropped;
    /// [`dequeue`](Self::dequeue) calls in the meantime spin.
    #[must_use]
    pub fn dequeue_all(&self) -> Fragment<'_, T> {
        self.lock_consumer();
        // Capture the tail first so the chain stops growing at it; later
        // enqueuers find the marker and go through the pending word.
        let tail = loop {
            let last = self.last.load(Ordering::Acquire);
            let marker = Stamped::new(NIL, last.next_counter());
            if self
                .last
                .compare_exchange(last, marker, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break last;
            }
        };
        // Then claim the promoted chain head, racing only evictors.
        let head = loop {
            let first = self.first.load(Ordering::Acquire);
            if first.index() == NIL {
                break first;
            }
            let marker = Stamped::new(NIL, first.next_counter());
            if self
                .first
                .compare_exchange(first, marker, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break first;
            }
        };
        trace::trace!(
            head = head.index(),
            tail = tail.index(),
            "detached bounded queue chain"
        );
        Fragment::new(self, head, tail)
    }

    fn dequeue_step(&self) -> Step<T> {
        let first = self.first.load(Ordering::Acquire);
        if first.index() == NIL {
            return self.promote_pending();
        }
        let Some(head) = self.registry.resolve(Handle::from(first.index())) else {
            return Step::Empty;
        };
        // SAFETY: containers stay registered while the queue lives.
        let head_ref = unsafe { head.as_ref() };
        let next = head_ref.next.load(Ordering::Acquire);
        let next_is_dummy = Self::is_dummy(next.index());

        if first.is_consumed() {
            if next_is_dummy {
                // Only the spent resident container remains.
                return Step::Empty;
            }
            // A successor arrived: advance past the spent container and
            // recycle it, then look again.
            let advanced = Stamped::new(next.index(), first.next_counter());
            if self
                .first
                .compare_exchange(first, advanced, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.release(head);
            }
            return Step::Retry;
        }

        if next_is_dummy {
            // Final container in the chain: claim the payload but leave
            // the container resident, flagged as spent.
            match self.first.compare_exchange(
                first,
                first.consumed(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // SAFETY: winning the flag CAS claims the payload.
                    match unsafe { head_ref.take() } {
                        Some(value) => Step::Value(value),
                        None => Step::Empty,
                    }
                }
                Err(_) => Step::Retry,
            }
        } else {
            let advanced = Stamped::new(next.index(), first.next_counter());
            match self
                .first
                .compare_exchange(first, advanced, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // SAFETY: winning the advance claims the container.
                    let value = unsafe { head_ref.take() };
                    self.release(head);
                    match value {
                        Some(value) => Step::Value(value),
                        None => Step::Retry,
                    }
                }
                Err(_) => Step::Retry,
            }
        }
    }

    /// Promotes a validated pending seed into `first`.
    ///
    /// Consumer-exclusive. The claim is a CAS so a fresh seed stored by a
    /// racing producer survives an attempt to clear a stale one.
    fn promote_pending(&self) -> Step<T> {
        let seed = self.pending.load(Ordering::Acquire);
        if seed.index() == NIL {
            return Step::Empty;
        }
        if self
            .pending
            .compare_exchange(seed, Stamped::ZERO, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Step::Retry;
        }
        let Some(head) = self.registry.resolve(Handle::from(seed.index())) else {
            return Step::Empty;
        };
        // SAFETY: containers stay registered while the queue lives.
        if unsafe { head.as_ref() }.reuse() & COUNTER_MASK != seed.counter() {
            // The chain this seed opened was already detached and its
            // container recycled; the seed is stale.
            return Step::Empty;
        }
        let first = self.first.load(Ordering::Acquire);
        debug_assert_eq!(first.index(), NIL);
        let promoted = Stamped::new(seed.index(), first.next_counter());
        let _ = self
            .first
            .compare_exchange(first, promoted, Ordering::AcqRel, Ordering::Acquire);
        Step::Retry
    }

    /// Best-effort eviction toward the soft bound. May under-evict under
    /// contention; some later enqueuer keeps shortening the queue.
    fn trim(&self, max: usize) {
        loop {
            let first = self.first.load(Ordering::Acquire);
            if first.index() == NIL {
                return;
            }
            let last = self.last.load(Ordering::Acquire);
            let len = (last.counter().wrapping_sub(first.counter()) & COUNTER_MASK) as usize;
            if len <= max {
                return;
            }
            let Some(head) = self.registry.resolve(Handle::from(first.index())) else {
                return;
            };
            // SAFETY: containers stay registered while the queue lives.
            let head_ref = unsafe { head.as_ref() };
            let next = head_ref.next.load(Ordering::Acquire);
            if Self::is_dummy(next.index()) {
                // The resident tail cannot be evicted.
                return;
            }
            let advanced = Stamped::new(next.index(), first.next_counter());
            if self
                .first
                .compare_exchange(first, advanced, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: winning the advance claims the container; the
                // evicted payload is dropped on the floor.
                drop(unsafe { head_ref.take() });
                self.release(head);
                trace::trace!(len, max, "evicted oldest payload over soft bound");
            }
        }
    }

    /// Draws a container from the pool, allocating only when it runs dry.
    fn acquire(&self) -> Arc<Container<T>> {
        if let Some(container) = self.pool.get_unused() {
            container.park_next(Self::dummy_stamp(container.reuse()));
            return container;
        }
        let container = Arc::new(Container::new());
        let handle = self.registry.register(&container);
        container.core().set_handle(handle);
        self.pool
            .attach(&container, false)
            .expect("container pool lives as long as its queue");
        container.park_next(Self::dummy_stamp(container.reuse()));
        container
    }

    /// Recycles a claimed container: advance its lifetime, park its
    /// links, and hand it back to the pool.
    pub(crate) fn release(&self, container: NonNull<Container<T>>) {
        // SAFETY: the registry keeps containers allocated while the queue
        // lives; the caller won the claim CAS.
        let container_ref = unsafe { container.as_ref() };
        let new_reuse = container_ref.bump_reuse();
        container_ref.park_next(Self::dummy_stamp(new_reuse));
        container_ref.clear_prev();
        // SAFETY: the registry holds a live strong count for this
        // container, so minting another from the raw pointer is sound.
        let arc = unsafe {
            Arc::increment_strong_count(container.as_ptr().cast_const());
            Arc::from_raw(container.as_ptr().cast_const())
        };
        recycle(arc);
    }

    pub(crate) fn resolve(&self, handle: u32) -> Option<NonNull<Container<T>>> {
        self.registry.resolve(Handle::from(handle))
    }

    /// Whether a handle names one of the dummy ring containers.
    #[inline]
    pub(crate) fn is_dummy(handle: u32) -> bool {
        (1..=DUMMY_RING).contains(&handle)
    }

    /// The resting stamp for a container at the given reuse: the dummy
    /// ring entry selected by the low bits, keyed by the full counter.
    #[inline]
    pub(crate) fn dummy_stamp(reuse: u32) -> Stamped {
        Stamped::new(1 + (reuse & DUMMY_MASK), reuse)
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

impl<T: Send + 'static> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        // Drain so remaining payload destructors run.
        while self.dequeue().is_some() {}
        self.pool.controlled_delete();
    }
}
