//! Typed value front-ends over the raw engines.
//!
//! The raw queues move intrusive elements; these wrappers move owned
//! values by carrying them in pooled envelopes. Pushing claims a
//! previously recycled envelope (allocating one only when the pool runs
//! dry), popping takes the value back out and recycles the envelope — the
//! zero-allocation steady state the pools exist for.

use std::cell::UnsafeCell;
use std::sync::Arc;

use crate::pool::{Pool, Reusable, ReusableCore, SharedPool, recycle};
use crate::reclaim::Reclaimer;

use super::mpsc::MpscQueue;
use super::node::{Links, Node};
use super::resident::ResidentQueue;

/// Pooled carrier for one value.
struct Envelope<T: Send + 'static> {
    core: ReusableCore<Envelope<T>>,
    /// Written by the pusher that owns the envelope, taken by the popper
    /// that dequeued it.
    value: UnsafeCell<Option<T>>,
}

// SAFETY: the value cell is only touched by whoever exclusively owns the
// envelope (pre-enqueue pusher or post-dequeue popper).
unsafe impl<T: Send + 'static> Send for Envelope<T> {}
unsafe impl<T: Send + 'static> Sync for Envelope<T> {}

impl<T: Send + 'static> Envelope<T> {
    fn new() -> Self {
        Self {
            core: ReusableCore::new(),
            value: UnsafeCell::new(None),
        }
    }
}

impl<T: Send + 'static> Default for Envelope<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the links live in the embedded core for the envelope's whole
// lifetime; an envelope is in the value queue, the pool queue, or with a
// client — never two at once.
unsafe impl<T: Send + 'static> Node for Envelope<T> {
    fn links(&self) -> &Links<Self> {
        self.core.links()
    }
}

impl<T: Send + 'static> Reusable for Envelope<T> {
    fn core(&self) -> &ReusableCore<Self> {
        &self.core
    }
}

/// MPSC value queue: many pushers, one popper at a time.
pub struct ValueQueue<T: Send + 'static> {
    queue: MpscQueue<Envelope<T>>,
    pool: Arc<Pool<Envelope<T>>>,
}

impl<T: Send + 'static> ValueQueue<T> {
    /// Creates an empty value queue.
    #[must_use]
    pub fn new(reclaimer: Arc<Reclaimer>) -> Self {
        Self {
            queue: MpscQueue::new(),
            pool: Pool::new(reclaimer),
        }
    }

    /// Pushes a value, reusing a recycled envelope when one is available.
    pub fn push(&self, value: T) {
        let envelope = self.pool.get_unused().unwrap_or_else(|| {
            let envelope = Arc::new(Envelope::new());
            self.pool
                .attach(&envelope, false)
                .expect("envelope pool lives as long as its queue");
            envelope
        });
        // SAFETY: the envelope is exclusively ours until enqueued.
        unsafe { *envelope.value.get() = Some(value) };
        self.queue.enqueue(envelope);
    }

    /// Pops the oldest value; `None` may be transient while a preempted
    /// pusher finishes publishing.
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        let envelope = self.queue.dequeue()?;
        // SAFETY: dequeueing made the envelope exclusively ours.
        let value = unsafe { (*envelope.value.get()).take() };
        recycle(envelope);
        value
    }

    /// Whether nothing new has been published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Value queue with concurrent poppers.
pub struct SharedValueQueue<T: Send + 'static> {
    queue: ResidentQueue<Envelope<T>>,
    pool: Arc<SharedPool<Envelope<T>>>,
}

impl<T: Send + 'static> SharedValueQueue<T> {
    /// Creates an empty value queue.
    #[must_use]
    pub fn new(reclaimer: Arc<Reclaimer>) -> Self {
        Self {
            queue: ResidentQueue::new_with_stub(Arc::new(Envelope::new())),
            pool: SharedPool::new_with_stub(reclaimer, Arc::new(Envelope::new())),
        }
    }

    /// Pushes a value, reusing a recycled envelope when one is available.
    pub fn push(&self, value: T) {
        let envelope = self.pool.get_unused().unwrap_or_else(|| {
            let envelope = Arc::new(Envelope::new());
            self.pool
                .attach(&envelope, false)
                .expect("envelope pool lives as long as its queue");
            envelope
        });
        // SAFETY: the envelope is exclusively ours until enqueued.
        unsafe { *envelope.value.get() = Some(value) };
        self.queue.enqueue(envelope);
    }

    /// Pops the oldest available value; callable from any thread.
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: every envelope is attached to the pool, whose
        // all-elements chain keeps it allocated until teardown defers it.
        let envelope = unsafe { self.queue.dequeue_concurrent() }?;
        // SAFETY: winning the dequeue made the envelope exclusively ours.
        let value = unsafe { (*envelope.value.get()).take() };
        recycle(envelope);
        value
    }
}
