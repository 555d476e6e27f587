//! Concurrent-reader pool over the always-resident queue.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::queue::ResidentQueue;
use crate::reclaim::Reclaimer;
use crate::trace;

use super::PoolError;
use super::reusable::{LifeStage, Reusable, ReusablePool, chain_prepend, chain_take};

/// Pool whose `get_unused` may be called from any number of threads.
///
/// Claiming goes through the resident queue's CAS-advance consumer path,
/// so producers and consumers are all lock-free. The liveness that path
/// requires — no element memory is freed while a claim is in flight — is
/// provided by the all-elements chain, which keeps one strong reference
/// to every attached element until teardown, and by the reclaimer, which
/// defers those references past the grace window at teardown.
pub struct SharedPool<T: Reusable> {
    queue: ResidentQueue<T>,
    /// All-elements chain head; see [`Pool`](super::Pool) for its role.
    all: AtomicPtr<T>,
    deleted: AtomicBool,
    reclaimer: Arc<Reclaimer>,
}

impl<T: Reusable + Default> SharedPool<T> {
    /// Creates an empty pool using `T::default()` as the queue stub.
    #[must_use]
    pub fn new(reclaimer: Arc<Reclaimer>) -> Arc<Self> {
        Self::new_with_stub(reclaimer, Arc::new(T::default()))
    }
}

impl<T: Reusable> SharedPool<T> {
    /// Creates an empty pool with an explicit queue stub.
    ///
    /// The stub belongs to the queue; it is never handed out and must not
    /// be attached or recycled.
    #[must_use]
    pub fn new_with_stub(reclaimer: Arc<Reclaimer>, stub: Arc<T>) -> Arc<Self> {
        Arc::new(Self {
            queue: ResidentQueue::new_with_stub(stub),
            all: AtomicPtr::new(ptr::null_mut()),
            deleted: AtomicBool::new(false),
            reclaimer,
        })
    }

    /// Attaches a newly constructed element to this pool.
    ///
    /// # Errors
    ///
    /// [`PoolError::Deleted`] after [`controlled_delete`].
    ///
    /// [`controlled_delete`]: Self::controlled_delete
    pub fn attach(self: &Arc<Self>, element: &Arc<T>, available: bool) -> Result<(), PoolError> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(PoolError::Deleted);
        }
        let core = element.core();
        let strong: Arc<dyn ReusablePool<T>> = self.clone();
        let owner: std::sync::Weak<dyn ReusablePool<T>> = Arc::downgrade(&strong);
        core.set_owner(owner);
        chain_prepend(&self.all, element);
        if available {
            core.state()
                .transition(&[LifeStage::Unknown], LifeStage::Enqueued);
            self.queue.enqueue(Arc::clone(element));
        } else {
            core.state()
                .transition(&[LifeStage::Unknown], LifeStage::Used);
        }
        Ok(())
    }

    /// Claims a previously recycled element, if one is available.
    ///
    /// Safe to call from any number of threads concurrently.
    #[must_use]
    pub fn get_unused(&self) -> Option<Arc<T>> {
        // SAFETY: every element the queue can hold is kept allocated by
        // the all-elements chain; at teardown those references are
        // released through the reclaimer, covering racing claims.
        let element = unsafe { self.queue.dequeue_concurrent() }?;
        let core = element.core();
        core.state()
            .transition(&[LifeStage::Enqueued], LifeStage::PostQueued);
        core.state()
            .transition(&[LifeStage::PostQueued], LifeStage::Used);
        Some(element)
    }

    /// Tears the pool down while other threads may still be recycling or
    /// claiming against it. See [`Pool::controlled_delete`] for the
    /// protocol.
    ///
    /// [`Pool::controlled_delete`]: super::Pool::controlled_delete
    pub fn controlled_delete(&self) {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return;
        }
        let chain = chain_take(&self.all);
        trace::debug!(elements = chain.len(), "shared pool controlled delete");
        for element in &chain {
            element.core().clear_owner(&self.reclaimer);
        }
        let mut queued = Vec::new();
        // SAFETY: the chain references collected above are still alive
        // and are not deferred until after this drain.
        while let Some(element) = unsafe { self.queue.dequeue_concurrent() } {
            queued.push(element);
        }
        self.reclaimer.defer(chain);
        self.reclaimer.defer(queued);
    }

    /// Whether [`controlled_delete`](Self::controlled_delete) has run.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }
}

impl<T: Reusable> Drop for SharedPool<T> {
    fn drop(&mut self) {
        // A pool dropped without controlled_delete still owes the chain
        // its strong counts; exclusive access makes immediate drop sound.
        drop(chain_take(&self.all));
    }
}

impl<T: Reusable> ReusablePool<T> for SharedPool<T> {
    fn readmit(&self, element: Arc<T>) {
        self.queue.enqueue(element);
    }
}
