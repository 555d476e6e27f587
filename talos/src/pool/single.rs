//! Single-reader pool over the drainable MPSC queue.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::queue::MpscQueue;
use crate::reclaim::Reclaimer;
use crate::trace;

use super::PoolError;
use super::reusable::{LifeStage, Reusable, ReusablePool, chain_prepend, chain_take};

/// Pool whose `get_unused` is called by one reader at a time.
///
/// Any number of threads may recycle elements back concurrently (the
/// availability queue's producer side is wait-free); claiming them is a
/// single-reader affair, tolerated across threads through the queue's
/// consumer flag.
pub struct Pool<T: Reusable> {
    queue: MpscQueue<T>,
    /// All-elements chain head (most recently attached), independent of
    /// queue membership; exists solely for controlled teardown.
    all: AtomicPtr<T>,
    deleted: AtomicBool,
    reclaimer: Arc<Reclaimer>,
}

impl<T: Reusable> Pool<T> {
    /// Creates an empty pool tearing down through `reclaimer`.
    #[must_use]
    pub fn new(reclaimer: Arc<Reclaimer>) -> Arc<Self> {
        Arc::new(Self {
            queue: MpscQueue::new(),
            all: AtomicPtr::new(ptr::null_mut()),
            deleted: AtomicBool::new(false),
            reclaimer,
        })
    }

    /// Attaches a newly constructed element to this pool.
    ///
    /// Links it into the all-elements chain and, when `available`,
    /// enqueues it for immediate claiming; otherwise the caller keeps
    /// using it and recycles it later.
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
    #[must_use]
    pub fn get_unused(&self) -> Option<Arc<T>> {
        let element = self.queue.dequeue()?;
        let core = element.core();
        core.state()
            .transition(&[LifeStage::Enqueued], LifeStage::PostQueued);
        core.state()
            .transition(&[LifeStage::PostQueued], LifeStage::Used);
        Some(element)
    }

    /// Tears the pool down while other threads may still be recycling
    /// elements against it.
    ///
    /// Severs every element's owner back-reference — future recycles
    /// self-destruct the element instead of re-enqueueing into a dead
    /// pool — and defers every strong reference the pool held through the
    /// reclaimer, since a racing thread may be mid-recycle right now.
    pub fn controlled_delete(&self) {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return;
        }
        let chain = chain_take(&self.all);
        trace::debug!(elements = chain.len(), "pool controlled delete");
        for element in &chain {
            element.core().clear_owner(&self.reclaimer);
        }
        let mut queued = Vec::new();
        self.queue.dequeue_all(&mut queued, usize::MAX);
        self.reclaimer.defer(chain);
        self.reclaimer.defer(queued);
    }

    /// Whether [`controlled_delete`](Self::controlled_delete) has run.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }
}

impl<T: Reusable> Drop for Pool<T> {
    fn drop(&mut self) {
        // A pool dropped without controlled_delete still owes the chain
        // its strong counts; exclusive access makes immediate drop sound.
        drop(chain_take(&self.all));
    }
}

impl<T: Reusable> ReusablePool<T> for Pool<T> {
    fn readmit(&self, element: Arc<T>) {
        self.queue.enqueue(element);
    }
}
