//! Single-owner pool over the local queue.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::queue::LocalQueue;
use crate::reclaim::Reclaimer;
use crate::trace;

use super::PoolError;
use super::reusable::{LifeStage, Reusable, ReusablePool, chain_prepend, chain_take};

/// Pool for a single logical owner: no concurrency control on the
/// availability queue at all.
///
/// The fastest variant, valid only when `attach`, `get_unused`, *and*
/// recycling of this pool's elements all happen under one logical owner —
/// not necessarily one OS thread for the pool's whole life, but never two
/// overlapping. Recycling an element of a `LocalPool` from a second
/// thread while the owner is operating on it is a data race.
pub struct LocalPool<T: Reusable> {
    queue: UnsafeCell<LocalQueue<T>>,
    all: AtomicPtr<T>,
    deleted: AtomicBool,
    reclaimer: Arc<Reclaimer>,
}

// SAFETY: all access to the unsynchronized queue is confined to the single
// logical owner by this type's usage contract; the remaining fields are
// atomics. The `Sync` bound is required so the owner back-reference can
// name the pool, not to permit shared mutation.
unsafe impl<T: Reusable> Send for LocalPool<T> {}
unsafe impl<T: Reusable> Sync for LocalPool<T> {}

impl<T: Reusable> LocalPool<T> {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(reclaimer: Arc<Reclaimer>) -> Arc<Self> {
        Arc::new(Self {
            queue: UnsafeCell::new(LocalQueue::new()),
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
            // SAFETY: confined to the single logical owner by contract.
            unsafe { (*self.queue.get()).enqueue(Arc::clone(element)) };
        } else {
            core.state()
                .transition(&[LifeStage::Unknown], LifeStage::Used);
        }
        Ok(())
    }

    /// Claims a previously recycled element, if one is available.
    #[must_use]
    pub fn get_unused(&self) -> Option<Arc<T>> {
        // SAFETY: confined to the single logical owner by contract.
        let element = unsafe { (*self.queue.get()).dequeue() }?;
        let core = element.core();
        core.state()
            .transition(&[LifeStage::Enqueued], LifeStage::PostQueued);
        core.state()
            .transition(&[LifeStage::PostQueued], LifeStage::Used);
        Some(element)
    }

    /// Tears the pool down. See [`Pool::controlled_delete`] for the
    /// protocol; here the deferral matters only for elements still out
    /// with the owner, since no other thread may operate on this pool.
    ///
    /// [`Pool::controlled_delete`]: super::Pool::controlled_delete
    pub fn controlled_delete(&self) {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return;
        }
        let chain = chain_take(&self.all);
        trace::debug!(elements = chain.len(), "local pool controlled delete");
        for element in &chain {
            element.core().clear_owner(&self.reclaimer);
        }
        let mut queued = Vec::new();
        // SAFETY: confined to the single logical owner by contract.
        while let Some(element) = unsafe { (*self.queue.get()).dequeue() } {
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

impl<T: Reusable> Drop for LocalPool<T> {
    fn drop(&mut self) {
        // A pool dropped without controlled_delete still owes the chain
        // its strong counts; exclusive access makes immediate drop sound.
        drop(chain_take(&self.all));
    }
}

impl<T: Reusable> ReusablePool<T> for LocalPool<T> {
    fn readmit(&self, element: Arc<T>) {
        // SAFETY: recycling of a local pool's elements is confined to the
        // single logical owner by the type's usage contract.
        unsafe { (*self.queue.get()).enqueue(element) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::reusable::{ReusableCore, recycle};
    use std::time::Duration;

    struct Scratch {
        core: ReusableCore<Scratch>,
        generation: std::sync::atomic::AtomicUsize,
    }

    // SAFETY: links live in the embedded core; pool protocol keeps the
    // element in at most one queue.
    unsafe impl crate::queue::Node for Scratch {
        fn links(&self) -> &crate::queue::Links<Self> {
            self.core.links()
        }
    }

    impl Reusable for Scratch {
        fn core(&self) -> &ReusableCore<Self> {
            &self.core
        }
    }

    fn scratch() -> Arc<Scratch> {
        Arc::new(Scratch {
            core: ReusableCore::new(),
            generation: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    fn reclaimer() -> Arc<Reclaimer> {
        Reclaimer::start(Duration::from_millis(20))
    }

    #[test]
    fn test_round_trip_reuses_the_same_element() {
        let pool = LocalPool::new(reclaimer());
        let element = scratch();
        pool.attach(&element, true).unwrap();

        for generation in 1..=5 {
            let claimed = pool.get_unused().unwrap();
            assert!(Arc::ptr_eq(&claimed, &element));
            claimed.generation.store(generation, Ordering::Relaxed);
            recycle(claimed);
        }
        assert_eq!(element.generation.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_empty_pool_yields_none() {
        let pool: Arc<LocalPool<Scratch>> = LocalPool::new(reclaimer());
        assert!(pool.get_unused().is_none());
    }

    #[test]
    fn test_delete_then_recycle_self_destructs() {
        let reclaimer = reclaimer();
        let pool = LocalPool::new(Arc::clone(&reclaimer));
        let element = scratch();
        pool.attach(&element, false).unwrap();

        pool.controlled_delete();
        let weak = Arc::downgrade(&element);
        recycle(element);

        std::thread::sleep(Duration::from_millis(40));
        reclaimer.sweep_now();
        assert!(weak.upgrade().is_none());
    }
}
