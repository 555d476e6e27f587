//! Payload containers for the bounded queue.
//!
//! A container wraps one payload so the queue can operate on a fixed
//! shape with its own recycle lifecycle. Its forward link is a stamped
//! word that *rests on a dummy stamp keyed to the container's reuse
//! counter* whenever no successor is published; a publisher whose keyed
//! CAS no longer matches learns the container was recycled under it and
//! backs off. The back link, written before the tail CAS, carries the
//! predecessor's reuse so chain reconstruction can tell a live
//! predecessor from a recycled one.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::pool::{Reusable, ReusableCore};
use crate::queue::node::{Links, Node};
use crate::stamp::{AtomicStamped, Stamped};

/// Queue payload container with its own recycle lifecycle.
pub struct Container<T: Send + 'static> {
    core: ReusableCore<Container<T>>,
    /// Payload cell. Filled by the enqueuer that owns the container,
    /// taken by whoever wins the claim CAS on a queue control word.
    slot: UnsafeCell<Option<T>>,
    /// Forward link `(successor handle, key)`; a dummy stamp while no
    /// successor is published.
    pub(crate) next: AtomicStamped,
    /// Back link `(predecessor handle, predecessor reuse)`.
    pub(crate) prev: AtomicStamped,
    /// Lifetime counter distinguishing successive uses of this slot.
    reuse: AtomicU32,
}

// SAFETY: the payload cell is accessed under the queue's claim protocol —
// filled before publication, taken only by the single CAS winner — so
// sharing the container between threads is sound whenever `T` can move
// between them.
unsafe impl<T: Send + 'static> Send for Container<T> {}
unsafe impl<T: Send + 'static> Sync for Container<T> {}

impl<T: Send + 'static> Container<T> {
    /// Creates an empty, unregistered container.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: ReusableCore::new(),
            slot: UnsafeCell::new(None),
            next: AtomicStamped::new(Stamped::ZERO),
            prev: AtomicStamped::new(Stamped::ZERO),
            reuse: AtomicU32::new(0),
        }
    }

    /// Current reuse counter.
    #[inline]
    pub(crate) fn reuse(&self) -> u32 {
        self.reuse.load(Ordering::Acquire)
    }

    /// Advances the reuse counter, invalidating every key derived from
    /// the previous lifetime. Returns the new value.
    #[inline]
    pub(crate) fn bump_reuse(&self) -> u32 {
        self.reuse.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Parks the forward link on a resting stamp.
    #[inline]
    pub(crate) fn park_next(&self, resting: Stamped) {
        self.next.store(resting, Ordering::Release);
    }

    #[inline]
    pub(crate) fn set_prev(&self, prev: Stamped) {
        self.prev.store(prev, Ordering::Release);
    }

    #[inline]
    pub(crate) fn clear_prev(&self) {
        self.prev.store(Stamped::ZERO, Ordering::Release);
    }

    /// Stores the payload.
    ///
    /// # Safety
    ///
    /// The caller must own the container exclusively (freshly acquired,
    /// not yet published).
    pub(crate) unsafe fn fill(&self, value: T) {
        // SAFETY: exclusivity forwarded to the caller.
        unsafe { *self.slot.get() = Some(value) };
    }

    /// Takes the payload, if any.
    ///
    /// # Safety
    ///
    /// The caller must have claimed the container by winning the relevant
    /// control-word CAS.
    pub(crate) unsafe fn take(&self) -> Option<T> {
        // SAFETY: exclusivity forwarded to the caller.
        unsafe { (*self.slot.get()).take() }
    }
}

impl<T: Send + 'static> Default for Container<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the links live in the embedded core for the container's whole
// lifetime; the pool protocol keeps it in at most one queue at a time.
unsafe impl<T: Send + 'static> Node for Container<T> {
    fn links(&self) -> &Links<Self> {
        self.core.links()
    }
}

impl<T: Send + 'static> Reusable for Container<T> {
    fn core(&self) -> &ReusableCore<Self> {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_invalidates_old_keys() {
        let container: Container<u32> = Container::new();
        let before = container.reuse();
        let after = container.bump_reuse();
        assert_eq!(after, before.wrapping_add(1));
        assert_eq!(container.reuse(), after);
    }

    #[test]
    fn test_fill_and_take() {
        let container: Container<String> = Container::new();
        // SAFETY: single-threaded test owns the container outright.
        unsafe {
            assert!(container.take().is_none());
            container.fill("payload".to_string());
            assert_eq!(container.take().as_deref(), Some("payload"));
            assert!(container.take().is_none());
        }
    }
}
