//! Reusable elements: pool attachment, recycling, and the debug-only
//! lifecycle state machine.
//!
//! A reusable element is constructed once, attached to exactly one pool,
//! and cycles between "in use by a client" and "available in the pool"
//! for its entire life. It is only truly destroyed once its owning pool
//! is gone *and* it is recycled one final time — at that point there is
//! no pool to return to, so the element self-destructs.
//!
//! The owner back-reference is written once at attach time and cleared at
//! most once at controlled teardown, but read by any thread recycling the
//! element; it is therefore an explicit acquire/release atomic, and the
//! cleared indirection block is freed through the deferred reclaimer so a
//! racing reader stays sound.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crate::queue::node::{Links, Node};
use crate::reclaim::Reclaimer;
use crate::registry::Handle;

/// A pool that can take recycled elements back.
pub trait ReusablePool<T: Reusable>: Send + Sync {
    /// Puts a recycled element back on the availability queue.
    ///
    /// The element may be claimed by another thread the instant this
    /// returns; implementations and callers must touch nothing afterwards.
    fn readmit(&self, element: Arc<T>);
}

/// An element that can live in a pool and be recycled instead of freed.
///
/// Implementors route their [`Node`] links through the embedded core:
///
/// ```
/// use talos::pool::{Reusable, ReusableCore};
/// use talos::queue::{Links, Node};
///
/// struct Buffer {
///     core: ReusableCore<Buffer>,
///     bytes: Vec<u8>,
/// }
///
/// // SAFETY: the links live in the embedded core for the value's whole
/// // lifetime, and the pool protocol keeps the element in at most one
/// // queue at a time.
/// unsafe impl Node for Buffer {
///     fn links(&self) -> &Links<Self> {
///         self.core.links()
///     }
/// }
///
/// impl Reusable for Buffer {
///     fn core(&self) -> &ReusableCore<Self> {
///         &self.core
///     }
/// }
/// # let _ = Buffer { core: ReusableCore::new(), bytes: Vec::new() };
/// ```
pub trait Reusable: Node {
    /// Accesses the element's embedded lifecycle core.
    fn core(&self) -> &ReusableCore<Self>;
}

/// Lifecycle stages, checked in debug builds only.
///
/// `PostQueued` covers the window between leaving the availability queue
/// and being handed to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifeStage {
    /// Freshly constructed, not yet attached.
    Unknown = 0,
    /// Recycled, on its way back to the pool.
    Recycled = 1,
    /// Held by a client.
    Used = 2,
    /// Resting on the pool's availability queue.
    Enqueued = 3,
    /// Dequeued from the pool, not yet handed out.
    PostQueued = 4,
    /// Final recycle after pool teardown; about to be freed.
    Deleted = 5,
}

#[cfg(debug_assertions)]
impl LifeStage {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Unknown,
            1 => Self::Recycled,
            2 => Self::Used,
            3 => Self::Enqueued,
            4 => Self::PostQueued,
            5 => Self::Deleted,
            _ => unreachable!("invalid lifecycle stage {raw}"),
        }
    }
}

/// Debug-only checked lifecycle state. Compiles to nothing in release:
/// the atomic protocols carry correctness on their own, this layer only
/// catches use-after-recycle and double-recycle during development.
pub(crate) struct LifeState {
    #[cfg(debug_assertions)]
    stage: std::sync::atomic::AtomicU8,
}

impl LifeState {
    pub(crate) const fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            stage: std::sync::atomic::AtomicU8::new(LifeStage::Unknown as u8),
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn transition(&self, allowed: &[LifeStage], to: LifeStage) {
        let current = LifeStage::from_u8(self.stage.load(Ordering::Relaxed));
        assert!(
            allowed.contains(&current),
            "invalid lifecycle transition {current:?} -> {to:?}",
        );
        self.stage.store(to as u8, Ordering::Relaxed);
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    pub(crate) fn transition(&self, _allowed: &[LifeStage], _to: LifeStage) {}

    #[cfg(debug_assertions)]
    pub(crate) fn stage(&self) -> LifeStage {
        LifeStage::from_u8(self.stage.load(Ordering::Relaxed))
    }
}

/// Boxed owner indirection: a thin pointer to a fat `Weak`.
struct OwnerBox<T: Reusable>(Weak<dyn ReusablePool<T>>);

/// Per-element lifecycle state embedded in every [`Reusable`].
pub struct ReusableCore<T: Reusable> {
    /// Availability-queue link.
    links: Links<T>,
    /// Owner pool back-reference; null once the pool is torn down.
    owner: AtomicPtr<OwnerBox<T>>,
    /// Next element in the pool's all-elements chain.
    chain: AtomicPtr<T>,
    /// Registry handle, when the element participates in stamped words.
    handle: AtomicU32,
    state: LifeState,
}

impl<T: Reusable> ReusableCore<T> {
    /// Creates a detached core.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            links: Links::new(),
            owner: AtomicPtr::new(ptr::null_mut()),
            chain: AtomicPtr::new(ptr::null_mut()),
            handle: AtomicU32::new(0),
            state: LifeState::new(),
        }
    }

    /// The availability-queue links; [`Node`] impls delegate here.
    #[inline]
    #[must_use]
    pub fn links(&self) -> &Links<T> {
        &self.links
    }

    /// The element's registry handle; `Handle::NIL` if unregistered.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> Handle {
        Handle::from(self.handle.load(Ordering::Relaxed))
    }

    /// Records the element's registry handle.
    pub fn set_handle(&self, handle: Handle) {
        self.handle.store(u32::from(handle), Ordering::Relaxed);
    }

    pub(crate) fn state(&self) -> &LifeState {
        &self.state
    }

    /// The current lifecycle stage (debug builds only).
    #[cfg(debug_assertions)]
    #[must_use]
    pub fn stage(&self) -> LifeStage {
        self.state.stage()
    }

    /// Installs the owner back-reference. Written exactly once, at attach.
    pub(crate) fn set_owner(&self, owner: Weak<dyn ReusablePool<T>>) {
        let boxed = Box::into_raw(Box::new(OwnerBox(owner)));
        let previous = self.owner.swap(boxed, Ordering::Release);
        debug_assert!(previous.is_null(), "element attached to a second pool");
    }

    /// Severs the owner back-reference, deferring the indirection block
    /// past any racing reader.
    pub(crate) fn clear_owner(&self, reclaimer: &Reclaimer) {
        let raw = self.owner.swap(ptr::null_mut(), Ordering::AcqRel);
        if !raw.is_null() {
            // SAFETY: the pointer came from `Box::into_raw` in `set_owner`
            // and the swap above cleared it exactly once.
            reclaimer.defer(unsafe { Box::from_raw(raw) });
        }
    }

    /// Upgrades the owner back-reference, if the pool still exists.
    pub(crate) fn owner_pool(&self) -> Option<Arc<dyn ReusablePool<T>>> {
        let raw = self.owner.load(Ordering::Acquire);
        if raw.is_null() {
            return None;
        }
        // SAFETY: a non-null owner block is freed only through the
        // reclaimer after being cleared, so a reader that loaded it here
        // finishes this upgrade well inside the grace window.
        unsafe { (*raw).0.upgrade() }
    }
}

impl<T: Reusable> Default for ReusableCore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Reusable> Drop for ReusableCore<T> {
    fn drop(&mut self) {
        let raw = self.owner.swap(ptr::null_mut(), Ordering::Relaxed);
        if !raw.is_null() {
            // SAFETY: exclusive access; the block was never cleared.
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

/// Returns an element to its owning pool, or destroys it if the pool is
/// gone.
///
/// This is the release path every client calls when done with an element
/// obtained from `get_unused`. If the owning pool was torn down
/// concurrently, the element self-destructs here instead of corrupting a
/// half-dismantled pool.
pub fn recycle<T: Reusable>(element: Arc<T>) {
    let core = element.core();
    core.state()
        .transition(&[LifeStage::Used], LifeStage::Recycled);
    match core.owner_pool() {
        Some(pool) => {
            core.state()
                .transition(&[LifeStage::Recycled], LifeStage::Enqueued);
            // A racing consumer may own the element the instant it is
            // readmitted; this call is strictly last.
            pool.readmit(element);
        }
        None => {
            core.state()
                .transition(&[LifeStage::Recycled], LifeStage::Deleted);
            drop(element);
        }
    }
}

/// Prepends `element` to a pool's all-elements chain, transferring one
/// strong count into the chain.
pub(crate) fn chain_prepend<T: Reusable>(head: &AtomicPtr<T>, element: &Arc<T>) {
    let raw = Arc::into_raw(Arc::clone(element)).cast_mut();
    loop {
        let current = head.load(Ordering::Acquire);
        element.core().chain.store(current, Ordering::Relaxed);
        if head
            .compare_exchange_weak(current, raw, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

/// Detaches a pool's all-elements chain, reconstructing the strong counts
/// it held. Head of the returned list is the most recently attached.
pub(crate) fn chain_take<T: Reusable>(head: &AtomicPtr<T>) -> Vec<Arc<T>> {
    let mut elements = Vec::new();
    let mut current = head.swap(ptr::null_mut(), Ordering::AcqRel);
    while !current.is_null() {
        // SAFETY: the chain held one strong count per element, transferred
        // in by `chain_prepend` and reconstructed exactly once here.
        let element = unsafe { Arc::from_raw(current.cast_const()) };
        current = element.core().chain.load(Ordering::Acquire);
        elements.push(element);
    }
    elements
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Elem {
        core: ReusableCore<Elem>,
    }

    // SAFETY: links live in the embedded core; pool protocol keeps the
    // element in at most one queue.
    unsafe impl Node for Elem {
        fn links(&self) -> &Links<Self> {
            self.core.links()
        }
    }

    impl Reusable for Elem {
        fn core(&self) -> &ReusableCore<Self> {
            &self.core
        }
    }

    struct SinkPool {
        readmitted: Mutex<Vec<Arc<Elem>>>,
    }

    impl ReusablePool<Elem> for SinkPool {
        fn readmit(&self, element: Arc<Elem>) {
            self.readmitted.lock().unwrap().push(element);
        }
    }

    fn elem() -> Arc<Elem> {
        Arc::new(Elem {
            core: ReusableCore::new(),
        })
    }

    #[test]
    fn test_recycle_readmits_to_live_owner() {
        let pool = Arc::new(SinkPool {
            readmitted: Mutex::new(Vec::new()),
        });
        let element = elem();
        let strong: Arc<dyn ReusablePool<Elem>> = pool.clone();
        let weak: Weak<dyn ReusablePool<Elem>> = Arc::downgrade(&strong);
        element.core().set_owner(weak);
        element
            .core()
            .state()
            .transition(&[LifeStage::Unknown], LifeStage::Used);

        recycle(Arc::clone(&element));
        assert_eq!(pool.readmitted.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_recycle_self_destructs_without_owner() {
        let element = elem();
        element
            .core()
            .state()
            .transition(&[LifeStage::Unknown], LifeStage::Used);
        let weak = Arc::downgrade(&element);

        recycle(element);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_recycle_self_destructs_after_owner_cleared() {
        let reclaimer = Reclaimer::start(std::time::Duration::from_millis(10));
        let pool = Arc::new(SinkPool {
            readmitted: Mutex::new(Vec::new()),
        });
        let element = elem();
        let strong_pool: Arc<dyn ReusablePool<Elem>> = pool.clone();
        let weak_pool: Weak<dyn ReusablePool<Elem>> = Arc::downgrade(&strong_pool);
        element.core().set_owner(weak_pool);
        element
            .core()
            .state()
            .transition(&[LifeStage::Unknown], LifeStage::Used);

        element.core().clear_owner(&reclaimer);
        let weak = Arc::downgrade(&element);
        recycle(element);

        assert!(pool.readmitted.lock().unwrap().is_empty());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "invalid lifecycle transition")]
    fn test_double_recycle_is_caught() {
        let element = elem();
        element
            .core()
            .state()
            .transition(&[LifeStage::Unknown], LifeStage::Used);
        element
            .core()
            .state()
            .transition(&[LifeStage::Used], LifeStage::Recycled);
        // Recycling again from Recycled must trip the state machine.
        element
            .core()
            .state()
            .transition(&[LifeStage::Used], LifeStage::Recycled);
    }

    #[test]
    fn test_chain_prepend_and_take() {
        let head = AtomicPtr::new(ptr::null_mut());
        let first = elem();
        let second = elem();

        chain_prepend(&head, &first);
        chain_prepend(&head, &second);
        assert_eq!(Arc::strong_count(&first), 2);

        let taken = chain_take(&head);
        assert_eq!(taken.len(), 2);
        // Most recently attached comes first.
        assert!(Arc::ptr_eq(&taken[0], &second));
        assert!(Arc::ptr_eq(&taken[1], &first));

        drop(taken);
        assert_eq!(Arc::strong_count(&first), 1);
    }
}
