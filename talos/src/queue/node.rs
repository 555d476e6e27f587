//! Intrusive link node shared by every queue variant.
//!
//! A queueable element embeds a [`Links`] value and implements [`Node`].
//! The queues never allocate per enqueue: linking happens through the
//! element's own `next` pointer, and ownership of one `Arc` strong count
//! is transferred into whichever queue currently holds the element.

use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Intrusive links embedded in a queueable element.
///
/// Only the element's current queue ever touches the `next` field; two
/// writers never mutate the same node concurrently.
pub struct Links<T> {
    next: AtomicPtr<T>,
    _marker: PhantomData<*mut T>,
}

impl<T> Links<T> {
    /// Creates unlinked links.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn next(&self) -> &AtomicPtr<T> {
        &self.next
    }
}

impl<T> Default for Links<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Links<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Links")
            .field("next", &self.next.load(Ordering::Relaxed))
            .finish()
    }
}

// SAFETY: the `next` pointer is only dereferenced under the queue
// protocols, which transfer ownership along with the pointer.
unsafe impl<T: Send> Send for Links<T> {}
unsafe impl<T: Send> Sync for Links<T> {}

/// An element that can live in the intrusive queues.
///
/// # Safety
///
/// Implementations must return the *same* [`Links`] instance for the
/// lifetime of the value, and a value must be linked into at most one
/// queue at a time. Enqueueing clones of the same `Arc` into two queues
/// concurrently corrupts both lists.
pub unsafe trait Node: Send + Sync + Sized + 'static {
    /// Accesses the element's embedded links.
    fn links(&self) -> &Links<Self>;
}

/// Transfers one strong count of `handle` into a raw pointer.
#[inline]
pub(crate) fn into_queue_ptr<T: Node>(handle: Arc<T>) -> *mut T {
    Arc::into_raw(handle).cast_mut()
}

/// Reconstructs the strong count transferred by [`into_queue_ptr`].
///
/// # Safety
///
/// `ptr` must have come from [`into_queue_ptr`] and must not be
/// reconstructed twice.
#[inline]
pub(crate) unsafe fn from_queue_ptr<T: Node>(ptr: *mut T) -> Arc<T> {
    // SAFETY: forwarded to the caller.
    unsafe { Arc::from_raw(ptr.cast_const()) }
}
