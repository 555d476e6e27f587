//! Handle registry: stable integer handles for shared objects.
//!
//! Stamped control words pack a 32-bit slot index next to their counter
//! (see [`crate::stamp`]); this module assigns those indices. The table
//! grows in doubling chunks behind a fixed chunk directory, so `resolve`
//! is a lock-free array load; registration and release take a mutex — a
//! low-frequency setup/teardown path, not claimed lock-free.
//!
//! Handle `0` is reserved and never assigned, letting `0` double as the
//! absent value inside packed words.
//!
//! A released slot's strong reference is dropped through the deferred
//! reclaimer, so a racing `resolve` that loaded the pointer just before
//! the release stays sound for the grace window.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::reclaim::Reclaimer;

/// Slots in chunk 0; chunk `i` holds `CHUNK_BASE << i` slots.
const CHUNK_BASE: usize = 64;
const CHUNK_COUNT: usize = 20;

/// Stable index of a registered object. `Handle::NIL` means absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Handle(u32);

impl Handle {
    /// The reserved absent handle.
    pub const NIL: Self = Self(0);

    /// Whether this is the absent handle.
    #[inline]
    #[must_use]
    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Handle {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<Handle> for u32 {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Inner {
    free: Vec<u32>,
    next: u32,
}

/// Growable handle table with a freed-slot stack.
pub struct HandleRegistry<T: Send + Sync + 'static> {
    chunks: [OnceLock<Box<[AtomicPtr<T>]>>; CHUNK_COUNT],
    inner: Mutex<Inner>,
    reclaimer: Arc<Reclaimer>,
}

impl<T: Send + Sync + 'static> HandleRegistry<T> {
    /// Creates an empty registry releasing slots through `reclaimer`.
    #[must_use]
    pub fn new(reclaimer: Arc<Reclaimer>) -> Self {
        Self {
            chunks: [const { OnceLock::new() }; CHUNK_COUNT],
            inner: Mutex::new(Inner {
                free: Vec::new(),
                // Slot 0 stays a sentinel so NIL is never a live handle.
                next: 1,
            }),
            reclaimer,
        }
    }

    /// Registers an object, preferring a freed slot over table growth.
    ///
    /// The registry holds one strong reference until [`unregister`].
    ///
    /// # Panics
    ///
    /// Panics if the table is exhausted — a fatal condition, far beyond
    /// any realistic number of live objects.
    ///
    /// [`unregister`]: Self::unregister
    pub fn register(&self, object: &Arc<T>) -> Handle {
        let index = {
            let mut inner = self.inner.lock().unwrap();
            inner.free.pop().unwrap_or_else(|| {
                let index = inner.next;
                inner.next = inner
                    .next
                    .checked_add(1)
                    .expect("handle registry exhausted");
                index
            })
        };
        let (chunk_index, offset) = locate(index);
        assert!(chunk_index < CHUNK_COUNT, "handle registry exhausted");
        let chunk = self.chunks[chunk_index].get_or_init(|| {
            (0..CHUNK_BASE << chunk_index)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect()
        });
        let raw = Arc::into_raw(Arc::clone(object)).cast_mut();
        let previous = chunk[offset].swap(raw, Ordering::Release);
        debug_assert!(previous.is_null(), "registry slot reassigned while live");
        Handle(index)
    }

    /// Resolves a handle to its object, lock-free.
    ///
    /// The returned pointer is valid for at least the reclaimer's grace
    /// period even if the handle is concurrently unregistered.
    #[inline]
    #[must_use]
    pub fn resolve(&self, handle: Handle) -> Option<NonNull<T>> {
        if handle.is_nil() {
            return None;
        }
        let (chunk_index, offset) = locate(handle.0);
        let chunk = self.chunks.get(chunk_index)?.get()?;
        NonNull::new(chunk[offset].load(Ordering::Acquire))
    }

    /// Releases a handle for reuse, deferring the drop of the slot's
    /// strong reference past racing resolvers.
    pub fn unregister(&self, handle: Handle) {
        debug_assert!(!handle.is_nil(), "unregistering the NIL handle");
        if handle.is_nil() {
            return;
        }
        let (chunk_index, offset) = locate(handle.0);
        let Some(chunk) = self.chunks.get(chunk_index).and_then(OnceLock::get) else {
            debug_assert!(false, "unregistering a handle that was never assigned");
            return;
        };
        let mut inner = self.inner.lock().unwrap();
        let raw = chunk[offset].swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            return;
        }
        inner.free.push(handle.0);
        drop(inner);
        // SAFETY: the slot held exactly one strong count, stored by
        // `register` and cleared exactly once by the swap above.
        let arc = unsafe { Arc::from_raw(raw.cast_const()) };
        self.reclaimer.defer(arc);
    }
}

impl<T: Send + Sync + 'static> Drop for HandleRegistry<T> {
    fn drop(&mut self) {
        // Exclusive access: no resolver can race, so remaining strong
        // counts are released immediately rather than deferred.
        for chunk in self.chunks.iter().filter_map(OnceLock::get) {
            for slot in chunk.iter() {
                let raw = slot.swap(ptr::null_mut(), Ordering::Relaxed);
                if !raw.is_null() {
                    // SAFETY: the slot held exactly one strong count.
                    drop(unsafe { Arc::from_raw(raw.cast_const()) });
                }
            }
        }
    }
}

/// Maps a slot index to (chunk, offset within chunk).
#[inline]
fn locate(index: u32) -> (usize, usize) {
    let bucket = (index as usize / CHUNK_BASE) + 1;
    let chunk = bucket.ilog2() as usize;
    let offset = index as usize - CHUNK_BASE * ((1 << chunk) - 1);
    (chunk, offset)
}
