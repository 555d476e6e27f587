//! The intrusive queue family.
//!
//! Four engines differing in producer/consumer cardinality and in what
//! they trade for speed, plus typed value front-ends:
//!
//! | Queue | Producers | Consumers | Notes |
//! |-------|-----------|-----------|-------|
//! | [`MpscQueue`] | many | one at a time | drains fully, batch dequeue |
//! | [`ResidentQueue`] | many | one, or concurrent CAS path | one node always resident |
//! | [`LocalQueue`] | single owner | single owner | no atomics contention, `peek` |
//! | [`BoundedQueue`] | many | one at a time | soft bound, stamped handles, detach-all |
//!
//! All engines are intrusive: elements embed their own [`Links`] and no
//! allocation happens per enqueue. Enqueueing is wait-free everywhere (a
//! single swap or a bounded CAS retry loop under contention); nothing in
//! this module parks a thread.

use std::ops::{Deref, DerefMut};

pub mod bounded;
pub mod local;
pub mod mpsc;
pub mod node;
pub mod resident;
pub mod value;

pub use bounded::{BoundedQueue, Container, Fragment};
pub use local::LocalQueue;
pub use mpsc::MpscQueue;
pub use node::{Links, Node};
pub use resident::{ResidentQueue, TryDequeueError};
pub use value::{SharedValueQueue, ValueQueue};

/// Pads a hot field to its own cache line to avoid false sharing between
/// producer and consumer words.
#[repr(align(64))]
pub(crate) struct CachePadded<T>(pub(crate) T);

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CachePadded<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}
