//! Reusable-object pools: recycle instead of free.
//!
//! A pool hands out previously recycled elements ([`get_unused`]) so hot
//! paths never touch the allocator; new elements are constructed and
//! [`attach`]ed only when the pool runs dry. Releasing an element goes
//! through [`recycle`], which returns it to its owning pool — or destroys
//! it if the pool was torn down concurrently.
//!
//! Three variants differ in who may claim elements:
//!
//! | Pool | Claiming | Availability queue |
//! |------|----------|--------------------|
//! | [`Pool`] | one reader at a time | [`MpscQueue`](crate::queue::MpscQueue) |
//! | [`SharedPool`] | any number of threads | [`ResidentQueue`](crate::queue::ResidentQueue) |
//! | [`LocalPool`] | single logical owner | [`LocalQueue`](crate::queue::LocalQueue) |
//!
//! Every pool owns a chain threading all elements ever attached to it,
//! independent of queue membership, used only for controlled teardown:
//! [`controlled_delete`] severs each element's owner back-reference and
//! defers the pool's strong references through the
//! [`Reclaimer`](crate::reclaim::Reclaimer).
//!
//! [`get_unused`]: Pool::get_unused
//! [`attach`]: Pool::attach
//! [`controlled_delete`]: Pool::controlled_delete

use thiserror::Error;

pub mod local;
pub mod reusable;
pub mod shared;
pub mod single;

pub use local::LocalPool;
pub use reusable::{LifeStage, Reusable, ReusableCore, ReusablePool, recycle};
pub use shared::SharedPool;
pub use single::Pool;

/// Errors returned by pool operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The pool has been torn down by `controlled_delete`.
    #[error("pool has been deleted")]
    Deleted,
}
