//! Lock-free intrusive queues and reusable-object pools for real-time
//! systems where heap allocation in hot paths is unacceptable.
//!
//! # Overview
//!
//! - [`queue`] — four intrusive FIFO engines (unbounded drainable MPSC,
//!   always-resident MPSC, single-owner, and a soft-bounded queue with
//!   stamped-pointer ABA protection) plus typed value front-ends.
//! - [`pool`] — reusable-object pools built on those engines: elements
//!   are recycled back to their pool instead of freed, and pools can be
//!   torn down while other threads are still recycling against them.
//! - [`registry`] — stable integer handles for objects referenced from
//!   packed stamped words.
//! - [`reclaim`] — the deferred-reclamation service teardown paths hand
//!   shared objects to instead of freeing them synchronously.
//! - [`stamp`] — the `(index, flags, counter)` word every ABA-sensitive
//!   control word is built from.
//!
//! Enqueue paths are wait-free (one atomic swap, or a CAS retry bounded
//! by contention); no operation parks a thread. Transient races are
//! absorbed internally by retry — callers see a value or an absent
//! result, never a "try again" status.
//!
//! # Example
//!
//! ```
//! use talos::queue::ValueQueue;
//! use talos::reclaim::Reclaimer;
//!
//! let reclaimer = Reclaimer::start(Reclaimer::DEFAULT_GRACE);
//! let queue = ValueQueue::new(reclaimer);
//!
//! queue.push(42u32);
//! assert_eq!(queue.pop(), Some(42));
//! assert_eq!(queue.pop(), None);
//! ```

pub mod pool;
pub mod queue;
pub mod reclaim;
pub mod registry;
pub mod stamp;

pub(crate) mod trace;

pub use pool::{LifeStage, LocalPool, Pool, PoolError, Reusable, ReusableCore, SharedPool, recycle};
pub use queue::{
    BoundedQueue, Fragment, Links, LocalQueue, MpscQueue, Node, ResidentQueue, SharedValueQueue,
    TryDequeueError, ValueQueue,
};
pub use reclaim::Reclaimer;
pub use registry::{Handle, HandleRegistry};
pub use stamp::{AtomicStamped, Stamped};
pub use trace::init_tracing;
