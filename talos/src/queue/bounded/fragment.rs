//! Detached chain walker for the bounded queue.
//!
//! [`BoundedQueue::dequeue_all`] swaps the queue's control words out for
//! the `NIL` marker and hands the captured chain to a [`Fragment`]. The
//! fragment walks forward along the published links; when it reaches a
//! container whose forward link is still a dummy resting stamp while not
//! being the captured tail — the publishing producer was preempted
//! mid-flight — it rebuilds the missing link by walking *back* from the
//! captured tail along `prev` links, which were written before the tail
//! CAS and are therefore already valid.
//!
//! [`BoundedQueue::dequeue_all`]: super::BoundedQueue::dequeue_all

use std::sync::atomic::Ordering;

use crate::stamp::{COUNTER_MASK, Stamped};

use super::container::Container;
use super::{BoundedQueue, NIL};

/// A chain detached from a [`BoundedQueue`], walked in FIFO order.
///
/// Holds the queue's consumer right until dropped; dropping recycles
/// whatever was not yet consumed.
pub struct Fragment<'q, T: Send + 'static> {
    queue: &'q BoundedQueue<T>,
    /// Next container to deliver; `NIL` when exhausted.
    cursor: u32,
    /// The captured tail container.
    tail: u32,
}

impl<'q, T: Send + 'static> Fragment<'q, T> {
    /// Builds a fragment from the captured control words. Called with the
    /// consumer flag held; `Drop` releases it.
    pub(super) fn new(queue: &'q BoundedQueue<T>, head: Stamped, tail: Stamped) -> Self {
        let tail = tail.index();
        let cursor = if head.index() != NIL {
            head.index()
        } else if tail != NIL {
            // The chain head was never promoted out of the pending word;
            // recover it from the back links.
            Self::backtrack_head(queue, tail)
        } else {
            NIL
        };
        Self {
            queue,
            cursor,
            tail,
        }
    }

    /// Delivers the next payload of the detached chain, recycling its
    /// container.
    ///
    /// Containers that were already spent (the flagged resident) carry no
    /// payload and are skipped.
    #[must_use]
    pub fn dequeue(&mut self) -> Option<T> {
        while self.cursor != NIL {
            let handle = self.cursor;
            let Some(container) = self.queue.resolve(handle) else {
                self.cursor = NIL;
                break;
            };
            // SAFETY: containers stay registered while the queue lives.
            let container_ref = unsafe { container.as_ref() };
            self.cursor = if handle == self.tail {
                NIL
            } else {
                self.successor_of(handle, container_ref)
            };
            // SAFETY: the fragment owns the detached chain exclusively.
            let value = unsafe { container_ref.take() };
            self.queue.release(container);
            if value.is_some() {
                return value;
            }
        }
        None
    }

    /// Recycles every remaining container, dropping its payload.
    pub fn clear(&mut self) {
        while self.dequeue().is_some() {}
    }

    /// Whether the walk has delivered the whole chain.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.cursor == NIL
    }

    fn successor_of(&self, handle: u32, container: &Container<T>) -> u32 {
        let next = container.next.load(Ordering::Acquire);
        if next.index() != NIL && !BoundedQueue::<T>::is_dummy(next.index()) {
            return next.index();
        }
        // Rare preemption branch: the successor's producer won the tail
        // CAS but its forward publish has not landed. Walk back from the
        // captured tail along prev links until this container is reached.
        let mut cur = self.tail;
        let mut successor = NIL;
        while cur != NIL && cur != handle {
            let Some(back) = self.queue.resolve(cur) else {
                return NIL;
            };
            // SAFETY: interior chain containers are fragment-owned and
            // not yet recycled.
            let prev = unsafe { back.as_ref() }.prev.load(Ordering::Acquire);
            successor = cur;
            cur = prev.index();
        }
        if cur == handle { successor } else { NIL }
    }

    fn backtrack_head(queue: &BoundedQueue<T>, tail: u32) -> u32 {
        let mut cur = tail;
        loop {
            let Some(container) = queue.resolve(cur) else {
                return cur;
            };
            // SAFETY: containers stay registered while the queue lives.
            let prev = unsafe { container.as_ref() }.prev.load(Ordering::Acquire);
            if prev.index() == NIL {
                return cur;
            }
            let Some(predecessor) = queue.resolve(prev.index()) else {
                return cur;
            };
            // SAFETY: as above.
            if unsafe { predecessor.as_ref() }.reuse() & COUNTER_MASK != prev.counter() {
                // The predecessor was already recycled under a different
                // lifetime: cur is the effective chain head.
                return cur;
            }
            cur = prev.index();
        }
    }
}

impl<T: Send + 'static> Drop for Fragment<'_, T> {
    fn drop(&mut self) {
        self.clear();
        self.queue.consumer.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim::Reclaimer;
    use std::time::Duration;

    fn queue() -> BoundedQueue<u64> {
        BoundedQueue::new(None, Reclaimer::start(Duration::from_millis(20)))
    }

    #[test]
    fn test_empty_fragment() {
        let queue = queue();
        let mut fragment = queue.dequeue_all();
        assert!(fragment.is_exhausted());
        assert_eq!(fragment.dequeue(), None);
    }

    #[test]
    fn test_partial_walk_then_drop_recycles_the_rest() {
        let queue = queue();
        for i in 0..6 {
            queue.enqueue(i);
        }
        let mut fragment = queue.dequeue_all();
        assert_eq!(fragment.dequeue(), Some(0));
        assert_eq!(fragment.dequeue(), Some(1));
        drop(fragment);

        // The dropped fragment recycled its containers; steady state
        // keeps serving without new allocations.
        queue.enqueue(100);
        assert_eq!(queue.dequeue(), Some(100));
    }

    #[test]
    fn test_fragment_skips_the_spent_resident() {
        let queue = queue();
        queue.enqueue(1);
        queue.enqueue(2);
        // Consume 1 normally, then flag 2's container... 1 advances, 2 is
        // claimed by the consumed flag and stays resident.
        assert_eq!(queue.dequeue(), Some(1));
        assert_eq!(queue.dequeue(), Some(2));

        queue.enqueue(3);
        let mut fragment = queue.dequeue_all();
        // The spent resident container is walked over without yielding.
        assert_eq!(fragment.dequeue(), Some(3));
        assert_eq!(fragment.dequeue(), None);
    }
}
