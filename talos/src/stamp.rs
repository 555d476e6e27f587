//! Stamped index words: a slot index paired with a wrapping generation
//! counter and flag bits, packed into a single `u64` so the whole triple
//! can be compared-and-swapped atomically.
//!
//! A compare-exchange against a stamped word only succeeds if the index,
//! the counter, *and* the flags all still match. Once a control word's
//! counter has advanced past a reader's captured stamp, any CAS using the
//! stale stamp fails — this is the ABA defense the bounded queue is built
//! on.
//!
//! # Layout
//!
//! ```text
//! bit 63 ........ 32 | 31    | 30..29 | 28 ........ 0
//!       index        | spare | flags  |   counter
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of bits in the wrapping generation counter.
pub const COUNTER_BITS: u32 = 29;

/// Mask for the counter field.
pub const COUNTER_MASK: u32 = (1 << COUNTER_BITS) - 1;

const FLAGS_SHIFT: u32 = COUNTER_BITS;
const FLAGS_MASK: u64 = 0b11 << FLAGS_SHIFT;
const INDEX_SHIFT: u32 = 32;

/// Flag bit marking a payload as already consumed while its container
/// stays resident in the queue.
pub const FLAG_CONSUMED: u8 = 0b01;

/// An `(index, flags, counter)` triple packed into a `u64`.
///
/// The index is a registry handle (`0` meaning "no element"); the counter
/// wraps modulo 2^29.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Stamped(u64);

impl Stamped {
    /// The all-zero word: no index, no flags, counter zero.
    pub const ZERO: Self = Self(0);

    /// Packs an index and counter with no flags set.
    #[inline]
    #[must_use]
    pub const fn new(index: u32, counter: u32) -> Self {
        Self(((index as u64) << INDEX_SHIFT) | (counter & COUNTER_MASK) as u64)
    }

    /// Returns the slot index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        (self.0 >> INDEX_SHIFT) as u32
    }

    /// Returns the generation counter.
    #[inline]
    #[must_use]
    pub const fn counter(self) -> u32 {
        (self.0 as u32) & COUNTER_MASK
    }

    /// Returns the flag bits.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> u8 {
        ((self.0 & FLAGS_MASK) >> FLAGS_SHIFT) as u8
    }

    /// Whether the consumed flag is set.
    #[inline]
    #[must_use]
    pub const fn is_consumed(self) -> bool {
        self.flags() & FLAG_CONSUMED != 0
    }

    /// Returns this word with the consumed flag set.
    #[inline]
    #[must_use]
    pub const fn consumed(self) -> Self {
        Self(self.0 | ((FLAG_CONSUMED as u64) << FLAGS_SHIFT))
    }

    /// Returns the counter advanced by one, wrapping modulo 2^29.
    #[inline]
    #[must_use]
    pub const fn next_counter(self) -> u32 {
        self.counter().wrapping_add(1) & COUNTER_MASK
    }

    /// Raw packed representation.
    #[inline]
    #[must_use]
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    /// Reconstructs a stamped word from its raw representation.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for Stamped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stamped")
            .field("index", &self.index())
            .field("counter", &self.counter())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Atomic cell holding a [`Stamped`] word.
#[repr(transparent)]
pub struct AtomicStamped(AtomicU64);

impl AtomicStamped {
    /// Creates a cell holding the given initial word.
    #[must_use]
    pub const fn new(value: Stamped) -> Self {
        Self(AtomicU64::new(value.into_raw()))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> Stamped {
        Stamped::from_raw(self.0.load(order))
    }

    #[inline]
    pub fn store(&self, value: Stamped, order: Ordering) {
        self.0.store(value.into_raw(), order);
    }

    #[inline]
    pub fn swap(&self, value: Stamped, order: Ordering) -> Stamped {
        Stamped::from_raw(self.0.swap(value.into_raw(), order))
    }

    /// Whole-word compare-exchange; fails on any mismatch of index,
    /// counter, or flags.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Stamped,
        new: Stamped,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Stamped, Stamped> {
        self.0
            .compare_exchange(current.into_raw(), new.into_raw(), success, failure)
            .map(Stamped::from_raw)
            .map_err(Stamped::from_raw)
    }
}

impl fmt::Debug for AtomicStamped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(Ordering::Relaxed), f)
    }
}
