// SPDX-License-Identifier: MPL-2.0

//! A sequence counter for optimistic lock-free reads.
//!
//! The counter is even while the protected fields are stable and odd while
//! a writer is mid-update. A writer, who must otherwise serialize with other
//! writers (here, via the reservation's stripe lock), brackets its field
//! stores with [`SeqCount::write_begin`] and [`SeqCount::write_end`]. A
//! reader snapshots the counter, reads the fields, and re-checks the
//! counter; the read is valid iff both snapshots are equal and even.
//!
//! The protected fields must themselves be atomics accessed with relaxed
//! ordering. The fences below pair the field accesses with the counter
//! transitions.

use core::sync::atomic::{fence, AtomicUsize, Ordering};

/// A sequence counter guarding a set of relaxed atomic fields.
pub struct SeqCount(AtomicUsize);

impl SeqCount {
    /// Creates a new counter in the stable (even) state.
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Takes a read snapshot, spinning past in-progress writes.
    ///
    /// The returned value is always even.
    pub fn read(&self) -> usize {
        loop {
            let seq = self.0.load(Ordering::Acquire);
            if seq & 1 == 0 {
                return seq;
            }
            core::hint::spin_loop();
        }
    }

    /// Returns whether the fields read since `prev` was snapshotted by
    /// [`Self::read`] form a consistent view.
    pub fn consistent(&self, prev: usize) -> bool {
        fence(Ordering::Acquire);
        self.0.load(Ordering::Relaxed) == prev
    }

    /// Enters the writer critical section, making the counter odd.
    ///
    /// The caller must hold the lock that serializes writers.
    pub fn write_begin(&self) {
        let seq = self.0.load(Ordering::Relaxed);
        debug_assert!(seq & 1 == 0, "nested sequence write");
        self.0.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
    }

    /// Leaves the writer critical section, making the counter even again.
    pub fn write_end(&self) {
        let seq = self.0.load(Ordering::Relaxed);
        debug_assert!(seq & 1 == 1, "unpaired sequence write");
        self.0.store(seq.wrapping_add(1), Ordering::Release);
    }
}

impl Default for SeqCount {
    fn default() -> Self {
        Self::new()
    }
}
