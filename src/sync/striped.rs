// SPDX-License-Identifier: MPL-2.0

//! The striped reservation lock array.
//!
//! A per-reservation mutex would double the size of the reservation record
//! on 64-bit targets. Instead, a fixed array of cache-line-padded spin
//! mutexes is shared by all reservations: a reservation maps to the lock at
//! its table index modulo the array size. This bounds the memory overhead
//! while giving near-per-reservation contention on realistic table sizes.

use spin::mutex::{SpinMutex, SpinMutexGuard};
use static_assertions::const_assert;

use crate::prelude::*;

/// The number of locks in the striped array.
pub const RV_LOCK_COUNT: usize = 256;

const_assert!(RV_LOCK_COUNT.is_power_of_two());

/// A spin mutex padded out to a cache line of its own.
#[repr(align(64))]
struct PaddedMutex(SpinMutex<()>);

/// The array of striped reservation locks.
pub struct LockArray {
    locks: Box<[PaddedMutex]>,
}

impl LockArray {
    /// Creates the lock array.
    pub fn new() -> Self {
        let locks = (0..RV_LOCK_COUNT)
            .map(|_| PaddedMutex(SpinMutex::new(())))
            .collect();
        Self { locks }
    }

    fn stripe_of(index: u32) -> usize {
        index as usize & (RV_LOCK_COUNT - 1)
    }

    /// Acquires the lock covering the reservation at `index`, spinning
    /// until it is available.
    pub fn lock(&self, index: u32) -> StripeGuard<'_> {
        let stripe = Self::stripe_of(index);
        StripeGuard {
            _inner: self.locks[stripe].0.lock(),
            stripe,
        }
    }

    /// Tries to acquire the lock covering the reservation at `index`
    /// without spinning.
    pub fn try_lock(&self, index: u32) -> Option<StripeGuard<'_>> {
        let stripe = Self::stripe_of(index);
        self.locks[stripe].0.try_lock().map(|inner| StripeGuard {
            _inner: inner,
            stripe,
        })
    }
}

impl Default for LockArray {
    fn default() -> Self {
        Self::new()
    }
}

/// Witness of ownership of one stripe of the reservation lock array.
///
/// Operations on a reservation's lock-protected fields demand a guard for
/// which [`StripeGuard::covers`] holds, the static analog of asserting the
/// lock owned.
pub struct StripeGuard<'a> {
    _inner: SpinMutexGuard<'a, ()>,
    stripe: usize,
}

impl StripeGuard<'_> {
    /// Returns whether this guard's stripe is the one protecting the
    /// reservation at `index`.
    pub fn covers(&self, index: u32) -> bool {
        self.stripe == LockArray::stripe_of(index)
    }
}
