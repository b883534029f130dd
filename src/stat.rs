// SPDX-License-Identifier: MPL-2.0

//! Read-only reservation statistics.
//!
//! These are inspection APIs for the surrounding kernel's sysctl-like
//! surface; none of them is needed for correct operation.

use core::sync::atomic::Ordering;

use align_ext::AlignExt;

use crate::{
    reserv::{
        queues::{Lru, NIL},
        ReservFlags,
    },
    ReservManager, LEVEL_0_NPAGES, LEVEL_0_SHIFT, LEVEL_0_SIZE,
};

/// A summary of one partially populated reservation queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// The number of reservations on the queue.
    pub count: usize,
    /// The total number of free pages held by them.
    pub unused_pages: usize,
}

/// A summary of both partially populated reservation queues.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PartPopStats {
    /// The active queue.
    pub active: QueueStats,
    /// The inactive queue.
    pub inactive: QueueStats,
}

impl ReservManager {
    /// The cumulative number of broken reservations.
    pub fn broken(&self) -> u64 {
        self.broken.load(Ordering::Relaxed)
    }

    /// The cumulative number of reservations freed by draining.
    pub fn freed(&self) -> u64 {
        self.freed.load(Ordering::Relaxed)
    }

    /// The cumulative number of reclaimed reservations.
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    /// The current number of fully populated reservations.
    ///
    /// Computed without taking any lock, so the returned value may be
    /// inexact.
    pub fn fullpop(&self) -> usize {
        let mut fullpop = 0;
        for seg in &self.segs {
            let mut paddr = seg.start.align_up(LEVEL_0_SIZE);
            while paddr + LEVEL_0_SIZE <= seg.end {
                let rv = self.rv((paddr >> LEVEL_0_SHIFT) as u32);
                fullpop += usize::from(rv.popcnt() == LEVEL_0_NPAGES);
                paddr += LEVEL_0_SIZE;
            }
        }
        fullpop
    }

    /// Describes the current state of the partially populated reservation
    /// queues.
    pub fn partpop_stats(&self) -> PartPopStats {
        let fq = self.queues.lock();
        let mut stats = PartPopStats::default();
        for (lru, queue) in [
            (Lru::Active, &mut stats.active),
            (Lru::Inactive, &mut stats.inactive),
        ] {
            let mut index = fq.head(lru);
            while index != NIL {
                let rv = self.rv(index);
                if !rv.flags().contains(ReservFlags::MARKER) {
                    queue.count += 1;
                    queue.unused_pages += LEVEL_0_NPAGES - rv.popcnt();
                }
                index = fq.next(index);
            }
        }
        stats
    }
}
