// SPDX-License-Identifier: MPL-2.0

//! Freeing, breaking, reclaiming, and aging reservations.

use core::sync::atomic::Ordering;

use log::debug;

use super::{
    alloc::crosses_boundary,
    queues::{FreeQueues, Lru, NIL},
    ReservFlags, RV_DEC,
};
use crate::{page::VmPage, prelude::*, sync::StripeGuard};

impl ReservManager {
    /// Frees the given page if it belongs to a reservation. Returns true
    /// if the page is freed and false otherwise; in the latter case the
    /// caller must hand the page to the physical allocator itself.
    ///
    /// The caller must hold the owning object's write lock, which keeps
    /// the reservation from being concurrently bound to that object.
    pub fn free_page(&self, m: &VmPage) -> bool {
        let index = self.from_paddr(m.paddr());
        let rv = self.rv(index);
        if rv.is_free() {
            return false;
        }
        let guard = self.lock_rv(index);
        // A reclaim may have broken the reservation while we were taking
        // its lock; the reservation cannot have been rebound, since this
        // page is still allocated.
        if rv.is_free() {
            drop(guard);
            return false;
        }
        self.depopulate(index, &guard, m.index_in_reserv());
        drop(guard);
        true
    }

    /// Breaks the given reservation. Except for the specified page, all
    /// free pages in the reservation are returned to the physical
    /// allocator as maximal contiguous runs, and the population state is
    /// reset.
    ///
    /// The reservation must not be in a partially populated queue.
    pub(crate) fn break_rv(
        &self,
        fq: &mut FreeQueues,
        guard: &StripeGuard<'_>,
        index: u32,
        keep: Option<&VmPage>,
    ) {
        debug_assert!(guard.covers(index));
        let rv = self.rv(index);
        debug_assert!(!rv.is_free(), "break: reserv {index} is free");
        debug_assert!(
            !rv.flags().intersects(ReservFlags::PARTPOP),
            "break: reserv {index} in a partpop queue"
        );
        fq.objq_remove(rv.object_ptr() as usize, index);
        self.set_object(index, guard, None);
        if let Some(m) = keep {
            // The reservation is going away anyway, so there is no harm
            // in abusing the population map to keep the caller's page out
            // of the sweep below.
            let i = m.index_in_reserv();
            debug_assert!(
                rv.popmap.is_clear(i),
                "break: reserv {index} popmap is corrupted"
            );
            rv.popmap.set(i);
            let popcnt = rv.popcnt.load(Ordering::Relaxed);
            rv.popcnt.store(popcnt + 1, Ordering::Relaxed);
        }

        // Sweep the population map with alternating clear-run and set-run
        // scans, handing each maximal run of free pages back as one
        // contiguous free.
        let first = rv.first_paddr();
        let mut freed = 0;
        let mut bit = 0;
        while let Some(begin) = rv.popmap.first_zero_from(bit) {
            let end = rv.popmap.first_one_from(begin).unwrap_or(LEVEL_0_NPAGES);
            self.phys()
                .free_contig(first + (begin << PAGE_SHIFT), end - begin);
            freed += end - begin;
            bit = end;
        }
        debug_assert_eq!(
            rv.popcnt() + freed,
            LEVEL_0_NPAGES,
            "break: reserv {index} popcnt is corrupted"
        );
        rv.popmap.clear_all();
        rv.popcnt.store(0, Ordering::Relaxed);
        self.broken.fetch_add(1, Ordering::Relaxed);
    }

    /// Breaks all reservations belonging to the given object.
    ///
    /// The caller must hold the object's write lock.
    pub fn break_all(&self, object: &VmObject) {
        let key = object.addr();
        let mut fq = self.queues.lock();
        loop {
            let Some(head) = fq.objq_first(key) else { break };
            let mut index = head;
            let guard = match self.try_lock_rv(index) {
                Some(guard) => guard,
                None => {
                    // Contended: release the free-queues lock, take the
                    // stripe lock, and re-validate against the list head,
                    // which may have moved meanwhile.
                    drop(fq);
                    let guard = self.lock_rv(index);
                    fq = self.queues.lock();
                    match fq.objq_first(key) {
                        Some(next) if next != index => {
                            if !guard.covers(next) {
                                drop(guard);
                                continue;
                            }
                            index = next;
                            guard
                        }
                        Some(_) => guard,
                        None => {
                            drop(guard);
                            continue;
                        }
                    }
                }
            };
            // Process this entry, then chain into further entries while
            // they share the held stripe to amortize lock acquisition.
            loop {
                let rv = self.rv(index);
                debug_assert!(
                    rv.owned_by(object),
                    "break_all: reserv {index} is corrupted"
                );
                if rv.flags().intersects(ReservFlags::PARTPOP) {
                    self.lru_dequeue(&mut fq, index);
                }
                self.break_rv(&mut fq, &guard, index, None);
                match fq.objq_first(key) {
                    Some(next) if guard.covers(next) => index = next,
                    _ => break,
                }
            }
            drop(guard);
        }
    }

    /// Breaks the given partially populated reservation, releasing its
    /// free pages to the physical allocator.
    fn reclaim_rv(&self, fq: &mut FreeQueues, guard: &StripeGuard<'_>, index: u32) {
        debug_assert!(
            self.rv(index).flags().intersects(ReservFlags::PARTPOP),
            "reclaim: reserv {index} not in a partpop queue"
        );
        self.lru_dequeue(fq, index);
        self.break_rv(fq, guard, index, None);
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
        debug!("reclaimed reserv {index}");
    }

    /// Breaks the reservation at the head of the inactive queue, falling
    /// back to the head of the active queue, and releases its free pages
    /// to the physical allocator. Returns true if a reservation was
    /// broken and false if both queues are empty.
    pub fn reclaim_inactive(&self) -> bool {
        let mut fq = self.queues.lock();
        'restart: loop {
            for lru in [Lru::Inactive, Lru::Active] {
                let mut index = fq.head(lru);
                while index != NIL && self.rv(index).flags().contains(ReservFlags::MARKER) {
                    index = fq.next(index);
                }
                if index == NIL {
                    continue;
                }
                let guard = match self.try_lock_rv(index) {
                    Some(guard) => guard,
                    None => {
                        // Contended: drop the free-queues lock, block on
                        // the stripe, and re-validate that the
                        // reservation is still queued where we found it.
                        drop(fq);
                        let guard = self.lock_rv(index);
                        let wanted = match lru {
                            Lru::Active => ReservFlags::ACTIVE,
                            Lru::Inactive => ReservFlags::INACTIVE,
                        };
                        if !self.rv(index).flags().contains(wanted) {
                            drop(guard);
                            fq = self.queues.lock();
                            continue 'restart;
                        }
                        fq = self.queues.lock();
                        guard
                    }
                };
                self.reclaim_rv(&mut fq, &guard, index);
                return true;
            }
            return false;
        }
    }

    /// Searches the inactive queue, in LRU order, for a reservation with a
    /// run of free pages satisfying the given request for contiguous
    /// physical memory, and breaks the first one found. Returns true if a
    /// reservation was broken and false otherwise.
    pub fn reclaim_contig(
        &self,
        npages: usize,
        low: Paddr,
        high: Paddr,
        alignment: usize,
        boundary: Paddr,
    ) -> bool {
        // A run of all N pages never exists in a partially populated
        // reservation.
        if npages > LEVEL_0_NPAGES - 1 {
            return false;
        }
        let size = npages << PAGE_SHIFT;
        let mut fq = self.queues.lock();
        let mut index = fq.head(Lru::Inactive);
        while index != NIL {
            let next = fq.next(index);
            let rv = self.rv(index);
            let first = rv.first_paddr();
            let pa_last = first + ((LEVEL_0_NPAGES - 1) << PAGE_SHIFT);
            if pa_last + PAGE_SIZE < low + size {
                // This entire reservation is too low.
                index = next;
                continue;
            }
            if first + size > high {
                // This entire reservation is too high.
                index = next;
                continue;
            }
            // Start the search for free pages at "low".
            let mut bit = if first < low {
                (low + PAGE_SIZE - 1 - first) >> PAGE_SHIFT
            } else {
                0
            };
            'scan: while let Some(start) = rv.popmap.first_zero_from(bit) {
                let pa = first + (start << PAGE_SHIFT);
                debug_assert!(pa >= low, "reclaim_contig: pa is too low");
                if pa + size > high {
                    // The rest of this reservation is too high.
                    break 'scan;
                }
                if pa & (alignment - 1) != 0 || crosses_boundary(pa, size, boundary) {
                    // This page fails the alignment or boundary
                    // requirement; keep searching the reservation until
                    // its free pages are excluded or exhausted.
                    bit = start + 1;
                    if bit >= LEVEL_0_NPAGES {
                        break 'scan;
                    }
                    continue;
                }
                let end = rv.popmap.first_one_from(start).unwrap_or(LEVEL_0_NPAGES);
                if end - start >= npages {
                    // A satisfying run. Re-verify it under the
                    // reservation lock before breaking.
                    if let Some(guard) = self.try_lock_rv(index) {
                        if rv.flags().contains(ReservFlags::INACTIVE)
                            && (start..start + npages).all(|i| rv.popmap.is_clear(i))
                        {
                            self.reclaim_rv(&mut fq, &guard, index);
                            return true;
                        }
                        drop(guard);
                    }
                    break 'scan;
                }
                bit = end;
            }
            index = next;
        }
        false
    }

    /// Ages the active queue: advances the clock hand through it,
    /// decrementing activation counts and demoting up to `target`
    /// reservations whose count reaches zero to the inactive queue. The
    /// hand is left where the walk stopped so that subsequent calls
    /// resume in FIFO order.
    pub fn scan(&self, mut target: usize) {
        let marker = self.marker_index();
        let mut fq = self.queues.lock();
        let mut cursor = fq.next(marker);
        if cursor == NIL {
            // Start over from the beginning of the queue.
            cursor = fq.head(Lru::Active);
        }
        while cursor != NIL {
            if target == 0 {
                break;
            }
            let next = fq.next(cursor);
            let rv = self.rv(cursor);
            if !rv.flags().contains(ReservFlags::MARKER) {
                if let Some(guard) = self.try_lock_rv(cursor) {
                    let actcnt = rv.actcnt();
                    if actcnt - RV_DEC <= 0 {
                        self.lru_dequeue(&mut fq, cursor);
                        fq.insert_tail(Lru::Inactive, cursor);
                        rv.flags_insert(ReservFlags::INACTIVE);
                        rv.actcnt.store(0, Ordering::Relaxed);
                        target -= 1;
                    } else {
                        rv.actcnt.store(actcnt - RV_DEC, Ordering::Relaxed);
                    }
                    drop(guard);
                }
            }
            cursor = next;
        }
        // Reseat the clock hand where the walk stopped.
        if cursor != marker {
            fq.remove(Lru::Active, marker);
            if cursor != NIL {
                fq.insert_before(Lru::Active, cursor, marker);
            } else {
                fq.insert_head(Lru::Active, marker);
            }
        }
    }
}
