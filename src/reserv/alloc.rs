// SPDX-License-Identifier: MPL-2.0

//! Page allocation from existing or newly created reservations.
//!
//! Both entry points share the same shape: derive the would-be reservation
//! base from the requested offset, look up the left and right neighbor
//! reservations under the sequence protocol, and either land the request in
//! an existing reservation or obtain a fresh superpage run from the
//! physical allocator and initialize reservations over it.

use align_ext::AlignExt;

use super::ReservFlags;
use crate::{
    object::{ObjectInner, VmObject},
    page::VmPage,
    prelude::*,
    sync::StripeGuard,
};

/// Does the run of `size` bytes at `pa` cross a multiple of `boundary`?
///
/// A zero `boundary` never constrains.
pub(super) fn crosses_boundary(pa: Paddr, size: usize, boundary: Paddr) -> bool {
    (pa ^ (pa + size - 1)) & !boundary.wrapping_sub(1) != 0
}

/// The outcome of a sequence-validated lookup against a neighbor page's
/// reservation.
enum NeighborHit<'a> {
    /// The reservation claims `(object, pindex)`; its stripe lock is held
    /// and the claim has been re-validated under it.
    Found(u32, StripeGuard<'a>),
    /// The reservation does not claim the offset; the derived cap bounds
    /// where a new reservation could go.
    Cap(Pindex),
}

impl ReservManager {
    /// Follows a neighbor page to its reservation and decides, without
    /// locking in the common case, whether that reservation already claims
    /// `(object, pindex)`.
    ///
    /// `foreign_cap` is the cap to report when the reservation belongs to
    /// no object or another object; `own_cap` derives the cap from the
    /// reservation's own base offset otherwise.
    fn neighbor_lookup<'a>(
        &'a self,
        object: &VmObject,
        pindex: Pindex,
        neighbor: Paddr,
        foreign_cap: Pindex,
        own_cap: impl Fn(Pindex) -> Pindex,
    ) -> NeighborHit<'a> {
        let index = self.from_paddr(neighbor);
        let rv = self.rv(index);
        loop {
            let seq = rv.seq.read();
            let cap = if rv.owned_by(object) {
                if rv.has_pindex(pindex) {
                    let guard = self.lock_rv(index);
                    if rv.seq.consistent(seq) {
                        return NeighborHit::Found(index, guard);
                    }
                    drop(guard);
                    continue;
                }
                own_cap(rv.pindex())
            } else {
                foreign_cap
            };
            if rv.seq.consistent(seq) {
                return NeighborHit::Cap(cap);
            }
        }
    }

    /// Allocates a page from an existing or newly created reservation.
    ///
    /// `mpred`, if present, must be the greatest resident page of `object`
    /// with an offset strictly less than `pindex`. The caller must hold
    /// the object's write lock and pass its view in as `inner`.
    pub fn alloc_page(
        &self,
        object: &VmObject,
        inner: &mut ObjectInner,
        pindex: Pindex,
        mpred: Option<&VmPage>,
    ) -> Option<&VmPage> {
        // Is a reservation fundamentally impossible?
        let index = object.reserv_index(pindex);
        if pindex < index || pindex >= inner.size() {
            return None;
        }

        let first = pindex - index;

        // Look for an existing reservation through the neighbors.
        let msucc = if let Some(mpred) = mpred {
            debug_assert!(
                mpred.pindex() < pindex,
                "alloc_page: mpred does not precede pindex {pindex}"
            );
            match self.neighbor_lookup(object, pindex, mpred.paddr(), mpred.pindex() + 1, |base| {
                base + LEVEL_0_NPAGES
            }) {
                NeighborHit::Found(found, guard) => {
                    return self.populate_existing(object, pindex, found, guard)
                }
                NeighborHit::Cap(leftcap) => {
                    if leftcap > first {
                        return None;
                    }
                }
            }
            inner.succ_of(mpred.pindex())
        } else {
            inner.first_resident()
        };

        if let Some((succ_pindex, succ_paddr)) = msucc {
            debug_assert!(
                succ_pindex > pindex,
                "alloc_page: msucc does not succeed pindex {pindex}"
            );
            match self.neighbor_lookup(object, pindex, succ_paddr, succ_pindex, |base| base) {
                NeighborHit::Found(found, guard) => {
                    return self.populate_existing(object, pindex, found, guard)
                }
                NeighborHit::Cap(rightcap) => {
                    if first + LEVEL_0_NPAGES > rightcap {
                        return None;
                    }
                }
            }
        }

        // Would a new reservation extend past the end of the object? Never
        // over-speculate on file-backed memory; otherwise speculate that
        // the object may grow.
        if first + LEVEL_0_NPAGES > inner.size() && object.is_vnode_backed() {
            return None;
        }

        // Allocate and populate the new reservation.
        let run = self.phys().alloc_order(LEVEL_0_ORDER)?;
        let rv_index = self.from_paddr(run);
        let rv = self.rv(rv_index);
        let guard = self.lock_rv(rv_index);
        debug_assert_eq!(
            rv.pages,
            Some(run),
            "alloc_page: reserv {rv_index} pages is corrupted"
        );
        debug_assert!(rv.is_free(), "alloc_page: reserv {rv_index} isn't free");
        debug_assert!(
            rv.popcnt() == 0 && rv.popmap.is_empty(),
            "alloc_page: reserv {rv_index} population is corrupted"
        );
        debug_assert!(
            !rv.flags().intersects(ReservFlags::PARTPOP),
            "alloc_page: reserv {rv_index} in a partpop queue"
        );
        self.queues.lock().objq_insert(object.addr(), rv_index);
        self.set_object(rv_index, &guard, Some((object, first)));
        self.populate(rv_index, &guard, index);
        drop(guard);
        Some(self.page(run + (index << PAGE_SHIFT)))
    }

    /// Lands a single-page request in a reservation that claims
    /// `(object, pindex)`.
    fn populate_existing(
        &self,
        object: &VmObject,
        pindex: Pindex,
        index: u32,
        guard: StripeGuard<'_>,
    ) -> Option<&VmPage> {
        let i = object.reserv_index(pindex);
        let rv = self.rv(index);
        let m = self.page(rv.first_paddr() + (i << PAGE_SHIFT));
        // A racing rename may already have claimed the offset.
        if rv.popmap.is_set(i) {
            return None;
        }
        self.populate(index, &guard, i);
        drop(guard);
        Some(m)
    }

    /// Allocates a contiguous run of `npages` pages from existing or newly
    /// created reservations, subject to placement constraints.
    ///
    /// All of the pages must lie at or above `low` and below `high`;
    /// `alignment` constrains the first page's physical address, and a
    /// nonzero `boundary` must not be crossed by the run. Both are powers
    /// of two. `mpred` and locking as for [`ReservManager::alloc_page`].
    #[allow(clippy::too_many_arguments)]
    pub fn alloc_contig(
        &self,
        object: &VmObject,
        inner: &mut ObjectInner,
        pindex: Pindex,
        npages: usize,
        low: Paddr,
        high: Paddr,
        alignment: usize,
        boundary: Paddr,
        mpred: Option<&VmPage>,
    ) -> Option<&VmPage> {
        assert!(npages != 0, "alloc_contig: npages is 0");

        // Is a reservation fundamentally impossible?
        let index = object.reserv_index(pindex);
        if pindex < index || pindex + npages > inner.size() {
            return None;
        }

        // All reservations of a particular size have the same alignment,
        // so the least significant bits of the first page's physical
        // address follow from its offset within a reservation. Could the
        // requested index satisfy the alignment and boundary requirements
        // at all?
        let pa = index << PAGE_SHIFT;
        if pa & (alignment - 1) != 0 {
            return None;
        }
        let size = npages << PAGE_SHIFT;
        if crosses_boundary(pa, size, boundary) {
            return None;
        }

        let mut first = pindex - index;

        // Look for an existing reservation through the neighbors.
        let msucc = if let Some(mpred) = mpred {
            debug_assert!(
                mpred.pindex() < pindex,
                "alloc_contig: mpred does not precede pindex {pindex}"
            );
            match self.neighbor_lookup(object, pindex, mpred.paddr(), mpred.pindex() + 1, |base| {
                base + LEVEL_0_NPAGES
            }) {
                NeighborHit::Found(found, guard) => {
                    return self.populate_existing_contig(
                        object, pindex, npages, low, high, alignment, boundary, found, guard,
                    )
                }
                NeighborHit::Cap(leftcap) => {
                    if leftcap > first {
                        return None;
                    }
                }
            }
            inner.succ_of(mpred.pindex())
        } else {
            inner.first_resident()
        };

        let minpages = index + npages;
        let maxpages = minpages.align_up(LEVEL_0_NPAGES);
        let mut allocpages = maxpages;
        if let Some((succ_pindex, succ_paddr)) = msucc {
            debug_assert!(
                succ_pindex > pindex,
                "alloc_contig: pindex {pindex} already allocated"
            );
            match self.neighbor_lookup(object, pindex, succ_paddr, succ_pindex, |base| base) {
                NeighborHit::Found(found, guard) => {
                    return self.populate_existing_contig(
                        object, pindex, npages, low, high, alignment, boundary, found, guard,
                    )
                }
                NeighborHit::Cap(rightcap) => {
                    if first + maxpages > rightcap {
                        if maxpages == LEVEL_0_NPAGES {
                            return None;
                        }
                        // At least one reservation fits between leftcap
                        // and rightcap, but one for the last of the
                        // requested pages does not. Trim the upcoming
                        // allocation accordingly.
                        allocpages = minpages;
                    }
                }
            }
        }

        // Would the last new reservation extend past the end of the
        // object? Don't allocate it if the object is file-backed;
        // otherwise speculate that the object may grow.
        if first + maxpages > inner.size() && object.is_vnode_backed() {
            if maxpages == LEVEL_0_NPAGES {
                return None;
            }
            allocpages = minpages;
        }

        // Allocate the physical pages. The alignment and boundary for
        // this allocation may differ from the requested ones: the
        // requested index need not be the first page of the first new
        // reservation.
        let run = self.phys().alloc_contig(
            allocpages,
            low,
            high,
            alignment.max(LEVEL_0_SIZE),
            if boundary > LEVEL_0_SIZE { boundary } else { 0 },
        )?;

        // The allocated pages always begin at a reservation boundary but
        // do not always end at one. Initialize every reservation that is
        // completely covered by them.
        let mut m = run;
        let mut m_ret = None;
        let mut i = index;
        let mut npages = npages;
        let mut allocpages = allocpages;
        while allocpages >= LEVEL_0_NPAGES {
            let rv_index = self.from_paddr(m);
            let rv = self.rv(rv_index);
            let guard = self.lock_rv(rv_index);
            debug_assert_eq!(
                rv.pages,
                Some(m),
                "alloc_contig: reserv {rv_index} pages is corrupted"
            );
            debug_assert!(rv.is_free(), "alloc_contig: reserv {rv_index} isn't free");
            debug_assert!(
                rv.popcnt() == 0 && rv.popmap.is_empty(),
                "alloc_contig: reserv {rv_index} population is corrupted"
            );
            debug_assert!(
                !rv.flags().intersects(ReservFlags::PARTPOP),
                "alloc_contig: reserv {rv_index} in a partpop queue"
            );
            self.queues.lock().objq_insert(object.addr(), rv_index);
            self.set_object(rv_index, &guard, Some((object, first)));
            let n = (LEVEL_0_NPAGES - i).min(npages);
            for k in 0..n {
                self.populate(rv_index, &guard, i + k);
            }
            drop(guard);
            npages -= n;
            if m_ret.is_none() {
                m_ret = Some(m + (i << PAGE_SHIFT));
                i = 0;
            }
            m += LEVEL_0_SIZE;
            first += LEVEL_0_NPAGES;
            allocpages -= LEVEL_0_NPAGES;
        }
        m_ret.map(|paddr| self.page(paddr))
    }

    /// Lands a contiguous request entirely inside a reservation that
    /// claims `(object, pindex)`.
    #[allow(clippy::too_many_arguments)]
    fn populate_existing_contig(
        &self,
        object: &VmObject,
        pindex: Pindex,
        npages: usize,
        low: Paddr,
        high: Paddr,
        alignment: usize,
        boundary: Paddr,
        index: u32,
        guard: StripeGuard<'_>,
    ) -> Option<&VmPage> {
        let i = object.reserv_index(pindex);
        // Does the request fit within the reservation?
        if i + npages > LEVEL_0_NPAGES {
            return None;
        }
        let rv = self.rv(index);
        let pa = rv.first_paddr() + (i << PAGE_SHIFT);
        let size = npages << PAGE_SHIFT;
        if pa < low
            || pa + size > high
            || pa & (alignment - 1) != 0
            || crosses_boundary(pa, size, boundary)
        {
            return None;
        }
        // A racing rename may already have claimed part of the run.
        for k in 0..npages {
            if rv.popmap.is_set(i + k) {
                return None;
            }
        }
        for k in 0..npages {
            self.populate(index, &guard, i + k);
        }
        drop(guard);
        Some(self.page(pa))
    }
}
