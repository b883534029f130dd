// SPDX-License-Identifier: MPL-2.0

//! Superpage reservation records and their manager.
//!
//! A reservation is constructed whenever a large physical page is
//! speculatively allocated to a memory object. The reservation provides the
//! small physical pages for the range `[pindex, pindex + N)` of offsets
//! within that object, where `N` is [`LEVEL_0_NPAGES`]. The reservation's
//! population count tracks how many of these pages are in use at any given
//! time. When and if the reservation is not fully utilized, it appears in
//! one of the two queues of partially populated reservations, from which it
//! can be aged, broken and reclaimed at any time.
//!
//! Reservations are locked by a combination of the striped lock array, the
//! free-queues lock, and memory object write locks. Each reservation also
//! contains a sequence counter used to perform lock-free checks of its
//! `(object, pindex)` identity. The stripe lock protects most of a
//! reservation's fields: the object binding, the population map and count,
//! the activation count, and the flags. Associating a reservation with an
//! object additionally requires that object's write lock; no object lock is
//! required to free a reservation from its object or to move it into
//! another object. Queue membership and object linkage are protected by the
//! free-queues lock.

mod alloc;
pub(crate) mod queues;
mod reclaim;
#[cfg(test)]
mod test;

use core::{
    fmt,
    ops::Range,
    ptr,
    sync::atomic::{AtomicI8, AtomicPtr, AtomicU16, AtomicU64, AtomicU8, AtomicUsize, Ordering},
};

use align_ext::AlignExt;
use bitflags::bitflags;
use log::info;
use spin::mutex::SpinMutex;
use static_assertions::const_assert;

use self::queues::{FreeQueues, Lru};
use crate::{
    object::VmObject,
    page::VmPage,
    phys::PhysAllocator,
    popmap::PopMap,
    prelude::*,
    sync::{LockArray, SeqCount, StripeGuard},
};

bitflags! {
    /// Reservation state flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub(crate) struct ReservFlags: u8 {
        /// Recently referenced; in the active queue.
        const ACTIVE = 1 << 0;
        /// Aged to a zero activation count; in the inactive queue.
        const INACTIVE = 1 << 1;
        /// The scan marker; never reachable from a page lookup.
        const MARKER = 1 << 2;
        /// Membership in either partially-populated queue.
        const PARTPOP = Self::ACTIVE.bits() | Self::INACTIVE.bits();
    }
}

/// The activation count given on the transition into the active queue.
const RV_INIT: i8 = 2;
/// Activation advance on populating a page.
const RV_POP_STEP: i8 = 1;
/// Activation advance on depopulating a page.
const RV_DEPOP_STEP: i8 = 1;
/// Activation decrement per scan visit.
const RV_DEC: i8 = 1;
/// The activation count saturates here.
const RV_ACT_MAX: i8 = 64;

// The population count must be able to represent LEVEL_0_NPAGES itself.
const_assert!(LEVEL_0_NPAGES <= u16::MAX as usize);

/// A superpage reservation record.
///
/// The fields that lock-free readers may observe are atomics; they are
/// mutated only under the reservation's stripe lock, and the object binding
/// only inside a sequence write. `pages` is written once when the
/// reservation table is initialized and is `None` for table slots whose
/// physical range is not backed by RAM.
pub struct Reserv {
    object: AtomicPtr<VmObject>,
    pindex: AtomicUsize,
    seq: SeqCount,
    pub(crate) popcnt: AtomicU16,
    actcnt: AtomicI8,
    flags: AtomicU8,
    pub(crate) popmap: PopMap,
    pub(crate) pages: Option<Paddr>,
}

impl Reserv {
    fn new() -> Self {
        Self {
            object: AtomicPtr::new(ptr::null_mut()),
            pindex: AtomicUsize::new(0),
            seq: SeqCount::new(),
            popcnt: AtomicU16::new(0),
            actcnt: AtomicI8::new(0),
            flags: AtomicU8::new(ReservFlags::empty().bits()),
            popmap: PopMap::new(),
            pages: None,
        }
    }

    pub(crate) fn flags(&self) -> ReservFlags {
        ReservFlags::from_bits_retain(self.flags.load(Ordering::Relaxed))
    }

    fn flags_insert(&self, flags: ReservFlags) {
        let cur = self.flags.load(Ordering::Relaxed);
        self.flags.store(cur | flags.bits(), Ordering::Relaxed);
    }

    fn flags_remove(&self, flags: ReservFlags) {
        let cur = self.flags.load(Ordering::Relaxed);
        self.flags.store(cur & !flags.bits(), Ordering::Relaxed);
    }

    pub(crate) fn object_ptr(&self) -> *mut VmObject {
        self.object.load(Ordering::Relaxed)
    }

    /// Is this reservation free, i.e. bound to no object?
    pub(crate) fn is_free(&self) -> bool {
        self.object_ptr().is_null()
    }

    pub(crate) fn owned_by(&self, object: &VmObject) -> bool {
        ptr::eq(self.object_ptr(), object as *const VmObject)
    }

    pub(crate) fn pindex(&self) -> Pindex {
        self.pindex.load(Ordering::Relaxed)
    }

    /// Does this reservation's index window contain `pindex`?
    pub(crate) fn has_pindex(&self, pindex: Pindex) -> bool {
        pindex.wrapping_sub(self.pindex()) & !(LEVEL_0_NPAGES - 1) == 0
    }

    /// The physical address of the first of the `N` base pages backing
    /// this reservation.
    pub(crate) fn first_paddr(&self) -> Paddr {
        self.pages.expect("reservation slot has no backing pages")
    }

    pub(crate) fn popcnt(&self) -> usize {
        self.popcnt.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn actcnt(&self) -> i8 {
        self.actcnt.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Reserv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reserv")
            .field("object", &self.object_ptr())
            .field("pindex", &self.pindex())
            .field("popcnt", &self.popcnt())
            .field("actcnt", &self.actcnt())
            .field("flags", &self.flags())
            .field("pages", &self.pages)
            .finish()
    }
}

/// The superpage reservation manager of one memory domain.
///
/// The reservation table is analogous in function to the page record array.
/// It differs in that it may contain a greater number of entries than there
/// are physical superpages: entries whose physical range is not backed by
/// RAM have no `pages` and are skipped. Mapping a page to its reservation
/// is a shift of the page's physical address.
pub struct ReservManager {
    /// Reservation records; the last slot is the scan marker.
    table: Box<[Reserv]>,
    /// One record per base page frame below the high water mark.
    pages: Box<[VmPage]>,
    locks: LockArray,
    pub(crate) queues: SpinMutex<FreeQueues>,
    phys: &'static dyn PhysAllocator,
    pub(crate) segs: Vec<Range<Paddr>>,
    pub(crate) broken: AtomicU64,
    pub(crate) freed: AtomicU64,
    pub(crate) reclaimed: AtomicU64,
}

impl ReservManager {
    /// Allocates the manager's data structures, in particular the
    /// reservation table.
    ///
    /// The table is sized from `high_water`, the highest physical address
    /// that may back a page, because every base page maps to a table entry
    /// by its physical address; the table may therefore hold more entries
    /// than there are usable superpages.
    pub fn startup(high_water: Paddr, phys: &'static dyn PhysAllocator) -> Self {
        let nres = high_water.div_ceil(LEVEL_0_SIZE);
        info!(
            "allocating {} reservation records for physical memory up to {:#x}",
            nres, high_water
        );
        let table = (0..nres + 1).map(|_| Reserv::new()).collect();
        let pages = (0..high_water >> PAGE_SHIFT)
            .map(|frame| VmPage::new(frame << PAGE_SHIFT))
            .collect();
        Self {
            table,
            pages,
            locks: LockArray::new(),
            queues: SpinMutex::new(FreeQueues::new(nres + 1)),
            phys,
            segs: Vec::new(),
            broken: AtomicU64::new(0),
            freed: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        }
    }

    /// Initializes the reservation table from the physical memory segment
    /// list and seats the scan marker.
    ///
    /// Single-threaded, at boot. Every superpage-aligned, superpage-sized
    /// range wholly contained in a segment gets its backing pages recorded;
    /// the remaining table slots stay latent.
    pub fn init(&mut self, segs: &[Range<Paddr>]) {
        debug_assert!(self.segs.is_empty(), "reservation table initialized twice");
        let marker = self.marker_index();
        for seg in segs {
            let mut paddr = seg.start.align_up(LEVEL_0_SIZE);
            while paddr + LEVEL_0_SIZE <= seg.end {
                self.table[paddr >> LEVEL_0_SHIFT].pages = Some(paddr);
                paddr += LEVEL_0_SIZE;
            }
        }
        self.segs = segs.to_vec();

        let rv = &self.table[marker as usize];
        rv.flags_insert(ReservFlags::MARKER | ReservFlags::ACTIVE);
        self.queues.lock().insert_head(Lru::Active, marker);
    }

    /// Returns the record of the base page at `paddr`.
    pub fn page(&self, paddr: Paddr) -> &VmPage {
        &self.pages[paddr >> PAGE_SHIFT]
    }

    /// Returns the reservation to which the given page might belong.
    pub fn reserv_from_page(&self, m: &VmPage) -> &Reserv {
        self.rv(self.from_paddr(m.paddr()))
    }

    pub(crate) fn rv(&self, index: u32) -> &Reserv {
        &self.table[index as usize]
    }

    pub(crate) fn from_paddr(&self, paddr: Paddr) -> u32 {
        let index = (paddr >> LEVEL_0_SHIFT) as u32;
        debug_assert!(index < self.marker_index());
        index
    }

    pub(crate) fn marker_index(&self) -> u32 {
        (self.table.len() - 1) as u32
    }

    pub(crate) fn lock_rv(&self, index: u32) -> StripeGuard<'_> {
        self.locks.lock(index)
    }

    pub(crate) fn try_lock_rv(&self, index: u32) -> Option<StripeGuard<'_>> {
        self.locks.try_lock(index)
    }

    /// Publishes or clears a reservation's `(object, pindex)` binding
    /// inside a sequence write.
    ///
    /// Publishing additionally requires the object's write lock, held by
    /// the caller of the allocation entry points.
    pub(crate) fn set_object(
        &self,
        index: u32,
        guard: &StripeGuard<'_>,
        binding: Option<(&VmObject, Pindex)>,
    ) {
        debug_assert!(guard.covers(index));
        let rv = self.rv(index);
        rv.seq.write_begin();
        match binding {
            Some((object, pindex)) => {
                rv.pindex.store(pindex, Ordering::Relaxed);
                rv.object
                    .store(object as *const VmObject as *mut VmObject, Ordering::Relaxed);
            }
            None => rv.object.store(ptr::null_mut(), Ordering::Relaxed),
        }
        rv.seq.write_end();
    }

    /// Increases the reservation's population count and moves it to the
    /// tail of the partially populated queue it belongs in.
    pub(crate) fn populate(&self, index: u32, guard: &StripeGuard<'_>, i: usize) {
        debug_assert!(guard.covers(index));
        let rv = self.rv(index);
        debug_assert!(!rv.is_free(), "populate: reserv {index} is free");
        debug_assert!(
            rv.popmap.is_clear(i),
            "populate: reserv {index} popmap[{i}] is set"
        );
        debug_assert!(
            rv.popcnt() < LEVEL_0_NPAGES,
            "populate: reserv {index} is already full"
        );
        let first = self.page(rv.first_paddr());
        debug_assert!(
            first.psind() == 0,
            "populate: reserv {index} is already promoted"
        );

        rv.popmap.set(i);
        let popcnt = rv.popcnt.load(Ordering::Relaxed) + 1;
        rv.popcnt.store(popcnt, Ordering::Relaxed);
        if popcnt as usize == LEVEL_0_NPAGES {
            first.set_psind(1);
        }
        self.update_lru(index, guard, RV_POP_STEP);
    }

    /// Reduces the reservation's population count. If the count becomes
    /// zero the reservation is destroyed and its pages are returned to the
    /// physical allocator; otherwise it moves to the tail of the partially
    /// populated queue it belongs in.
    pub(crate) fn depopulate(&self, index: u32, guard: &StripeGuard<'_>, i: usize) {
        debug_assert!(guard.covers(index));
        let rv = self.rv(index);
        debug_assert!(!rv.is_free(), "depopulate: reserv {index} is free");
        debug_assert!(
            rv.popmap.is_set(i),
            "depopulate: reserv {index} popmap[{i}] is clear"
        );
        let popcnt = rv.popcnt.load(Ordering::Relaxed);
        debug_assert!(popcnt > 0, "depopulate: reserv {index} popcnt is corrupted");

        rv.popmap.clear(i);
        if popcnt as usize == LEVEL_0_NPAGES {
            let first = self.page(rv.first_paddr());
            debug_assert!(
                first.psind() == 1 && !rv.flags().intersects(ReservFlags::PARTPOP),
                "depopulate: reserv {index} is already demoted"
            );
            first.set_psind(0);
        }
        rv.popcnt.store(popcnt - 1, Ordering::Relaxed);
        self.update_lru(index, guard, RV_DEPOP_STEP);
    }

    /// Applies the queue-state transition that follows a population
    /// change.
    fn update_lru(&self, index: u32, guard: &StripeGuard<'_>, advance: i8) {
        debug_assert!(guard.covers(index));
        let rv = self.rv(index);
        let popcnt = rv.popcnt();
        debug_assert_eq!(
            popcnt,
            rv.popmap.popcount(),
            "reserv {index} popcnt disagrees with its popmap"
        );
        if popcnt == LEVEL_0_NPAGES {
            let mut fq = self.queues.lock();
            self.lru_dequeue(&mut fq, index);
        } else if popcnt == 0 {
            let object = rv.object_ptr() as usize;
            self.set_object(index, guard, None);
            let mut fq = self.queues.lock();
            fq.objq_remove(object, index);
            self.lru_dequeue(&mut fq, index);
            self.phys.free_order(rv.first_paddr(), LEVEL_0_ORDER);
            drop(fq);
            self.freed.fetch_add(1, Ordering::Relaxed);
        } else if !rv.flags().contains(ReservFlags::ACTIVE) {
            rv.actcnt.store(RV_INIT, Ordering::Relaxed);
            let mut fq = self.queues.lock();
            if rv.flags().contains(ReservFlags::INACTIVE) {
                self.lru_dequeue(&mut fq, index);
            }
            fq.insert_tail(Lru::Active, index);
            rv.flags_insert(ReservFlags::ACTIVE);
        } else {
            let actcnt = rv.actcnt.load(Ordering::Relaxed);
            rv.actcnt
                .store(actcnt.saturating_add(advance).min(RV_ACT_MAX), Ordering::Relaxed);
        }
    }

    /// Removes the reservation from whichever partially populated queue it
    /// is on and clears its queue flags.
    pub(crate) fn lru_dequeue(&self, fq: &mut FreeQueues, index: u32) {
        let rv = self.rv(index);
        let flags = rv.flags();
        debug_assert!(
            flags.intersects(ReservFlags::PARTPOP)
                && !flags.contains(ReservFlags::PARTPOP),
            "reserv {index} not in a partpop queue"
        );
        debug_assert!(
            !flags.contains(ReservFlags::MARKER),
            "dequeuing the scan marker"
        );
        if flags.contains(ReservFlags::INACTIVE) {
            fq.remove(Lru::Inactive, index);
        } else {
            fq.remove(Lru::Active, index);
        }
        rv.flags_remove(ReservFlags::PARTPOP);
    }

    pub(crate) fn phys(&self) -> &'static dyn PhysAllocator {
        self.phys
    }

    /// Transfers the reservation underlying the given page from
    /// `old_object` to `new_object`, rebasing its offset by
    /// `old_offset`.
    ///
    /// The caller must hold `new_object`'s write lock.
    pub fn rename(
        &self,
        m: &VmPage,
        new_object: &VmObject,
        old_object: &VmObject,
        old_offset: Pindex,
    ) {
        let index = self.from_paddr(m.paddr());
        let rv = self.rv(index);
        if !rv.owned_by(old_object) {
            return;
        }
        let guard = self.lock_rv(index);
        if rv.owned_by(old_object) {
            {
                let mut fq = self.queues.lock();
                fq.objq_remove(old_object.addr(), index);
                fq.objq_insert(new_object.addr(), index);
            }
            let pindex = rv.pindex() - old_offset;
            self.set_object(index, &guard, Some((new_object, pindex)));
        }
        drop(guard);
    }

    /// Returns true if the given page belongs to a reservation and that
    /// page is free.
    pub fn is_page_free(&self, m: &VmPage) -> bool {
        let rv = self.reserv_from_page(m);
        if rv.is_free() {
            return false;
        }
        rv.popmap.is_clear(m.index_in_reserv())
    }

    /// If the given page belongs to a reservation, returns the level of
    /// that reservation; otherwise returns -1.
    pub fn level(&self, m: &VmPage) -> i32 {
        if self.reserv_from_page(m).is_free() {
            -1
        } else {
            0
        }
    }

    /// Returns a reservation level if the given page belongs to a fully
    /// populated reservation and -1 otherwise.
    pub fn level_iffullpop(&self, m: &VmPage) -> i32 {
        if self.reserv_from_page(m).popcnt() == LEVEL_0_NPAGES {
            0
        } else {
            -1
        }
    }

    /// Returns the size, in bytes, of a reservation of the given level.
    pub fn size(level: i32) -> usize {
        match level {
            0 => LEVEL_0_SIZE,
            -1 => PAGE_SIZE,
            _ => 0,
        }
    }
}
