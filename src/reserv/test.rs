// SPDX-License-Identifier: MPL-2.0

use alloc::sync::Arc;
use std::vec::Vec;

use align_ext::AlignExt;
use spin::mutex::SpinMutex;

use super::alloc::crosses_boundary;
use crate::{
    object::{ObjectKind, VmObject},
    page::VmPage,
    phys::PhysAllocator,
    prelude::*,
};

/// 16 MiB of physical memory: eight superpages.
const TEST_PAGES: usize = 4096;

/// A first-fit physical allocator over one flat segment, standing in for
/// the external allocator.
struct TestPhys {
    inner: SpinMutex<TestPhysInner>,
}

struct TestPhysInner {
    free: Vec<bool>,
    freed_runs: Vec<(Paddr, usize)>,
}

impl TestPhys {
    fn new(npages: usize) -> Self {
        Self {
            inner: SpinMutex::new(TestPhysInner {
                free: vec![true; npages],
                freed_runs: Vec::new(),
            }),
        }
    }

    fn free_count(&self) -> usize {
        self.inner.lock().free.iter().filter(|&&f| f).count()
    }

    fn take_freed_runs(&self) -> Vec<(Paddr, usize)> {
        core::mem::take(&mut self.inner.lock().freed_runs)
    }

    fn mark_allocated(inner: &mut TestPhysInner, frame: usize, npages: usize) {
        for f in frame..frame + npages {
            assert!(inner.free[f], "frame {f} allocated twice");
            inner.free[f] = false;
        }
    }

    fn mark_free(inner: &mut TestPhysInner, paddr: Paddr, npages: usize) {
        let frame = paddr >> PAGE_SHIFT;
        for f in frame..frame + npages {
            assert!(!inner.free[f], "frame {f} freed twice");
            inner.free[f] = true;
        }
    }
}

impl PhysAllocator for TestPhys {
    fn alloc_order(&self, order: usize) -> Option<Paddr> {
        let npages = 1 << order;
        let mut inner = self.inner.lock();
        let mut frame = 0;
        while frame + npages <= inner.free.len() {
            if inner.free[frame..frame + npages].iter().all(|&f| f) {
                Self::mark_allocated(&mut inner, frame, npages);
                return Some(frame << PAGE_SHIFT);
            }
            frame += npages;
        }
        None
    }

    fn alloc_contig(
        &self,
        npages: usize,
        low: Paddr,
        high: Paddr,
        alignment: usize,
        boundary: Paddr,
    ) -> Option<Paddr> {
        let mut inner = self.inner.lock();
        let total = inner.free.len() << PAGE_SHIFT;
        let align = alignment.max(PAGE_SIZE);
        let size = npages << PAGE_SHIFT;
        let mut pa = low.align_up(align);
        while pa + size <= high.min(total) {
            if boundary != 0 && crosses_boundary(pa, size, boundary) {
                pa += align;
                continue;
            }
            let frame = pa >> PAGE_SHIFT;
            if inner.free[frame..frame + npages].iter().all(|&f| f) {
                Self::mark_allocated(&mut inner, frame, npages);
                return Some(pa);
            }
            pa += align;
        }
        None
    }

    fn free_order(&self, paddr: Paddr, order: usize) {
        let mut inner = self.inner.lock();
        Self::mark_free(&mut inner, paddr, 1 << order);
    }

    fn free_contig(&self, paddr: Paddr, npages: usize) {
        let mut inner = self.inner.lock();
        Self::mark_free(&mut inner, paddr, npages);
        inner.freed_runs.push((paddr, npages));
    }
}

fn setup() -> (&'static TestPhys, ReservManager) {
    let phys = &*Box::leak(Box::new(TestPhys::new(TEST_PAGES)));
    let mut mgr = ReservManager::startup(TEST_PAGES * PAGE_SIZE, phys);
    mgr.init(&[0..TEST_PAGES * PAGE_SIZE]);
    (phys, mgr)
}

/// The pager side of an allocation: look up the predecessor, allocate, and
/// make the page resident.
fn alloc_into<'a>(mgr: &'a ReservManager, obj: &VmObject, pindex: Pindex) -> Option<&'a VmPage> {
    let mut inner = obj.write();
    let mpred = inner.pred_of(pindex).map(|paddr| mgr.page(paddr));
    let m = mgr.alloc_page(obj, &mut inner, pindex, mpred)?;
    inner.insert(pindex, m);
    Some(m)
}

fn alloc_contig_into<'a>(
    mgr: &'a ReservManager,
    obj: &VmObject,
    pindex: Pindex,
    npages: usize,
    alignment: usize,
    boundary: Paddr,
) -> Option<&'a VmPage> {
    let mut inner = obj.write();
    let mpred = inner.pred_of(pindex).map(|paddr| mgr.page(paddr));
    let m = mgr.alloc_contig(
        obj,
        &mut inner,
        pindex,
        npages,
        0,
        usize::MAX,
        alignment,
        boundary,
        mpred,
    )?;
    let base = m.paddr();
    for k in 0..npages {
        inner.insert(pindex + k, mgr.page(base + (k << PAGE_SHIFT)));
    }
    Some(m)
}

/// The pager side of a free: unbind the page, then route it through the
/// manager or, if no reservation claims it, back to the allocator.
fn free_from(mgr: &ReservManager, phys: &TestPhys, obj: &VmObject, pindex: Pindex) {
    let mut inner = obj.write();
    let paddr = inner.remove(pindex).expect("page not resident");
    if !mgr.free_page(mgr.page(paddr)) {
        phys.free_order(paddr, 0);
    }
}

/// Frees every resident page of the object.
fn drain(mgr: &ReservManager, phys: &TestPhys, obj: &VmObject) {
    loop {
        // Take the residency snapshot in its own statement so the read
        // guard is released before freeing.
        let next = obj.read().first_resident();
        match next {
            Some((pindex, _)) => free_from(mgr, phys, obj, pindex),
            None => break,
        }
    }
}

#[test]
fn single_page_in_fresh_reservation() {
    let (phys, mgr) = setup();
    let obj = VmObject::new(ObjectKind::Anonymous, 4096);

    let m = alloc_into(&mgr, &obj, 0).unwrap();
    assert_eq!(m.paddr(), 0);

    let rv = mgr.reserv_from_page(m);
    assert_eq!(rv.popcnt(), 1);
    assert!(rv.flags().contains(super::ReservFlags::ACTIVE));
    assert_eq!(mgr.partpop_stats().active.count, 1);
    assert_eq!(mgr.level(m), 0);
    assert!(!mgr.is_page_free(m));
    assert!(mgr.is_page_free(mgr.page(PAGE_SIZE)));
    assert_eq!(phys.free_count(), TEST_PAGES - LEVEL_0_NPAGES);

    drain(&mgr, phys, &obj);
    assert_eq!(phys.free_count(), TEST_PAGES);
    assert_eq!(mgr.freed(), 1);
}

#[test]
fn fill_then_drain() {
    let (phys, mgr) = setup();
    let obj = VmObject::new(ObjectKind::Anonymous, 4096);

    for pindex in 0..LEVEL_0_NPAGES {
        assert!(alloc_into(&mgr, &obj, pindex).is_some());
    }
    let first = mgr.page(0);
    assert_eq!(mgr.level_iffullpop(first), 0);
    assert_eq!(first.psind(), 1);
    assert_eq!(mgr.fullpop(), 1);
    let stats = mgr.partpop_stats();
    assert_eq!((stats.active.count, stats.inactive.count), (0, 0));

    free_from(&mgr, phys, &obj, LEVEL_0_NPAGES - 1);
    assert_eq!(first.psind(), 0);
    assert_eq!(mgr.level_iffullpop(first), -1);
    let rv = mgr.reserv_from_page(first);
    assert_eq!(rv.popcnt(), LEVEL_0_NPAGES - 1);
    assert!(rv.flags().contains(super::ReservFlags::ACTIVE));
    assert_eq!(mgr.partpop_stats().active.count, 1);

    drain(&mgr, phys, &obj);
    assert_eq!(phys.free_count(), TEST_PAGES);
    assert_eq!(mgr.fullpop(), 0);
    assert_eq!(mgr.level(first), -1);
}

#[test]
fn rename_rebinds_reservation() {
    let (phys, mgr) = setup();
    let o1 = VmObject::new(ObjectKind::Anonymous, 4096);
    let o2 = VmObject::new(ObjectKind::Anonymous, 4096);

    let m = alloc_into(&mgr, &o1, 0).unwrap();
    let base = m.paddr();

    // The pager moves the page, then the reservation follows it.
    let _ = o1.write().remove(0);
    o2.write().insert(0, m);
    mgr.rename(m, &o2, &o1, 0);

    let rv = mgr.reserv_from_page(m);
    assert!(rv.owned_by(&o2));
    assert!(!rv.owned_by(&o1));

    // An allocation in the same superpage window of the new object lands
    // in the same reservation.
    let m2 = alloc_into(&mgr, &o2, 1).unwrap();
    assert_eq!(m2.paddr(), base + PAGE_SIZE);
    assert_eq!(rv.popcnt(), 2);

    // The old object no longer owns the window; a fresh allocation gets a
    // new reservation.
    let m3 = alloc_into(&mgr, &o1, 1).unwrap();
    assert_ne!(m3.paddr() >> LEVEL_0_SHIFT, base >> LEVEL_0_SHIFT);

    drain(&mgr, phys, &o1);
    drain(&mgr, phys, &o2);
    assert_eq!(phys.free_count(), TEST_PAGES);
}

#[test]
fn rename_with_offset_rebases_pindex() {
    let (phys, mgr) = setup();
    let o1 = VmObject::new(ObjectKind::Anonymous, 4096);
    let o2 = VmObject::new(ObjectKind::Anonymous, 4096);

    let m = alloc_into(&mgr, &o1, LEVEL_0_NPAGES + 3).unwrap();
    let _ = o1.write().remove(LEVEL_0_NPAGES + 3);
    o2.write().insert(3, m);
    mgr.rename(m, &o2, &o1, LEVEL_0_NPAGES);

    // The reservation now covers window [0, N) of the new object.
    let m2 = alloc_into(&mgr, &o2, 0).unwrap();
    assert_eq!(
        m2.paddr() >> LEVEL_0_SHIFT,
        m.paddr() >> LEVEL_0_SHIFT
    );

    drain(&mgr, phys, &o2);
    assert_eq!(phys.free_count(), TEST_PAGES);
}

#[test]
fn break_with_kept_page_frees_maximal_runs() {
    let (phys, mgr) = setup();
    let obj = VmObject::new(ObjectKind::Anonymous, 4096);

    // Populate index 2 only; keep the (free) page at index 0 out of the
    // sweep. The allocator must receive two runs, not N - 2 single pages.
    let m = alloc_into(&mgr, &obj, 2).unwrap();
    let rv_index = mgr.from_paddr(m.paddr());
    let base = m.paddr() - 2 * PAGE_SIZE;
    let kept = mgr.page(base);
    phys.take_freed_runs();

    let guard = mgr.lock_rv(rv_index);
    {
        let mut fq = mgr.queues.lock();
        mgr.lru_dequeue(&mut fq, rv_index);
        mgr.break_rv(&mut fq, &guard, rv_index, Some(kept));
    }
    drop(guard);

    assert_eq!(
        phys.take_freed_runs(),
        vec![
            (base + PAGE_SIZE, 1),
            (base + 3 * PAGE_SIZE, LEVEL_0_NPAGES - 3)
        ]
    );
    assert_eq!(mgr.broken(), 1);
    let rv = mgr.rv(rv_index);
    assert!(rv.is_free());
    assert_eq!(rv.popcnt(), 0);

    // The kept page and the populated page are still allocated.
    assert_eq!(phys.free_count(), TEST_PAGES - 2);
    phys.free_order(base, 0);
    let _ = obj.write().remove(2);
    phys.free_order(m.paddr(), 0);
    assert_eq!(phys.free_count(), TEST_PAGES);
}

#[test]
fn contig_across_two_reservations() {
    let (phys, mgr) = setup();
    let obj = VmObject::new(ObjectKind::Anonymous, 4096);

    let npages = LEVEL_0_NPAGES + 4;
    let m = alloc_contig_into(&mgr, &obj, 0, npages, LEVEL_0_SIZE, 0).unwrap();
    let base = m.paddr();
    assert_eq!(base % LEVEL_0_SIZE, 0);

    // Two reservations were initialized: the first full, the second
    // holding the 4-page suffix. The allocator handed out a rounded-up
    // run of 2N pages.
    assert_eq!(mgr.level_iffullpop(m), 0);
    let rv2 = mgr.reserv_from_page(mgr.page(base + LEVEL_0_SIZE));
    assert_eq!(rv2.popcnt(), 4);
    assert!(rv2.owned_by(&obj));
    assert_eq!(phys.free_count(), TEST_PAGES - 2 * LEVEL_0_NPAGES);
    assert_eq!(mgr.fullpop(), 1);
    assert_eq!(mgr.partpop_stats().active.count, 1);

    drain(&mgr, phys, &obj);
    assert_eq!(phys.free_count(), TEST_PAGES);
}

#[test]
fn contig_lands_in_existing_reservation() {
    let (phys, mgr) = setup();
    let obj = VmObject::new(ObjectKind::Anonymous, 4096);

    let m0 = alloc_into(&mgr, &obj, 0).unwrap();
    let m = alloc_contig_into(&mgr, &obj, 4, 8, PAGE_SIZE, 0).unwrap();
    assert_eq!(m.paddr(), m0.paddr() + 4 * PAGE_SIZE);
    assert_eq!(mgr.reserv_from_page(m0).popcnt(), 9);

    // A run overlapping the populated offset 4 is refused.
    let mut inner = obj.write();
    let mpred = inner.pred_of(3).map(|paddr| mgr.page(paddr));
    assert!(mgr
        .alloc_contig(&obj, &mut inner, 3, 4, 0, usize::MAX, PAGE_SIZE, 0, mpred)
        .is_none());
    drop(inner);

    drain(&mgr, phys, &obj);
    assert_eq!(phys.free_count(), TEST_PAGES);
}

#[test]
fn contig_alignment_and_boundary() {
    let (phys, mgr) = setup();
    let obj = VmObject::new(ObjectKind::Anonymous, 4096);

    // Provably unsatisfiable: offset 1 within a reservation can never be
    // 8 KiB aligned.
    {
        let mut inner = obj.write();
        assert!(mgr
            .alloc_contig(&obj, &mut inner, 1, 2, 0, usize::MAX, 2 * PAGE_SIZE, 0, None)
            .is_none());
    }
    assert_eq!(phys.free_count(), TEST_PAGES);

    let alignment = 16 * PAGE_SIZE;
    let boundary = 64 * PAGE_SIZE;
    let npages = 16;
    let m = alloc_contig_into(&mgr, &obj, 16, npages, alignment, boundary).unwrap();
    let pa = m.paddr();
    let size = npages * PAGE_SIZE;
    assert_eq!(pa % alignment, 0);
    assert_eq!((pa ^ (pa + size - 1)) & !(boundary - 1), 0);

    drain(&mgr, phys, &obj);
    assert_eq!(phys.free_count(), TEST_PAGES);
}

#[test]
fn vnode_refusal_past_end_of_object() {
    let (phys, mgr) = setup();

    // A small vnode: a reservation would extend past its end.
    let vnode = VmObject::new(ObjectKind::Vnode, 100);
    assert!(alloc_into(&mgr, &vnode, 0).is_none());

    // Backed by a vnode: refused as well.
    let shadow = VmObject::with_backing(
        ObjectKind::Anonymous,
        100,
        Arc::new(VmObject::new(ObjectKind::Vnode, 100)),
    );
    assert!(alloc_into(&mgr, &shadow, 0).is_none());

    // Anonymous memory of the same size speculates that the object may
    // grow.
    let anon = VmObject::new(ObjectKind::Anonymous, 100);
    assert!(alloc_into(&mgr, &anon, 0).is_some());

    // A vnode large enough for the whole window is fine.
    let big = VmObject::new(ObjectKind::Vnode, 4096);
    assert!(alloc_into(&mgr, &big, 0).is_some());

    drain(&mgr, phys, &anon);
    drain(&mgr, phys, &big);
    assert_eq!(phys.free_count(), TEST_PAGES);
}

#[test]
fn object_color_offsets_window() {
    let (phys, mgr) = setup();
    let obj = VmObject::with_color(ObjectKind::Anonymous, 4096, 4);

    // With color 4, offset 0 would lie below its reservation's floor.
    assert!(alloc_into(&mgr, &obj, 0).is_none());

    // The first aligned window starts where the color wraps.
    let pindex = LEVEL_0_NPAGES - 4;
    let m = alloc_into(&mgr, &obj, pindex).unwrap();
    assert_eq!(m.index_in_reserv(), 0);

    drain(&mgr, phys, &obj);
    assert_eq!(phys.free_count(), TEST_PAGES);
}

#[test]
fn scan_ages_and_reclaim_breaks() {
    let (phys, mgr) = setup();
    let obj = VmObject::new(ObjectKind::Anonymous, 4096);

    let m = alloc_into(&mgr, &obj, 0).unwrap();
    assert_eq!(mgr.partpop_stats().active.count, 1);

    // A fresh partially populated reservation enters active with a small
    // activation count and ages out after two sweeps.
    mgr.scan(16);
    assert_eq!(mgr.partpop_stats().active.count, 1);
    mgr.scan(16);
    let stats = mgr.partpop_stats();
    assert_eq!((stats.active.count, stats.inactive.count), (0, 1));

    phys.take_freed_runs();
    assert!(mgr.reclaim_inactive());
    assert_eq!(mgr.reclaimed(), 1);
    assert_eq!(mgr.broken(), 1);
    assert_eq!(
        phys.take_freed_runs(),
        vec![(PAGE_SIZE, LEVEL_0_NPAGES - 1)]
    );
    assert_eq!(mgr.level(m), -1);

    // Both queues empty now.
    assert!(!mgr.reclaim_inactive());

    drain(&mgr, phys, &obj);
    assert_eq!(phys.free_count(), TEST_PAGES);
}

#[test]
fn ager_liveness_under_saturated_actcnt() {
    let (phys, mgr) = setup();
    let obj = VmObject::new(ObjectKind::Anonymous, 4096);

    alloc_into(&mgr, &obj, 0).unwrap();
    // Drive the activation count to its ceiling with populate/depopulate
    // churn.
    for _ in 0..40 {
        alloc_into(&mgr, &obj, 1).unwrap();
        free_from(&mgr, phys, &obj, 1);
    }
    let rv = mgr.reserv_from_page(mgr.page(0));
    assert_eq!(rv.actcnt(), super::RV_ACT_MAX);

    // ceil(ACT_MAX / DEC) sweeps demote it, and no fewer.
    let sweeps = super::RV_ACT_MAX as usize / super::RV_DEC as usize;
    for _ in 0..sweeps - 1 {
        mgr.scan(16);
    }
    assert_eq!(mgr.partpop_stats().inactive.count, 0);
    mgr.scan(16);
    assert_eq!(mgr.partpop_stats().inactive.count, 1);

    drain(&mgr, phys, &obj);
    assert_eq!(phys.free_count(), TEST_PAGES);
}

#[test]
fn reclaim_contig_honors_constraints() {
    let (phys, mgr) = setup();
    let obj = VmObject::new(ObjectKind::Anonymous, 4096);

    // Build a reservation populated at both ends with a 254-page hole,
    // then age it into the inactive queue.
    alloc_into(&mgr, &obj, 0).unwrap();
    alloc_into(&mgr, &obj, 1).unwrap();
    alloc_into(&mgr, &obj, 256).unwrap();
    for _ in 0..4 {
        mgr.scan(16);
    }
    assert_eq!(mgr.partpop_stats().inactive.count, 1);

    // No run of 300 free pages exists below the populated tail.
    assert!(!mgr.reclaim_contig(300, 0, PAGE_SIZE * 256, PAGE_SIZE, 0));
    // A 128-page run aligned to 128 pages does: bits [128, 256).
    assert!(mgr.reclaim_contig(128, 0, usize::MAX, 128 * PAGE_SIZE, 0));
    assert_eq!(mgr.reclaimed(), 1);

    drain(&mgr, phys, &obj);
    assert_eq!(phys.free_count(), TEST_PAGES);
}

#[test]
fn break_all_destroys_every_reservation() {
    let (phys, mgr) = setup();
    let o1 = VmObject::new(ObjectKind::Anonymous, 4096);
    let o2 = VmObject::new(ObjectKind::Anonymous, 4096);

    for pindex in [0, 1, 100, LEVEL_0_NPAGES, LEVEL_0_NPAGES + 7] {
        alloc_into(&mgr, &o1, pindex).unwrap();
    }
    alloc_into(&mgr, &o2, 0).unwrap();

    mgr.break_all(&o1);
    assert_eq!(mgr.broken(), 2);
    let stats = mgr.partpop_stats();
    assert_eq!((stats.active.count, stats.inactive.count), (1, 0));

    // o1's pages survive the break and drain straight to the allocator.
    drain(&mgr, phys, &o1);
    drain(&mgr, phys, &o2);
    mgr.break_all(&o2);
    assert_eq!(phys.free_count(), TEST_PAGES);
}

#[test]
fn mixed_workload_conserves_pages() {
    let (phys, mgr) = setup();
    let o1 = VmObject::new(ObjectKind::Anonymous, 4096);
    let o2 = VmObject::new(ObjectKind::Anonymous, 4096);

    for pindex in [0, 1, 2, 3, 100, 511, 512, 513] {
        alloc_into(&mgr, &o1, pindex).unwrap();
    }
    alloc_contig_into(&mgr, &o1, 1024, LEVEL_0_NPAGES + 4, LEVEL_0_SIZE, 0).unwrap();
    for pindex in [5, 6, 7] {
        alloc_into(&mgr, &o2, pindex).unwrap();
    }
    assert_eq!(mgr.fullpop(), 1);

    free_from(&mgr, phys, &o1, 2);
    free_from(&mgr, phys, &o1, 100);
    free_from(&mgr, phys, &o2, 6);

    mgr.scan(16);
    mgr.scan(16);
    while mgr.reclaim_inactive() {}

    mgr.break_all(&o1);
    drain(&mgr, phys, &o1);
    drain(&mgr, phys, &o2);
    mgr.break_all(&o2);

    assert_eq!(phys.free_count(), TEST_PAGES);
    assert_eq!(mgr.fullpop(), 0);
    let stats = mgr.partpop_stats();
    assert_eq!((stats.active.count, stats.inactive.count), (0, 0));
    for superpage in 0..TEST_PAGES / LEVEL_0_NPAGES {
        assert_eq!(mgr.level(mgr.page(superpage * LEVEL_0_SIZE)), -1);
    }
}

#[test]
fn reservation_exhaustion_returns_none() {
    let (phys, mgr) = setup();
    let obj = VmObject::new(ObjectKind::Anonymous, usize::MAX / 2);

    // Eight superpages back the test segment; a ninth window cannot get a
    // fresh run.
    for window in 0..TEST_PAGES / LEVEL_0_NPAGES {
        assert!(alloc_into(&mgr, &obj, window * LEVEL_0_NPAGES).is_some());
    }
    assert!(alloc_into(&mgr, &obj, TEST_PAGES).is_none());

    mgr.break_all(&obj);
    drain(&mgr, phys, &obj);
    assert_eq!(phys.free_count(), TEST_PAGES);
}

#[test]
fn reserv_size_per_level() {
    assert_eq!(ReservManager::size(0), LEVEL_0_SIZE);
    assert_eq!(ReservManager::size(-1), PAGE_SIZE);
    assert_eq!(ReservManager::size(1), 0);
}

#[test]
fn concurrent_churn_conserves_pages() {
    let (phys, mgr) = setup();
    let objects: Vec<VmObject> = (0..4)
        .map(|_| VmObject::new(ObjectKind::Anonymous, 4096))
        .collect();

    std::thread::scope(|s| {
        let mgr = &mgr;
        for obj in &objects {
            s.spawn(move || {
                for _ in 0..40 {
                    for pindex in 0..32 {
                        // Reclaim may race a window away mid-loop; the
                        // next allocation simply reserves again.
                        let _ = alloc_into(mgr, obj, pindex);
                    }
                    for pindex in 0..32 {
                        if obj.read().get(pindex).is_some() {
                            free_from(mgr, phys, obj, pindex);
                        }
                    }
                }
            });
        }
        s.spawn(move || {
            for _ in 0..200 {
                mgr.scan(4);
                mgr.fullpop();
                mgr.partpop_stats();
            }
        });
        s.spawn(move || {
            for _ in 0..100 {
                mgr.reclaim_inactive();
            }
        });
    });

    for obj in &objects {
        drain(&mgr, phys, obj);
        mgr.break_all(obj);
    }
    assert_eq!(phys.free_count(), TEST_PAGES);
    let stats = mgr.partpop_stats();
    assert_eq!((stats.active.count, stats.inactive.count), (0, 0));
}
