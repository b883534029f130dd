// SPDX-License-Identifier: MPL-2.0

//! Base page records.

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::{Paddr, Pindex, PAGE_SHIFT};

/// The record of one base page of physical memory.
///
/// The reservation manager keeps one record per base page frame, densely
/// indexed by frame number. A record's physical address is immutable; the
/// object offset is maintained by the pager when it binds the page to a
/// memory object, and the superpage-size hint is maintained by the manager
/// for the pmap to read.
pub struct VmPage {
    paddr: Paddr,
    pindex: AtomicUsize,
    psind: AtomicU8,
}

impl VmPage {
    pub(crate) fn new(paddr: Paddr) -> Self {
        Self {
            paddr,
            pindex: AtomicUsize::new(0),
            psind: AtomicU8::new(0),
        }
    }

    /// Returns the physical address of the page.
    pub fn paddr(&self) -> Paddr {
        self.paddr
    }

    /// Returns the page's offset within its memory object.
    ///
    /// Meaningful only while the page is resident in an object.
    pub fn pindex(&self) -> Pindex {
        self.pindex.load(Ordering::Relaxed)
    }

    pub(crate) fn set_pindex(&self, pindex: Pindex) {
        self.pindex.store(pindex, Ordering::Relaxed);
    }

    /// Returns the superpage-size hint: 1 if this page starts a fully
    /// populated reservation that the pmap may map as a superpage, 0
    /// otherwise.
    pub fn psind(&self) -> u8 {
        self.psind.load(Ordering::Relaxed)
    }

    pub(crate) fn set_psind(&self, psind: u8) {
        self.psind.store(psind, Ordering::Relaxed);
    }

    /// Returns the page's offset, in pages, within the superpage that
    /// contains it.
    pub(crate) fn index_in_reserv(&self) -> usize {
        (self.paddr >> PAGE_SHIFT) & (crate::LEVEL_0_NPAGES - 1)
    }
}
