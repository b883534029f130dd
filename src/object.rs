// SPDX-License-Identifier: MPL-2.0

//! The memory object contract.
//!
//! A memory object is a page-cache-like container mapping offsets
//! ("pindexes") to base pages. The reservation manager consults only a
//! narrow slice of it: the object's size, whether it is (or is backed by)
//! a vnode, its color, and the resident-page map ordered by pindex from
//! which neighbor pages are derived. The object's write lock is the
//! reference serialization point for this metadata; callers of the
//! allocation entry points pass their write guard's view in as a witness.

use alloc::{collections::BTreeMap, sync::Arc};

use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{page::VmPage, Paddr, Pindex, LEVEL_0_NPAGES};

/// What backs a memory object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    /// Anonymous memory; the object may grow, so speculation past its
    /// current size is acceptable.
    Anonymous,
    /// A filesystem vnode; speculation past end-of-object is suppressed.
    Vnode,
}

/// A memory object.
pub struct VmObject {
    kind: ObjectKind,
    color: usize,
    backing: Option<Arc<VmObject>>,
    inner: RwLock<ObjectInner>,
}

impl VmObject {
    /// Creates an object of `size` pages.
    pub fn new(kind: ObjectKind, size: Pindex) -> Self {
        Self::with_color(kind, size, 0)
    }

    /// Creates an object of `size` pages whose first page prefers the
    /// given offset, in pages, within a superpage.
    pub fn with_color(kind: ObjectKind, size: Pindex, color: usize) -> Self {
        debug_assert!(color < LEVEL_0_NPAGES);
        Self {
            kind,
            color,
            backing: None,
            inner: RwLock::new(ObjectInner {
                size,
                resident: BTreeMap::new(),
            }),
        }
    }

    /// Creates a shadow of `backing`, of `size` pages.
    pub fn with_backing(kind: ObjectKind, size: Pindex, backing: Arc<VmObject>) -> Self {
        Self {
            backing: Some(backing),
            ..Self::new(kind, size)
        }
    }

    /// Returns what backs this object.
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Returns the object's color: the preferred offset, in pages, of its
    /// first page within a superpage.
    pub fn color(&self) -> usize {
        self.color
    }

    /// Acquires the object's write lock.
    pub fn write(&self) -> RwLockWriteGuard<'_, ObjectInner> {
        self.inner.write()
    }

    /// Acquires the object's read lock.
    pub fn read(&self) -> RwLockReadGuard<'_, ObjectInner> {
        self.inner.read()
    }

    /// Is this object a vnode, or backed by one?
    pub(crate) fn is_vnode_backed(&self) -> bool {
        self.kind == ObjectKind::Vnode
            || self
                .backing
                .as_ref()
                .is_some_and(|backing| backing.kind == ObjectKind::Vnode)
    }

    /// Computes the index of the base page underlying `(self, pindex)`
    /// within its reservation's run of base pages.
    pub(crate) fn reserv_index(&self, pindex: Pindex) -> usize {
        (self.color + pindex) & (LEVEL_0_NPAGES - 1)
    }

    /// The object's address, used as its identity.
    pub(crate) fn addr(&self) -> usize {
        self as *const VmObject as usize
    }
}

/// The write-locked view of a memory object.
pub struct ObjectInner {
    size: Pindex,
    resident: BTreeMap<Pindex, Paddr>,
}

impl ObjectInner {
    /// Returns the object's size in pages.
    pub fn size(&self) -> Pindex {
        self.size
    }

    /// Grows or shrinks the object to `size` pages.
    pub fn set_size(&mut self, size: Pindex) {
        self.size = size;
    }

    /// Binds `page` to offset `pindex` of this object.
    pub fn insert(&mut self, pindex: Pindex, page: &VmPage) {
        page.set_pindex(pindex);
        let prev = self.resident.insert(pindex, page.paddr());
        debug_assert!(prev.is_none(), "offset {pindex} already resident");
    }

    /// Unbinds the page at offset `pindex`, returning its physical
    /// address.
    pub fn remove(&mut self, pindex: Pindex) -> Option<Paddr> {
        self.resident.remove(&pindex)
    }

    /// Returns the physical address of the page at offset `pindex`.
    pub fn get(&self, pindex: Pindex) -> Option<Paddr> {
        self.resident.get(&pindex).copied()
    }

    /// Returns the greatest resident page strictly below `pindex`.
    pub fn pred_of(&self, pindex: Pindex) -> Option<Paddr> {
        self.resident
            .range(..pindex)
            .next_back()
            .map(|(_, &paddr)| paddr)
    }

    /// Returns the least resident page strictly above `pindex`.
    pub(crate) fn succ_of(&self, pindex: Pindex) -> Option<(Pindex, Paddr)> {
        self.resident
            .range(pindex + 1..)
            .next()
            .map(|(&pindex, &paddr)| (pindex, paddr))
    }

    /// Returns the first resident page of the object.
    pub(crate) fn first_resident(&self) -> Option<(Pindex, Paddr)> {
        self.resident
            .iter()
            .next()
            .map(|(&pindex, &paddr)| (pindex, paddr))
    }
}
