// SPDX-License-Identifier: MPL-2.0

//! The prelude.

pub use crate::{
    object::{ObjectInner, ObjectKind, VmObject},
    page::VmPage,
    phys::PhysAllocator,
    reserv::ReservManager,
    Paddr, Pindex, LEVEL_0_NPAGES, LEVEL_0_ORDER, LEVEL_0_SHIFT, LEVEL_0_SIZE, PAGE_SHIFT,
    PAGE_SIZE,
};

pub(crate) use alloc::{boxed::Box, vec::Vec};
