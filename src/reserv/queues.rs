// SPDX-License-Identifier: MPL-2.0

//! State owned by the free-queues lock.
//!
//! The two partially-populated LRU queues, the per-object reservation
//! sets, and every reservation's queue link cells live behind a single
//! mutex, the manager's rendition of the free page queue lock. Holding its
//! guard is the capability required to mutate LRU membership or object
//! linkage.
//!
//! The queues are doubly linked lists over reservation table indices with
//! the link cells stored here, indexed like the table; this keeps dequeue
//! from the middle and insert-before-the-clock-hand O(1) without placing
//! aliased link fields inside the shared reservation records.

use alloc::collections::{BTreeMap, BTreeSet};

use crate::prelude::*;

/// The null link.
pub(crate) const NIL: u32 = u32::MAX;

/// Which partially-populated LRU queue.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Lru {
    Active,
    Inactive,
}

#[derive(Clone, Copy)]
struct Link {
    prev: u32,
    next: u32,
}

#[derive(Clone, Copy)]
struct ListHead {
    head: u32,
    tail: u32,
}

impl ListHead {
    const fn empty() -> Self {
        Self {
            head: NIL,
            tail: NIL,
        }
    }
}

/// Everything the free-queues lock protects.
pub(crate) struct FreeQueues {
    links: Box<[Link]>,
    active: ListHead,
    inactive: ListHead,
    /// Per-object reservation sets, keyed by object address.
    objq: BTreeMap<usize, BTreeSet<u32>>,
}

impl FreeQueues {
    pub(crate) fn new(entries: usize) -> Self {
        let links = (0..entries)
            .map(|_| Link {
                prev: NIL,
                next: NIL,
            })
            .collect();
        Self {
            links,
            active: ListHead::empty(),
            inactive: ListHead::empty(),
            objq: BTreeMap::new(),
        }
    }

    fn list(&mut self, lru: Lru) -> &mut ListHead {
        match lru {
            Lru::Active => &mut self.active,
            Lru::Inactive => &mut self.inactive,
        }
    }

    /// Returns the head of the given queue, or [`NIL`].
    pub(crate) fn head(&self, lru: Lru) -> u32 {
        match lru {
            Lru::Active => self.active.head,
            Lru::Inactive => self.inactive.head,
        }
    }

    /// Returns the entry after `index` in its queue, or [`NIL`].
    pub(crate) fn next(&self, index: u32) -> u32 {
        self.links[index as usize].next
    }

    /// Inserts `index` at the head of the queue.
    pub(crate) fn insert_head(&mut self, lru: Lru, index: u32) {
        let head = self.list(lru).head;
        self.links[index as usize] = Link {
            prev: NIL,
            next: head,
        };
        if head != NIL {
            self.links[head as usize].prev = index;
        } else {
            self.list(lru).tail = index;
        }
        self.list(lru).head = index;
    }

    /// Inserts `index` at the tail (most recent end) of the queue.
    pub(crate) fn insert_tail(&mut self, lru: Lru, index: u32) {
        let tail = self.list(lru).tail;
        self.links[index as usize] = Link {
            prev: tail,
            next: NIL,
        };
        if tail != NIL {
            self.links[tail as usize].next = index;
        } else {
            self.list(lru).head = index;
        }
        self.list(lru).tail = index;
    }

    /// Inserts `index` immediately before `at`, which must be queued.
    pub(crate) fn insert_before(&mut self, lru: Lru, at: u32, index: u32) {
        let prev = self.links[at as usize].prev;
        self.links[index as usize] = Link { prev, next: at };
        self.links[at as usize].prev = index;
        if prev != NIL {
            self.links[prev as usize].next = index;
        } else {
            self.list(lru).head = index;
        }
    }

    /// Removes `index` from the queue.
    pub(crate) fn remove(&mut self, lru: Lru, index: u32) {
        let Link { prev, next } = self.links[index as usize];
        if prev != NIL {
            self.links[prev as usize].next = next;
        } else {
            debug_assert_eq!(self.list(lru).head, index);
            self.list(lru).head = next;
        }
        if next != NIL {
            self.links[next as usize].prev = prev;
        } else {
            debug_assert_eq!(self.list(lru).tail, index);
            self.list(lru).tail = prev;
        }
        self.links[index as usize] = Link {
            prev: NIL,
            next: NIL,
        };
    }

    /// Adds `index` to the reservation set of the object at `object`.
    pub(crate) fn objq_insert(&mut self, object: usize, index: u32) {
        let inserted = self.objq.entry(object).or_default().insert(index);
        debug_assert!(inserted, "reserv {index} already linked");
    }

    /// Removes `index` from the reservation set of the object at
    /// `object`.
    pub(crate) fn objq_remove(&mut self, object: usize, index: u32) {
        let set = self
            .objq
            .get_mut(&object)
            .unwrap_or_else(|| panic!("reserv {index} not linked to any object"));
        let removed = set.remove(&index);
        debug_assert!(removed, "reserv {index} not linked to its object");
        if set.is_empty() {
            self.objq.remove(&object);
        }
    }

    /// Returns some reservation of the object at `object`, or `None` if
    /// it has none.
    pub(crate) fn objq_first(&self, object: usize) -> Option<u32> {
        self.objq
            .get(&object)
            .and_then(|set| set.first().copied())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut fq = FreeQueues::new(8);
        for index in [3, 1, 4] {
            fq.insert_tail(Lru::Active, index);
        }
        assert_eq!(fq.head(Lru::Active), 3);
        assert_eq!(fq.next(3), 1);
        assert_eq!(fq.next(4), NIL);

        fq.remove(Lru::Active, 1);
        assert_eq!(fq.next(3), 4);

        fq.insert_before(Lru::Active, 4, 2);
        assert_eq!(fq.next(3), 2);
        assert_eq!(fq.next(2), 4);

        fq.remove(Lru::Active, 3);
        assert_eq!(fq.head(Lru::Active), 2);
        fq.remove(Lru::Active, 2);
        fq.remove(Lru::Active, 4);
        assert_eq!(fq.head(Lru::Active), NIL);
        assert_eq!(fq.head(Lru::Inactive), NIL);
    }

    #[test]
    fn object_sets() {
        let mut fq = FreeQueues::new(4);
        fq.objq_insert(0x1000, 2);
        fq.objq_insert(0x1000, 0);
        assert_eq!(fq.objq_first(0x1000), Some(0));
        fq.objq_remove(0x1000, 0);
        assert_eq!(fq.objq_first(0x1000), Some(2));
        fq.objq_remove(0x1000, 2);
        assert_eq!(fq.objq_first(0x1000), None);
    }
}
