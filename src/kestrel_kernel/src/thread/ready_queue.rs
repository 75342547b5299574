//! Priority-ordered thread lists.
//!
//! The ready queue and every wait queue are instances of [`ThreadList`], a
//! doubly linked list threaded through the per-thread [`Link`] fields of the
//! thread arena. A thread belongs to at most one list at any time, so a
//! single pair of link fields per thread suffices.
//!
//! Lists are ordered by descending effective priority. The two insertion
//! flavors differ only in how they break ties:
//!
//!  - [`ThreadList::insert_behind`] places the thread after all entries of
//!    equal priority (FIFO among peers). Used for normal enqueueing.
//!  - [`ThreadList::insert_ahead`] places the thread before entries of equal
//!    priority. Used when a preempted thread must regain the CPU before its
//!    peers.
use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    thread::{Link, ThreadArena},
    utils::Init,
    Port,
};

pub(crate) struct ThreadList<P: Port> {
    first: CpuLockCell<P, Option<u8>>,
    last: CpuLockCell<P, Option<u8>>,
}

impl<P: Port> Init for ThreadList<P> {
    const INIT: Self = Self {
        first: Init::INIT,
        last: Init::INIT,
    };
}

impl<P: Port> ThreadList<P> {
    /// Get the index of the highest-priority thread in the list.
    pub(crate) fn first(&self, lock: CpuLockTokenRefMut<'_, P>) -> Option<u8> {
        self.first.get(&*lock)
    }

    /// Insert `idx` while preserving the descending priority order, after all
    /// entries of equal or higher priority.
    pub(crate) fn insert_behind(
        &self,
        threads: &ThreadArena<P>,
        idx: u8,
        lock: CpuLockTokenRefMut<'_, P>,
    ) {
        let priority = threads.cb(idx).effective_priority.get(&*lock);
        let mut at = self.first.get(&*lock);
        while let Some(i) = at {
            if threads.cb(i).effective_priority.get(&*lock) < priority {
                break;
            }
            at = threads.cb(i).link.get(&*lock).next;
        }
        self.insert_before(threads, idx, at, lock);
    }

    /// Insert `idx` while preserving the descending priority order, before
    /// all entries of equal or lower priority.
    pub(crate) fn insert_ahead(
        &self,
        threads: &ThreadArena<P>,
        idx: u8,
        lock: CpuLockTokenRefMut<'_, P>,
    ) {
        let priority = threads.cb(idx).effective_priority.get(&*lock);
        let mut at = self.first.get(&*lock);
        while let Some(i) = at {
            if threads.cb(i).effective_priority.get(&*lock) <= priority {
                break;
            }
            at = threads.cb(i).link.get(&*lock).next;
        }
        self.insert_before(threads, idx, at, lock);
    }

    fn insert_before(
        &self,
        threads: &ThreadArena<P>,
        idx: u8,
        before: Option<u8>,
        mut lock: CpuLockTokenRefMut<'_, P>,
    ) {
        let prev = match before {
            Some(b) => threads.cb(b).link.get(&*lock).prev,
            None => self.last.get(&*lock),
        };

        threads
            .cb(idx)
            .link
            .replace(&mut *lock, Link { prev, next: before });

        match prev {
            Some(p) => threads.cb(p).link.write(&mut *lock).next = Some(idx),
            None => {
                self.first.replace(&mut *lock, Some(idx));
            }
        }
        match before {
            Some(b) => threads.cb(b).link.write(&mut *lock).prev = Some(idx),
            None => {
                self.last.replace(&mut *lock, Some(idx));
            }
        }
    }

    /// Unlink `idx` from the list. `idx` must be in this list.
    pub(crate) fn remove(
        &self,
        threads: &ThreadArena<P>,
        idx: u8,
        mut lock: CpuLockTokenRefMut<'_, P>,
    ) {
        let link = threads.cb(idx).link.get(&*lock);
        match link.prev {
            Some(p) => threads.cb(p).link.write(&mut *lock).next = link.next,
            None => {
                self.first.replace(&mut *lock, link.next);
            }
        }
        match link.next {
            Some(n) => threads.cb(n).link.write(&mut *lock).prev = link.prev,
            None => {
                self.last.replace(&mut *lock, link.prev);
            }
        }
        threads.cb(idx).link.replace(&mut *lock, Link::INIT);
    }

    /// Unlink and return the highest-priority thread.
    pub(crate) fn pop_front(
        &self,
        threads: &ThreadArena<P>,
        mut lock: CpuLockTokenRefMut<'_, P>,
    ) -> Option<u8> {
        let first = self.first.get(&*lock)?;
        self.remove(threads, first, lock.borrow_mut());
        Some(first)
    }
}
