//! The depot is the reservoir between thread caches: one pair of
//! intrusive magazine lists (full / empty) per size class.  A single
//! process-wide spinlock covers every class; the fast path never
//! touches the depot, so sharing one lock is cheap and gives the fork
//! hooks a single acquisition point.
use std::ptr;

use crate::class::NZONES;
use crate::magazine::Magazine;
use crate::sync::SpinMutex;

#[derive(Clone, Copy)]
pub(crate) struct Depot {
    full: *mut Magazine,
    empty: *mut Magazine,
}

impl Depot {
    const fn new() -> Self {
        Self {
            full: ptr::null_mut(),
            empty: ptr::null_mut(),
        }
    }

    pub fn push_full(&mut self, mag: *mut Magazine) {
        debug_assert!(!mag.is_null());
        unsafe { (*mag).next = self.full };
        self.full = mag;
    }

    pub fn pop_full(&mut self) -> *mut Magazine {
        let mag = self.full;

        if !mag.is_null() {
            unsafe {
                self.full = (*mag).next;
                (*mag).next = ptr::null_mut();
            }
        }
        mag
    }

    pub fn push_empty(&mut self, mag: *mut Magazine) {
        debug_assert!(!mag.is_null());
        unsafe { (*mag).next = self.empty };
        self.empty = mag;
    }

    pub fn pop_empty(&mut self) -> *mut Magazine {
        let mag = self.empty;

        if !mag.is_null() {
            unsafe {
                self.empty = (*mag).next;
                (*mag).next = ptr::null_mut();
            }
        }
        mag
    }
}

struct AllDepots([Depot; NZONES]);

// Magazines moved through the depot are exclusively owned by whoever
// holds the depot lock.
unsafe impl Send for AllDepots {}

static DEPOTS: SpinMutex<AllDepots> = SpinMutex::new(AllDepots([Depot::new(); NZONES]));

/// Runs `f` on the depot for class `zi` under the depot lock.
#[inline]
pub(crate) fn with_depot<R>(zi: usize, f: impl FnOnce(&mut Depot) -> R) -> R {
    let mut guard = DEPOTS.lock();

    f(&mut guard.0[zi])
}

/// Fork hook support: the depot lock is the first lock in the prefork
/// order.
pub(crate) unsafe fn raw_lock() {
    DEPOTS.raw_lock();
}

pub(crate) unsafe fn raw_unlock() {
    DEPOTS.raw_unlock();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::M_MAX_ROUNDS;

    fn scratch(next_free: &mut Vec<Box<Magazine>>) -> *mut Magazine {
        let mut mag = Box::new(Magazine {
            next: ptr::null_mut(),
            capacity: 0,
            rounds: 0,
            objects: [ptr::null_mut(); M_MAX_ROUNDS],
        });
        let raw = &mut *mag as *mut Magazine;

        next_free.push(mag);
        raw
    }

    #[test]
    fn lifo_cycling() {
        let mut storage = Vec::new();
        let a = scratch(&mut storage);
        let b = scratch(&mut storage);
        let mut depot = Depot::new();

        assert!(depot.pop_full().is_null());
        assert!(depot.pop_empty().is_null());

        depot.push_full(a);
        depot.push_full(b);
        assert_eq!(depot.pop_full(), b);
        assert_eq!(depot.pop_full(), a);
        assert!(depot.pop_full().is_null());

        depot.push_empty(a);
        assert_eq!(depot.pop_empty(), a);
        assert!(depot.pop_empty().is_null());
    }
}
