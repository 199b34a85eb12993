//! A magazine is a fixed-capacity stack of free chunks for one size
//! class.  The per-thread cache pushes and pops rounds without any
//! lock; full and empty magazines cycle through the depot.  Magazine
//! structs are themselves slab allocations, made with the internal
//! flag so they can never recurse into the magazine layer.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::ptr::NonNull;

use static_assertions::const_assert;

use crate::class::M_MAX_ROUNDS;
use crate::slab;

/// The round array is sized for the deepest class; shallower classes
/// cap `capacity` below `M_MAX_ROUNDS` and leave the tail unused.
#[repr(C)]
pub(crate) struct Magazine {
    /// Intrusive link used by the depot's full/empty lists.
    pub next: *mut Magazine,
    pub(crate) capacity: u32,
    pub(crate) rounds: u32,
    pub(crate) objects: [*mut c_void; M_MAX_ROUNDS],
}

// A magazine plus its header must fit in a single slab chunk.
const_assert!(std::mem::size_of::<Magazine>() <= 4096);

impl Magazine {
    /// Re-types a magazine for a class: sets its depth and empties it.
    #[requires(capacity >= 1 && capacity as usize <= M_MAX_ROUNDS)]
    #[ensures(self.is_empty())]
    pub fn prepare(&mut self, capacity: u32) {
        self.next = std::ptr::null_mut();
        self.capacity = capacity;
        self.rounds = 0;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rounds == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.rounds == self.capacity
    }

    /// Number of additional rounds this magazine can hold.
    #[inline]
    pub fn headroom(&self) -> usize {
        (self.capacity - self.rounds) as usize
    }

    /// Pops the most recently pushed round.
    #[invariant(self.rounds <= self.capacity)]
    #[ensures(old(self.is_empty()) == ret.is_none())]
    #[ensures(ret.is_some() -> self.rounds == old(self.rounds) - 1)]
    #[inline]
    pub fn pop(&mut self) -> Option<NonNull<c_void>> {
        if self.rounds == 0 {
            return None;
        }

        self.rounds -= 1;
        NonNull::new(self.objects[self.rounds as usize])
    }

    /// Pushes a free round; fails iff the magazine is full.
    #[invariant(self.rounds <= self.capacity)]
    #[ensures(old(self.is_full()) == !ret)]
    #[ensures(ret -> self.rounds == old(self.rounds) + 1)]
    #[inline]
    pub fn push(&mut self, freed: NonNull<c_void>) -> bool {
        if self.rounds >= self.capacity {
            return false;
        }

        self.objects[self.rounds as usize] = freed.as_ptr();
        self.rounds += 1;
        true
    }
}

/// Allocates a magazine through the slab engine.  The internal flag
/// keeps the allocation out of the magazine cache, which is what
/// breaks the staging recursion.
pub(crate) fn alloc_magazine() -> *mut Magazine {
    match slab::zalloc(
        std::mem::size_of::<Magazine>(),
        slab::SAFLAG_ZERO | slab::SAFLAG_MAGS_INTERNAL,
    ) {
        Some(ptr) => ptr.as_ptr() as *mut Magazine,
        None => std::ptr::null_mut(),
    }
}

/// Returns a magazine's storage to the slab engine.
///
/// # Safety
///
/// `mag` must have come from `alloc_magazine` and must no longer be
/// reachable from any depot list or thread cache.
pub(crate) unsafe fn release_magazine(mag: *mut Magazine) {
    slab::free_slab(mag as *mut c_void, slab::SAFLAG_MAGS_INTERNAL);
}
