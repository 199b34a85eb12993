//! Per-thread magazine cache.  Each thread carries a `loaded`/`prev`
//! magazine pair per size class: the fast path pops and pushes rounds
//! with no lock at all, and misses cycle the pair through the depot.
//! A pre-staged `newmag` breaks the recursion that installing a fresh
//! magazine would otherwise cause (magazines are themselves slab
//! allocations).
//!
//! Magazines only ever enter the `prev` slot full or empty, never
//! partially populated: allocation rotates when `loaded` is empty and
//! free rotates when it is full.
use std::cell::RefCell;
use std::ffi::c_void;
use std::ptr;
use std::ptr::NonNull;

use crate::api;
use crate::class;
use crate::class::NZONES;
use crate::depot;
use crate::magazine;
use crate::magazine::Magazine;
use crate::slab;

#[derive(Clone, Copy)]
struct MagPair {
    loaded: *mut Magazine,
    prev: *mut Magazine,
}

pub(crate) struct ThreadMags {
    /// 1 while the thread is alive, -1 throughout teardown.  Teardown
    /// may itself allocate (destructors); those calls take the slow
    /// path instead of re-entering a half-drained cache.
    init: i8,
    newmag: *mut Magazine,
    pairs: [MagPair; NZONES],
}

thread_local! {
    static MAGS: RefCell<ThreadMags> = RefCell::new(ThreadMags::new());
}

/// Attempts a lock-free allocation of a class-`zi` chunk from the
/// calling thread's magazines.  `None` sends the caller to the slab.
#[inline]
pub(crate) fn allocate(zi: usize) -> Option<NonNull<c_void>> {
    if api::reentered() {
        return None;
    }

    MAGS.try_with(|mags| {
        let mut mags = mags.try_borrow_mut().ok()?;
        mags.allocate(zi)
    })
    .ok()
    .flatten()
}

/// Attempts to stash a freed class-`zi` chunk in the calling thread's
/// magazines.  `false` sends the caller to the slab.
#[inline]
pub(crate) fn release(zi: usize, chunk: NonNull<c_void>) -> bool {
    if api::reentered() {
        return false;
    }

    MAGS.try_with(|mags| match mags.try_borrow_mut() {
        Ok(mut mags) => mags.release(zi, chunk),
        Err(_) => false,
    })
    .unwrap_or(false)
}

/// Runs `f` on the thread's loaded magazine for class `zi`, if there
/// is one.  The slab engine uses this to bulk-fill under its class
/// lock.
pub(crate) fn with_loaded<R>(zi: usize, f: impl FnOnce(&mut Magazine) -> R) -> Option<R> {
    MAGS.try_with(|mags| {
        let mut mags = mags.try_borrow_mut().ok()?;

        if mags.init < 0 {
            return None;
        }

        let loaded = mags.pairs[zi].loaded;
        if loaded.is_null() {
            return None;
        }
        Some(f(unsafe { &mut *loaded }))
    })
    .ok()
    .flatten()
}

impl ThreadMags {
    fn new() -> Self {
        ThreadMags {
            init: 1,
            newmag: ptr::null_mut(),
            pairs: [MagPair {
                loaded: ptr::null_mut(),
                prev: ptr::null_mut(),
            }; NZONES],
        }
    }

    /// Stages a magazine for installation before entering either
    /// cycling loop; this is what bounds the recursion.
    fn ensure_newmag(&mut self) -> bool {
        if self.newmag.is_null() {
            self.newmag = magazine::alloc_magazine();
        }
        !self.newmag.is_null()
    }

    fn install_newmag(&mut self, zi: usize) -> *mut Magazine {
        let mag = self.newmag;

        if !mag.is_null() {
            self.newmag = ptr::null_mut();
            unsafe { (*mag).prepare(class::magazine_capacity(zi) as u32) };
        }
        mag
    }

    fn allocate(&mut self, zi: usize) -> Option<NonNull<c_void>> {
        if self.init < 0 {
            return None;
        }
        self.ensure_newmag();

        loop {
            let MagPair { loaded, prev } = self.pairs[zi];

            // Fast path: the loaded magazine has rounds.
            if !loaded.is_null() {
                if let Some(chunk) = unsafe { (*loaded).pop() } {
                    return Some(chunk);
                }
            }

            // A full prev swaps in for free.
            if !prev.is_null() && unsafe { (*prev).is_full() } {
                self.pairs[zi] = MagPair {
                    loaded: prev,
                    prev: loaded,
                };
                continue;
            }

            // Rotate a full magazine out of the depot, retiring our
            // empty prev in exchange.
            let full = depot::with_depot(zi, |d| {
                let full = d.pop_full();

                if !full.is_null() && !prev.is_null() {
                    d.push_empty(prev);
                }
                full
            });

            if !full.is_null() {
                self.pairs[zi] = MagPair {
                    loaded: full,
                    prev: loaded,
                };
                continue;
            }

            // Depot miss.  Leave an empty loaded magazine behind for
            // the slab engine to bulk-fill, then fall through.
            if loaded.is_null() {
                let fresh = self.install_newmag(zi);

                if !fresh.is_null() {
                    self.pairs[zi].loaded = fresh;
                }
            }
            return None;
        }
    }

    fn release(&mut self, zi: usize, chunk: NonNull<c_void>) -> bool {
        if self.init < 0 {
            return false;
        }
        if !self.ensure_newmag() {
            return false;
        }

        loop {
            let MagPair { loaded, prev } = self.pairs[zi];

            // Fast path: the loaded magazine has space.
            if !loaded.is_null() && unsafe { (*loaded).push(chunk) } {
                return true;
            }

            // An empty prev swaps in for free.
            if !prev.is_null() && unsafe { (*prev).is_empty() } {
                self.pairs[zi] = MagPair {
                    loaded: prev,
                    prev: loaded,
                };
                continue;
            }

            // Rotate: hand our full prev to the depot and load an
            // empty magazine from it, or fall back to the staged one.
            if self.newmag.is_null() && !self.ensure_newmag() {
                return false;
            }

            let empty = depot::with_depot(zi, |d| {
                if !prev.is_null() {
                    d.push_full(prev);
                }
                d.pop_empty()
            });

            let fresh = if empty.is_null() {
                self.install_newmag(zi)
            } else {
                empty
            };

            self.pairs[zi] = MagPair {
                loaded: fresh,
                prev: loaded,
            };
        }
    }
}

/// Thread teardown: pop every cached round back into the slab engine
/// and release the magazines themselves.  Everything goes through the
/// internal flag so nothing re-enters this cache.
impl Drop for ThreadMags {
    fn drop(&mut self) {
        self.init = -1;

        for zi in 0..NZONES {
            let MagPair { loaded, prev } = self.pairs[zi];

            for mag in [loaded, prev].iter().cloned() {
                if mag.is_null() {
                    continue;
                }
                unsafe {
                    while let Some(chunk) = (*mag).pop() {
                        slab::free_slab(chunk.as_ptr(), slab::SAFLAG_MAGS_INTERNAL);
                    }
                    magazine::release_magazine(mag);
                }
            }
            self.pairs[zi] = MagPair {
                loaded: ptr::null_mut(),
                prev: ptr::null_mut(),
            };
        }

        if !self.newmag.is_null() {
            unsafe { magazine::release_magazine(self.newmag) };
            self.newmag = ptr::null_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn magazine_fast_path_is_lifo() {
        let _serial = test_util::serialize();

        // Prime the cache through the public slab entry points.
        let a = slab::zalloc(64, 0).expect("should allocate");
        let b = slab::zalloc(64, 0).expect("should allocate");

        slab::zfree(a.as_ptr(), 0);

        // The just-freed chunk is on top of the loaded magazine.
        let c = slab::zalloc(64, 0).expect("should allocate");
        assert_eq!(c, a);

        slab::zfree(b.as_ptr(), 0);
        slab::zfree(c.as_ptr(), 0);
    }

    #[test]
    fn newmag_is_staged_after_first_use() {
        let _serial = test_util::serialize();

        let chunk = slab::zalloc(64, 0).expect("should allocate");
        slab::zfree(chunk.as_ptr(), 0);

        MAGS.with(|mags| {
            let mags = mags.borrow();
            assert_eq!(mags.init, 1);
            // The free loop stages (and possibly consumes and
            // restages) the recursion breaker.
            let zi = class::classify(64).index;
            let pair = mags.pairs[zi];
            assert!(!pair.loaded.is_null());
        });
    }

    #[test]
    fn cycle_far_past_one_magazine() {
        let _serial = test_util::serialize();

        let depth = class::magazine_capacity(class::classify(48).index);
        let mut chunks = Vec::new();

        // Blow through several magazines' worth of traffic.
        for _ in 0..3 * depth {
            chunks.push(slab::zalloc(48, 0).expect("should allocate"));
        }
        for chunk in chunks.drain(..) {
            slab::zfree(chunk.as_ptr(), 0);
        }

        // And the cache still round-trips.
        let chunk = slab::zalloc(48, 0).expect("should allocate");
        slab::zfree(chunk.as_ptr(), 0);
    }

    #[test]
    fn cross_thread_free_lands_in_depot() {
        let _serial = test_util::serialize();

        let depth = class::magazine_capacity(class::classify(256).index);

        // This thread allocates, a second thread frees.  The freeing
        // thread's magazines fill up and overflow into the depot.
        let chunks: Vec<usize> = (0..2 * depth)
            .map(|_| slab::zalloc(256, 0).expect("should allocate").as_ptr() as usize)
            .collect();

        std::thread::spawn(move || {
            for chunk in chunks {
                slab::zfree(chunk as *mut c_void, 0);
            }
        })
        .join()
        .expect("freeing thread should not panic");

        // The chunks are reachable again from this thread.
        let mut reclaimed = Vec::new();
        for _ in 0..2 * depth {
            reclaimed.push(slab::zalloc(256, 0).expect("should allocate"));
        }
        for chunk in reclaimed {
            slab::zfree(chunk.as_ptr(), 0);
        }
    }
}
