//! The big-allocation path: page-multiple mappings tracked by
//! bookkeeping records in a sharded, chained hash keyed by base
//! address.  A small array of lock-free cache slots retains recently
//! freed regions, and a process-wide excess counter triggers a sweep
//! that unmaps the tail slack of records whose mapped size outgrew
//! their active size.
use std::ffi::c_void;
use std::ptr;
use std::ptr::NonNull;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use static_assertions::const_assert;

use crate::class::round_page;
use crate::class::PAGE_SHIFT;
use crate::class::PAGE_SIZE;
use crate::map;
use crate::slab;
use crate::sync::SpinMutex;

const BIGHSIZE: usize = 1024;
const BIGHMASK: usize = BIGHSIZE - 1;
const BIGXSIZE: usize = 64;
const BIGXMASK: usize = BIGXSIZE - 1;

const BIGCACHE: usize = 16;
/// Regions above this size are never cached.
const BIGCACHE_LIMIT: usize = 1 << 20;

/// Excess threshold that triggers a tail-reclamation sweep.
#[cfg(not(feature = "test_only_small_constants"))]
const BIGCACHE_EXCESS: usize = 16 << 20;
#[cfg(feature = "test_only_small_constants")]
const BIGCACHE_EXCESS: usize = 256 << 10;

const_assert!(BIGHSIZE.is_power_of_two());
const_assert!(BIGXSIZE.is_power_of_two());
const_assert!(BIGHSIZE % BIGXSIZE == 0);

/// One oversized allocation.  `bytes` is the mapped size, `active`
/// the page-rounded caller-visible size; both stay page-aligned so
/// sweep arithmetic needs no re-rounding.
#[repr(C)]
struct Big {
    base: *mut c_void,
    bytes: usize,
    active: usize,
    next: *mut Big,
}

static CHAINS: [AtomicPtr<Big>; BIGHSIZE] = {
    const INIT: AtomicPtr<Big> = AtomicPtr::new(ptr::null_mut());
    [INIT; BIGHSIZE]
};

/// Shard `h & BIGXMASK` guards every chain whose index is congruent
/// to it, including all interior `next` links.
static SHARDS: [SpinMutex<()>; BIGXSIZE] = {
    const INIT: SpinMutex<()> = SpinMutex::new(());
    [INIT; BIGXSIZE]
};

static CACHE_PTRS: [AtomicPtr<Big>; BIGCACHE] = {
    const INIT: AtomicPtr<Big> = AtomicPtr::new(ptr::null_mut());
    [INIT; BIGCACHE]
};

/// Slot sizes are only loosely coupled to slot contents: a stale
/// size costs an extra probe miss, nothing worse.
static CACHE_SIZES: [AtomicUsize; BIGCACHE] = {
    const INIT: AtomicUsize = AtomicUsize::new(0);
    [INIT; BIGCACHE]
};

/// Sum of `bytes - active` over all hashed records, maintained with
/// wrapping arithmetic (frees credit the difference back).
static EXCESS: AtomicUsize = AtomicUsize::new(0);

#[inline]
fn hash_of(ptr: *const c_void) -> usize {
    let addr = ptr as usize;

    (addr >> PAGE_SHIFT) ^ (addr >> (PAGE_SHIFT + 10))
}

#[inline]
fn excess_add(delta: usize) {
    EXCESS.fetch_add(delta, Ordering::Relaxed);
}

/// Current excess pool, exact at quiescence.
pub(crate) fn excess_bytes() -> usize {
    EXCESS.load(Ordering::Relaxed)
}

/// Page-rounds a request; exact multiples of two pages get one extra
/// page so power-of-two buffers spread across cache sets.
#[inline]
fn round_request(size: usize) -> usize {
    let rounded = round_page(size);

    if rounded % (2 * PAGE_SIZE) == 0 {
        rounded + PAGE_SIZE
    } else {
        rounded
    }
}

/// Allocates an oversized region of at least `size` bytes aligned to
/// `align`.
pub(crate) fn alloc(size: usize, align: usize, flags: u32) -> Option<NonNull<c_void>> {
    alloc_reserve(size, align, 0, flags)
}

/// Like `alloc`, but maps at least `reserve` bytes while keeping the
/// active size at the rounded request; the difference feeds the
/// excess pool.  Used by realloc to leave growth headroom.
fn alloc_reserve(size: usize, align: usize, reserve: usize, flags: u32) -> Option<NonNull<c_void>> {
    let active = round_request(size);
    let wanted = active.max(round_page(reserve));

    if align <= PAGE_SIZE && wanted <= BIGCACHE_LIMIT {
        if let Some(rec) = cache_take(wanted) {
            unsafe {
                if (*rec).bytes >= wanted {
                    return Some(insert_record(rec, active, flags, true, size));
                }
                // Lost a size race: the swapped-out region is too
                // small after all.
                release_record(rec);
            }
        }
    }

    let base = map::vmem_alloc(wanted, align, flags & slab::SAFLAG_ZERO == 0)?;
    let rec = match slab::zalloc(std::mem::size_of::<Big>(), slab::SAFLAG_ZERO) {
        Some(rec) => rec.as_ptr() as *mut Big,
        None => {
            map::vmem_free(base, wanted);
            return None;
        }
    };

    unsafe {
        (*rec).base = base.as_ptr();
        (*rec).bytes = wanted;
        Some(insert_record(rec, active, flags, false, size))
    }
}

/// Hashes `rec` in, accounts its excess, and zero-fills reused
/// regions on demand.  Fresh mappings are kernel-zeroed already.
unsafe fn insert_record(
    rec: *mut Big,
    active: usize,
    flags: u32,
    reused: bool,
    req_size: usize,
) -> NonNull<c_void> {
    (*rec).active = active;

    let base = (*rec).base;
    let h = hash_of(base);

    {
        let _shard = SHARDS[h & BIGXMASK].lock();
        let chain = &CHAINS[h & BIGHMASK];

        (*rec).next = chain.load(Ordering::Relaxed);
        chain.store(rec, Ordering::Relaxed);
    }

    excess_add((*rec).bytes.wrapping_sub(active));
    maybe_sweep();

    if reused && flags & slab::SAFLAG_ZERO != 0 {
        ptr::write_bytes(base as *mut u8, 0, req_size);
    }

    NonNull::new_unchecked(base)
}

/// If `ptr` is a tracked big allocation, releases it and returns
/// true.  The unlocked head probe keeps the common slab-free path
/// cheap.
pub(crate) fn free_if_big(ptr: *mut c_void) -> bool {
    let h = hash_of(ptr);

    if CHAINS[h & BIGHMASK].load(Ordering::Relaxed).is_null() {
        return false;
    }

    let rec;
    {
        let _shard = SHARDS[h & BIGXMASK].lock();

        rec = unlink_locked(h, ptr);
        if rec.is_null() {
            return false;
        }

        // Credit the pool for the excess about to disappear.
        let (bytes, active) = unsafe { ((*rec).bytes, (*rec).active) };
        excess_add(active.wrapping_sub(bytes));
    }

    unsafe { retire(rec) };
    true
}

/// If `ptr` is a tracked big allocation, resizes it.  Outer `None`
/// means "not a big pointer"; inner `None` is an allocation failure
/// with the original left untouched.
pub(crate) fn try_realloc(
    ptr: *mut c_void,
    new_size: usize,
    flags: u32,
) -> Option<Option<NonNull<c_void>>> {
    let h = hash_of(ptr);

    if CHAINS[h & BIGHMASK].load(Ordering::Relaxed).is_null() {
        return None;
    }

    let new_active = round_page(new_size);
    let old_active;

    {
        let _shard = SHARDS[h & BIGXMASK].lock();
        let rec = find_locked(h, ptr);

        if rec.is_null() {
            return None;
        }

        let (bytes, active) = unsafe { ((*rec).bytes, (*rec).active) };

        // Within half of the mapping: adjust the active size in
        // place, no copying and no syscalls.
        if new_active <= bytes && new_active >= bytes / 2 {
            unsafe { (*rec).active = new_active };
            excess_add(active.wrapping_sub(new_active));
            drop(_shard);
            maybe_sweep();
            return Some(NonNull::new(ptr));
        }

        if new_active > bytes {
            let base = unsafe { NonNull::new_unchecked((*rec).base) };

            if map::vmem_try_grow(base, bytes, new_active) {
                unsafe {
                    (*rec).bytes = new_active;
                    (*rec).active = new_active;
                }
                // The old tail slack is gone; the new mapping is
                // exactly active-sized.
                excess_add(active.wrapping_sub(bytes));
                return Some(NonNull::new(ptr));
            }
        }

        old_active = active;
    }

    // Move: allocate fresh with an eighth of headroom for the next
    // growth, copy, release the old mapping.
    let fresh = match alloc_reserve(new_size, PAGE_SIZE, new_size + new_size / 8, flags) {
        Some(fresh) => fresh,
        None => return Some(None),
    };

    unsafe {
        ptr::copy_nonoverlapping(
            ptr as *const u8,
            fresh.as_ptr() as *mut u8,
            old_active.min(new_size),
        );
    }
    free_if_big(ptr);

    Some(Some(fresh))
}

/// Remaining mapped bytes behind a big pointer, if it is one.
pub(crate) fn usable_size_if_big(ptr: *const c_void) -> Option<usize> {
    let h = hash_of(ptr);

    if CHAINS[h & BIGHMASK].load(Ordering::Relaxed).is_null() {
        return None;
    }

    let _shard = SHARDS[h & BIGXMASK].lock();
    let rec = find_locked(h, ptr as *mut c_void);

    if rec.is_null() {
        None
    } else {
        unsafe { Some((*rec).base as usize + (*rec).bytes - ptr as usize) }
    }
}

fn find_locked(h: usize, ptr: *mut c_void) -> *mut Big {
    let mut cur = CHAINS[h & BIGHMASK].load(Ordering::Relaxed);

    unsafe {
        while !cur.is_null() {
            if (*cur).base == ptr {
                return cur;
            }
            cur = (*cur).next;
        }
    }
    ptr::null_mut()
}

fn unlink_locked(h: usize, ptr: *mut c_void) -> *mut Big {
    let chain = &CHAINS[h & BIGHMASK];
    let mut prev: *mut Big = ptr::null_mut();
    let mut cur = chain.load(Ordering::Relaxed);

    unsafe {
        while !cur.is_null() {
            if (*cur).base == ptr {
                if prev.is_null() {
                    chain.store((*cur).next, Ordering::Relaxed);
                } else {
                    (*prev).next = (*cur).next;
                }
                (*cur).next = ptr::null_mut();
                return cur;
            }
            prev = cur;
            cur = (*cur).next;
        }
    }
    ptr::null_mut()
}

/// Stashes a freed record into the cache when it fits, releasing any
/// displaced record for real.
unsafe fn retire(rec: *mut Big) {
    if (*rec).bytes <= BIGCACHE_LIMIT {
        if let Some(displaced) = cache_stash(rec) {
            if !displaced.is_null() {
                release_record(displaced);
            }
            return;
        }
    }
    release_record(rec);
}

unsafe fn release_record(rec: *mut Big) {
    if let Some(base) = NonNull::new((*rec).base) {
        map::vmem_free(base, (*rec).bytes);
    }
    slab::zfree(rec as *mut c_void, 0);
}

/// Linear probe for the first slot advertising enough bytes.  The
/// advertised size can be stale; `alloc_reserve` re-checks the
/// record it actually gets.
fn cache_take(wanted: usize) -> Option<*mut Big> {
    for i in 0..BIGCACHE {
        if CACHE_SIZES[i].load(Ordering::Relaxed) >= wanted {
            let rec = CACHE_PTRS[i].swap(ptr::null_mut(), Ordering::AcqRel);

            if !rec.is_null() {
                // The slot is empty now; say so, or the stale size
                // would repel stores forever.
                CACHE_SIZES[i].store(0, Ordering::Relaxed);
                return Some(rec);
            }
        }
    }
    None
}

/// Stashes into the slot with the smallest advertised size below
/// ours; `None` means every slot advertises something at least as
/// large and the record should be released instead.
unsafe fn cache_stash(rec: *mut Big) -> Option<*mut Big> {
    let bytes = (*rec).bytes;
    let mut best: Option<usize> = None;
    let mut best_size = bytes;

    for i in 0..BIGCACHE {
        let advertised = CACHE_SIZES[i].load(Ordering::Relaxed);

        if advertised < best_size {
            best_size = advertised;
            best = Some(i);
        }
    }

    let slot = best?;
    let displaced = CACHE_PTRS[slot].swap(rec, Ordering::AcqRel);

    CACHE_SIZES[slot].store(bytes, Ordering::Relaxed);
    Some(displaced)
}

fn maybe_sweep() {
    if EXCESS.load(Ordering::Relaxed) > BIGCACHE_EXCESS {
        sweep();
    }
}

/// Unmap-truncates the tail slack of every hashed record.  Shards are
/// visited in ascending order, each locked in turn.
fn sweep() {
    for shard in 0..BIGXSIZE {
        let _guard = SHARDS[shard].lock();
        let mut index = shard;

        while index < BIGHSIZE {
            let mut rec = CHAINS[index].load(Ordering::Relaxed);

            unsafe {
                while !rec.is_null() {
                    let (bytes, active) = ((*rec).bytes, (*rec).active);

                    if bytes > active {
                        let tail = ((*rec).base as usize + active) as *mut c_void;

                        map::vmem_free(NonNull::new_unchecked(tail), bytes - active);
                        (*rec).bytes = active;
                        EXCESS.fetch_sub(bytes - active, Ordering::Relaxed);
                    }
                    rec = (*rec).next;
                }
            }
            index += BIGXSIZE;
        }
    }
}

#[cfg(test)]
pub(crate) fn sweep_for_test() {
    sweep();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn record_round_trip() {
        let _serial = test_util::serialize();

        let region = alloc(50_000, PAGE_SIZE, 0).expect("mmap should succeed");
        let base = region.as_ptr();

        assert_eq!(base as usize % PAGE_SIZE, 0);
        assert!(usable_size_if_big(base).expect("tracked") >= 50_000);

        assert!(free_if_big(base));
        // Gone from the hash: a second free must not find it.
        assert!(!free_if_big(base));
    }

    #[test]
    fn conflict_page_for_two_page_multiples() {
        let _serial = test_util::serialize();

        // 24 KiB is an exact multiple of two pages; the mapping gets
        // one page of slack on top.
        let region = alloc(24 * 1024, PAGE_SIZE, 0).expect("mmap should succeed");

        assert_eq!(
            usable_size_if_big(region.as_ptr()).expect("tracked"),
            24 * 1024 + PAGE_SIZE
        );
        assert!(free_if_big(region.as_ptr()));
    }

    #[test]
    fn oversized_regions_bypass_the_cache() {
        let _serial = test_util::serialize();

        let big_size = 2 * BIGCACHE_LIMIT;
        let region = alloc(big_size, PAGE_SIZE, 0).expect("mmap should succeed");
        let base = region.as_ptr();

        let unmaps_before = map::map_stats().unmaps;
        assert!(free_if_big(base));
        let unmaps_after = map::map_stats().unmaps;

        // Too large to cache: the mapping went straight back.
        assert!(unmaps_after > unmaps_before);
    }

    #[test]
    fn shrink_in_place_builds_excess_and_sweep_reclaims_it() {
        let _serial = test_util::serialize();

        let baseline = excess_bytes();
        let full = 4 << 20;
        let kept = 3 << 20;
        let mut regions = Vec::new();

        // Each iteration maps 4 MiB and shrinks it to 3 MiB in
        // place, stranding ~1 MiB of tail slack in the excess pool.
        // Well before the loop ends, the pool crosses the sweep
        // threshold and collapses.
        for _ in 0..20 {
            let region = alloc(full, PAGE_SIZE, 0).expect("mmap should succeed");
            let shrunk = try_realloc(region.as_ptr(), kept, 0)
                .expect("tracked")
                .expect("shrink cannot fail");

            assert_eq!(shrunk, region, "half-or-more shrinks stay in place");
            regions.push(region);
        }

        assert!(excess_bytes().wrapping_sub(baseline) <= BIGCACHE_EXCESS);

        // Force the remaining tails out and verify every mapping is
        // now exactly active-sized.
        sweep_for_test();
        for region in &regions {
            assert_eq!(
                usable_size_if_big(region.as_ptr()).expect("tracked"),
                kept
            );
        }
        assert_eq!(excess_bytes(), baseline);

        for region in regions {
            assert!(free_if_big(region.as_ptr()));
        }
        assert_eq!(excess_bytes(), baseline);
    }

    #[test]
    fn adjacent_growth_or_clean_move() {
        let _serial = test_util::serialize();

        let region = alloc(3 << 20, PAGE_SIZE, 0).expect("mmap should succeed");
        let bytes = region.as_ptr() as *mut u8;

        unsafe { ptr::write_bytes(bytes, 0x5a, 3 << 20) };

        let grown = try_realloc(region.as_ptr(), 5 << 20, 0)
            .expect("tracked")
            .expect("grow should find memory");

        let grown_bytes = grown.as_ptr() as *const u8;
        for offset in (0..(3 << 20)).step_by(65536) {
            assert_eq!(unsafe { std::ptr::read(grown_bytes.add(offset)) }, 0x5a);
        }

        assert!(free_if_big(grown.as_ptr()));
    }
}
