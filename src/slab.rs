//! The slab engine services sub-zone-limit requests from per-class
//! zone lists.  A miss in the thread's magazine cache lands here: we
//! take the class lock, carve or reuse a chunk, and opportunistically
//! bulk-fill the caller's loaded magazine so one lock acquisition
//! amortizes over up to 33 allocations.
use std::ffi::c_void;
use std::ptr;
use std::ptr::NonNull;

use crate::big;
use crate::cache;
use crate::class;
use crate::class::NZONES;
use crate::class::PAGE_SIZE;
use crate::class::SizeClass;
use crate::rack;
use crate::sync::SpinMutex;
use crate::zone;
use crate::zone::Zone;

/// Zero the returned region.
pub(crate) const SAFLAG_ZERO: u32 = 0x0001;
/// The request came from an internal, passive consumer.  Recorded on
/// the zone; nothing branches on it.
pub(crate) const SAFLAG_PASSIVE: u32 = 0x0002;
/// Bypass the magazine cache entirely.  Set for magazine-struct
/// allocation and teardown so the cache can never recurse into
/// itself.
pub(crate) const SAFLAG_MAGS_INTERNAL: u32 = 0x0004;

/// Upper bound on chunks moved into the caller's magazine per class
/// lock acquisition.
const CACHE_CHUNKS: usize = 32;

struct ClassList {
    head: *mut Zone,
}

// Zones on a class list are only reached under that class's lock.
unsafe impl Send for ClassList {}

static CLASS_LISTS: [SpinMutex<ClassList>; NZONES] = {
    const INIT: SpinMutex<ClassList> = SpinMutex::new(ClassList {
        head: ptr::null_mut(),
    });
    [INIT; NZONES]
};

/// Allocates `size` usable bytes.  Zero-size requests are promoted to
/// one byte and still return a distinct pointer; oversized requests
/// are delegated to the big path.
pub(crate) fn zalloc(size: usize, flags: u32) -> Option<NonNull<c_void>> {
    let size = if size == 0 { 1 } else { size };

    if class::is_oversized(size) {
        return big::alloc(size, PAGE_SIZE, flags);
    }

    let sc = class::classify(size);

    if flags & SAFLAG_MAGS_INTERNAL == 0 {
        if let Some(chunk) = cache::allocate(sc.index) {
            if flags & SAFLAG_ZERO != 0 {
                unsafe { ptr::write_bytes(chunk.as_ptr() as *mut u8, 0, size) };
            }
            return Some(chunk);
        }
    }

    alloc_from_class(&sc, size, flags)
}

/// Frees any pointer previously returned by the allocator: big
/// allocations peel off through the bookkeeping hash, everything else
/// must belong to a live zone.
pub(crate) fn zfree(ptr: *mut c_void, flags: u32) {
    if ptr.is_null() {
        return;
    }

    if big::free_if_big(ptr) {
        return;
    }

    free_slab(ptr, flags);
}

/// Frees a pointer known to be a slab chunk.
pub(crate) fn free_slab(ptr: *mut c_void, flags: u32) {
    let z = zone::zone_of(ptr);

    unsafe {
        if !(*z).magic_ok() {
            crate::die("free of pointer with no owning zone", ptr as usize);
        }
        if let Err(msg) = (*z).validate_chunk(ptr) {
            crate::die(msg, ptr as usize);
        }
    }

    let zi = unsafe { (*z).class_index } as usize;

    if flags & SAFLAG_MAGS_INTERNAL == 0 {
        if let Some(chunk) = NonNull::new(ptr) {
            if cache::release(zi, chunk) {
                return;
            }
        }
    }

    free_chunk_slow(z, ptr, zi);
}

/// Chunk size of the zone owning a slab pointer; fatal when the
/// pointer belongs to no zone.
pub(crate) fn chunk_size_of(ptr: *const c_void) -> usize {
    let z = zone::zone_of(ptr as *mut c_void);

    unsafe {
        if !(*z).magic_ok() {
            crate::die("realloc of pointer with no owning zone", ptr as usize);
        }
        (*z).chunk_size
    }
}

/// Remaining bytes in the slab chunk containing `ptr`.
pub(crate) fn usable_size(ptr: *const c_void) -> usize {
    let z = zone::zone_of(ptr as *mut c_void);

    unsafe {
        if !(*z).magic_ok() {
            crate::die("usable_size of pointer with no owning zone", ptr as usize);
        }
        (*z).usable_size(ptr)
    }
}

fn alloc_from_class(sc: &SizeClass, req_size: usize, flags: u32) -> Option<NonNull<c_void>> {
    let mut guard = CLASS_LISTS[sc.index].lock();

    if guard.head.is_null() {
        let (region, recycled) = rack::zone_acquire()?;
        let mut zflags = if recycled { zone::ZF_UNOTZEROD } else { 0 };

        if flags & SAFLAG_PASSIVE != 0 {
            zflags |= zone::ZF_PASSIVE;
        }
        guard.head = unsafe { zone::format(region, sc, zflags) };
    }

    let head = guard.head;
    let z = unsafe { &mut *head };

    let (chunk, known_zero) = match z.take_chunk() {
        Ok(taken) => taken,
        Err(msg) => {
            drop(guard);
            crate::die(msg, head as usize);
        }
    };

    if z.n_free == 0 {
        guard.head = z.next;
        z.next = ptr::null_mut();
    } else if flags & SAFLAG_MAGS_INTERNAL == 0 {
        // The zone keeps at least one free chunk, so the fill below
        // can never unlink it out from under us.
        let fill_failure = cache::with_loaded(sc.index, |mag| {
            let mut room = mag
                .headroom()
                .min(z.n_free.saturating_sub(1) as usize)
                .min(CACHE_CHUNKS);

            while room > 0 {
                match z.take_chunk() {
                    Ok((extra, _)) => {
                        if !mag.push(extra) {
                            z.free_chunk(extra.as_ptr());
                            break;
                        }
                    }
                    Err(msg) => return Some(msg),
                }
                room -= 1;
            }
            None
        });

        if let Some(Some(msg)) = fill_failure {
            drop(guard);
            crate::die(msg, head as usize);
        }
    }

    drop(guard);

    if flags & SAFLAG_ZERO != 0 && !known_zero {
        unsafe { ptr::write_bytes(chunk.as_ptr() as *mut u8, 0, req_size) };
    }

    Some(chunk)
}

fn free_chunk_slow(z: *mut Zone, ptr: *mut c_void, zi: usize) {
    let mut guard = CLASS_LISTS[zi].lock();
    let zone_ref = unsafe { &mut *z };

    let (was_exhausted, all_free) = zone_ref.free_chunk(ptr);

    if was_exhausted {
        zone_ref.next = guard.head;
        guard.head = z;
    }

    if all_free {
        // Entirely free: unlink and hand the zone to the rack.
        let mut cursor: *mut *mut Zone = &mut guard.head;

        unsafe {
            while !(*cursor).is_null() && *cursor != z {
                cursor = &mut (**cursor).next;
            }
            if !(*cursor).is_null() {
                *cursor = zone_ref.next;
            }
        }
        zone_ref.next = ptr::null_mut();

        drop(guard);
        unsafe { rack::zone_release(z) };
    }
}
