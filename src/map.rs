//! The VM adapter obtains and releases aligned, page-multiple regions
//! of anonymous memory.  An address hint raises the odds that a plain
//! mapping is already aligned; when it is not, we over-map by the
//! alignment and trim the slop off both ends.
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use log::warn;

use crate::class::PAGE_SIZE;

/// Rolling counts of adapter activity.  Relaxed; the consumers are
/// tests and diagnostics, not synchronization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapStats {
    pub maps: u64,
    pub unmaps: u64,
    pub grows: u64,
}

static MAPS: AtomicU64 = AtomicU64::new(0);
static UNMAPS: AtomicU64 = AtomicU64::new(0);
static GROWS: AtomicU64 = AtomicU64::new(0);

/// Next address to suggest to the kernel.  Purely advisory and racy;
/// a stale hint only costs an over-map.
static ADDR_HINT: AtomicUsize = AtomicUsize::new(0);

/// Returns a snapshot of the adapter's call counts.
pub fn map_stats() -> MapStats {
    MapStats {
        maps: MAPS.load(Ordering::Relaxed),
        unmaps: UNMAPS.load(Ordering::Relaxed),
        grows: GROWS.load(Ordering::Relaxed),
    }
}

fn system_page_size() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("magma: unable to find page size: errno={}", errno::errno());
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE_PROBED: usize = {
        let probed = system_page_size();

        // The zone layout is built around 4 KiB pages.
        assert_eq!(probed, PAGE_SIZE, "magma only supports 4 KiB pages");
        probed
    };
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE_PROBED
}

fn raw_map(hint: usize, size: usize) -> Option<NonNull<c_void>> {
    let ptr = unsafe {
        libc::mmap(
            hint as *mut c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };

    MAPS.fetch_add(1, Ordering::Relaxed);
    if ptr == libc::MAP_FAILED {
        None
    } else {
        NonNull::new(ptr)
    }
}

fn raw_unmap(base: *mut c_void, size: usize) {
    UNMAPS.fetch_add(1, Ordering::Relaxed);
    if unsafe { libc::munmap(base, size) } != 0 {
        warn!(
            "munmap failed: {}, addr {:#x}, size {}",
            errno::errno(),
            base as usize,
            size
        );
    }
}

/// Attempts to map `size` bytes aligned to `align`, both multiples of
/// the page size.  Fresh mappings are zero-filled by the kernel; the
/// `zero_hint` merely records that the caller will not rely on that.
pub(crate) fn vmem_alloc(size: usize, align: usize, _zero_hint: bool) -> Option<NonNull<c_void>> {
    debug_assert!(size > 0 && size % page_size() == 0);
    debug_assert!(align.is_power_of_two() && align % page_size() == 0);

    let hint = ADDR_HINT.load(Ordering::Relaxed);
    let first = raw_map(hint, size)?;

    if first.as_ptr() as usize % align == 0 {
        ADDR_HINT.store(first.as_ptr() as usize + size, Ordering::Relaxed);
        return Some(first);
    }

    // Misaligned: give it back and over-map by the alignment, then
    // trim the slop off both ends.
    raw_unmap(first.as_ptr(), size);

    let padded = size.checked_add(align)?;
    let region = raw_map(0, padded)?;
    let base = region.as_ptr() as usize;
    let aligned = (base + align - 1) & !(align - 1);
    let front = aligned - base;
    let back = padded - size - front;

    if front > 0 {
        raw_unmap(region.as_ptr(), front);
    }
    if back > 0 {
        raw_unmap((aligned + size) as *mut c_void, back);
    }

    ADDR_HINT.store(aligned + size, Ordering::Relaxed);
    NonNull::new(aligned as *mut c_void)
}

/// Unmaps exactly `[base, base + size)`.
pub(crate) fn vmem_free(base: NonNull<c_void>, size: usize) {
    debug_assert!(size > 0 && size % page_size() == 0);
    debug_assert!(base.as_ptr() as usize % page_size() == 0);

    raw_unmap(base.as_ptr(), size);
}

/// Best-effort adjacent growth: maps `[base + old_size, base +
/// new_size)` in place.  Failure has no side effects on the original
/// mapping; a mapping that lands anywhere else is immediately
/// returned.
pub(crate) fn vmem_try_grow(base: NonNull<c_void>, old_size: usize, new_size: usize) -> bool {
    debug_assert!(new_size > old_size);
    debug_assert!(old_size % page_size() == 0 && new_size % page_size() == 0);

    let tail = base.as_ptr() as usize + old_size;
    let want = new_size - old_size;

    #[cfg(target_os = "linux")]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED_NOREPLACE;
    #[cfg(not(target_os = "linux"))]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON;

    let ptr = unsafe {
        libc::mmap(
            tail as *mut c_void,
            want,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    };

    GROWS.fetch_add(1, Ordering::Relaxed);
    if ptr == libc::MAP_FAILED {
        return false;
    }

    if ptr as usize != tail {
        // The kernel ignored the hint; undo and report failure.
        raw_unmap(ptr, want);
        return false;
    }

    true
}

/// Tells the kernel the region's contents are disposable.  The
/// mapping stays valid; pages fault back in as zeroes.
pub(crate) fn vmem_advise_free(base: NonNull<c_void>, size: usize) {
    let rc = unsafe { libc::madvise(base.as_ptr(), size, libc::MADV_DONTNEED) };

    if rc != 0 {
        warn!(
            "madvise failed: {}, addr {:#x}, size {}",
            errno::errno(),
            base.as_ptr() as usize,
            size
        );
    }
}
