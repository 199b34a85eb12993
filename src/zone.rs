//! A zone is a 64 KiB region, aligned to its own size, with an
//! in-band header at offset 0 and a packed array of equal chunks
//! after it.  Freed chunks are threaded onto per-page singly linked
//! lists; never-yet-used chunks are carved off a wrapping tail
//! cursor.  Masking any chunk address recovers the owning zone.
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
use std::ptr;
use std::ptr::NonNull;

use crate::class::SizeClass;
use crate::class::PAGE_SHIFT;
use crate::class::ZONE_PAGE_COUNT;
use crate::class::ZONE_SIZE;

/// Sentinel validating that a masked pointer really is a zone.
pub(crate) const ZONE_MAGIC: usize = 0x6d67_7a6e; // "mgzn"

/// The zone's memory is not known to be zero: it was recycled rather
/// than freshly mapped.
pub(crate) const ZF_UNOTZEROD: u32 = 0x0001;

/// Set when the zone is formatted on behalf of a passive allocation.
/// Provenance only; nothing branches on it today.
pub(crate) const ZF_PASSIVE: u32 = 0x0002;

#[repr(C)]
struct FreeChunk {
    next: *mut FreeChunk,
}

#[repr(C)]
pub(crate) struct Zone {
    magic: usize,
    /// Forward link in the owning class's zone list.
    pub next: *mut Zone,
    pub class_index: u32,
    pub flags: u32,
    pub chunk_size: usize,
    pub n_max: u32,
    pub n_free: u32,
    u_index: u32,
    u_end_index: u32,
    first_free_pg: u32,
    _pad: u32,
    base_ptr: *mut u8,
    page_free: [*mut FreeChunk; ZONE_PAGE_COUNT],
}

#[inline]
fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Masks a chunk pointer down to its owning zone.  Exact because
/// zones are `ZONE_SIZE`-aligned with the header at offset 0.
#[inline]
pub(crate) fn zone_of(ptr: *mut c_void) -> *mut Zone {
    ((ptr as usize) & !(ZONE_SIZE - 1)) as *mut Zone
}

/// Formats a fresh or recycled `ZONE_SIZE` region for `sc`.
///
/// The header is padded up to the chunk size when that is a power of
/// two (so chunks are naturally aligned to their own size), and only
/// up to the band's chunking otherwise; padding non-power-of-two
/// chunk sizes any further would waste bytes without improving
/// alignment.
///
/// # Safety
///
/// `region` must point at `ZONE_SIZE` exclusively owned, writable
/// bytes aligned to `ZONE_SIZE`.
pub(crate) unsafe fn format(region: NonNull<c_void>, sc: &SizeClass, flags: u32) -> *mut Zone {
    debug_assert_eq!(region.as_ptr() as usize % ZONE_SIZE, 0);

    let z = region.as_ptr() as *mut Zone;
    let align_to = if sc.size.is_power_of_two() {
        sc.size
    } else {
        sc.chunking
    };
    let off = round_up(std::mem::size_of::<Zone>(), align_to);
    let n_max = (ZONE_SIZE - off) / sc.size;

    ptr::write(
        z,
        Zone {
            magic: ZONE_MAGIC,
            next: ptr::null_mut(),
            class_index: sc.index as u32,
            flags,
            chunk_size: sc.size,
            n_max: n_max as u32,
            n_free: n_max as u32,
            u_index: 0,
            u_end_index: 0,
            first_free_pg: ZONE_PAGE_COUNT as u32,
            _pad: 0,
            base_ptr: (z as *mut u8).add(off),
            page_free: [ptr::null_mut(); ZONE_PAGE_COUNT],
        },
    );

    z
}

impl Zone {
    #[inline]
    pub fn magic_ok(&self) -> bool {
        self.magic == ZONE_MAGIC
    }

    /// Checks that `ptr` is the base of a chunk of this zone.
    pub fn validate_chunk(&self, ptr: *mut c_void) -> Result<(), &'static str> {
        let base = self.base_ptr as usize;
        let addr = ptr as usize;

        if addr < base || addr >= base + self.n_max as usize * self.chunk_size {
            return Err("freed pointer outside the zone's chunk array");
        }
        if (addr - base) % self.chunk_size != 0 {
            return Err("freed pointer does not start a chunk");
        }
        Ok(())
    }

    /// Takes one free chunk, preferring per-page free lists over the
    /// never-used tail.  The boolean is true when the chunk is known
    /// to be zero-filled (a tail chunk of a freshly mapped zone).
    ///
    /// An `Err` is a corrupted header; the caller must release its
    /// locks and abort.
    #[requires(self.n_free > 0)]
    #[ensures(ret.is_ok() -> self.n_free == old(self.n_free) - 1)]
    pub fn take_chunk(&mut self) -> Result<(NonNull<c_void>, bool), &'static str> {
        if self.n_free == 0 {
            return Err("take from exhausted zone");
        }

        // Reused chunks first: they are the warmest.
        let mut pg = self.first_free_pg as usize;
        while pg < ZONE_PAGE_COUNT {
            let head = self.page_free[pg];

            if !head.is_null() {
                self.page_free[pg] = unsafe { (*head).next };

                // Keep the hint exact: skip past drained lists.
                let mut next_pg = pg;
                while next_pg < ZONE_PAGE_COUNT && self.page_free[next_pg].is_null() {
                    next_pg += 1;
                }
                self.first_free_pg = next_pg as u32;

                self.n_free -= 1;
                let chunk = NonNull::new(head as *mut c_void)
                    .ok_or("null chunk on a page free list")?;
                return Ok((chunk, false));
            }
            pg += 1;
        }
        self.first_free_pg = ZONE_PAGE_COUNT as u32;

        // Carve the never-used tail.
        let chunk = unsafe { self.base_ptr.add(self.u_index as usize * self.chunk_size) };

        self.u_index += 1;
        if self.u_index == self.n_max {
            self.u_index = 0;
        }
        self.n_free -= 1;
        if self.u_index == self.u_end_index && self.n_free != 0 {
            return Err("tail cursor wrapped with free chunks outstanding");
        }

        let known_zero = self.flags & ZF_UNOTZEROD == 0;
        let chunk = NonNull::new(chunk as *mut c_void).ok_or("null tail chunk")?;
        Ok((chunk, known_zero))
    }

    /// Returns a chunk to its page's free list.  The results report
    /// whether the zone was exhausted before this free (it needs
    /// relinking) and whether it is now entirely free (it can be
    /// recycled).
    ///
    /// Callers validate `ptr` with `validate_chunk` first.
    #[ensures(self.n_free == old(self.n_free) + 1)]
    pub fn free_chunk(&mut self, ptr: *mut c_void) -> (bool, bool) {
        let pg = (ptr as usize - self as *const Zone as usize) >> PAGE_SHIFT;
        let chunk = ptr as *mut FreeChunk;

        unsafe { (*chunk).next = self.page_free[pg] };
        self.page_free[pg] = chunk;
        if (pg as u32) < self.first_free_pg {
            self.first_free_pg = pg as u32;
        }

        let was_exhausted = self.n_free == 0;
        self.n_free += 1;

        (was_exhausted, self.n_free == self.n_max)
    }

    /// Bytes remaining in the chunk containing `ptr`, which may point
    /// into the middle of the chunk.
    pub fn usable_size(&self, ptr: *const c_void) -> usize {
        let offset = ptr as usize - self.base_ptr as usize;

        self.chunk_size - offset % self.chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::classify;
    use crate::map;

    fn with_scratch_zone(sc: &SizeClass, f: impl FnOnce(&mut Zone)) {
        let _serial = crate::test_util::serialize();
        let region = map::vmem_alloc(ZONE_SIZE, ZONE_SIZE, false).expect("mmap should succeed");

        unsafe {
            let z = format(region, sc, 0);
            f(&mut *z);
        }
        map::vmem_free(region, ZONE_SIZE);
    }

    #[test]
    fn format_geometry() {
        for &size in &[1usize, 24, 112, 256, 1000, 4096, 8192, 16383] {
            let sc = classify(size);

            with_scratch_zone(&sc, |z| {
                assert!(z.magic_ok());
                assert_eq!(z.chunk_size, sc.size);
                assert_eq!(z.n_free, z.n_max);
                assert!(z.n_max >= 2, "chunk size {}", sc.size);

                let base = z.base_ptr as usize;
                let align = if sc.size.is_power_of_two() {
                    sc.size
                } else {
                    sc.chunking
                };
                assert_eq!(base % align, 0);

                // The chunk array must fit in the zone.
                let end = base + z.n_max as usize * sc.size;
                assert!(end <= z as *const Zone as usize + ZONE_SIZE);
            });
        }
    }

    #[test]
    fn carve_free_carve() {
        let sc = classify(100);

        with_scratch_zone(&sc, |z| {
            let n_max = z.n_max;

            // Carve everything; all addresses distinct and aligned.
            let mut chunks = Vec::new();
            for _ in 0..n_max {
                let (chunk, zeroed) = z.take_chunk().expect("zone has room");
                assert!(zeroed, "fresh zone tail must be known-zero");
                assert_eq!(chunk.as_ptr() as usize % sc.chunking, 0);
                chunks.push(chunk);
            }
            assert_eq!(z.n_free, 0);

            // Free everything; the zone ends fully free.
            for (i, chunk) in chunks.iter().enumerate() {
                z.validate_chunk(chunk.as_ptr()).expect("chunk is valid");
                let (was_exhausted, all_free) = z.free_chunk(chunk.as_ptr());
                assert_eq!(was_exhausted, i == 0);
                assert_eq!(all_free, i + 1 == n_max as usize);
            }
            assert_eq!(z.n_free, n_max);

            // Chunks now come from the free lists, lowest page first,
            // and are no longer known-zero.
            let (chunk, zeroed) = z.take_chunk().expect("zone has room");
            assert!(!zeroed);
            let pg = (chunk.as_ptr() as usize - z as *const Zone as usize) >> PAGE_SHIFT;
            assert_eq!(pg, 0);
        });
    }

    #[test]
    fn rejects_foreign_pointers() {
        let sc = classify(64);

        with_scratch_zone(&sc, |z| {
            let (chunk, _) = z.take_chunk().expect("zone has room");
            let inside = chunk.as_ptr();

            assert!(z.validate_chunk(inside).is_ok());
            assert!(z
                .validate_chunk((inside as usize + 1) as *mut c_void)
                .is_err());
            assert!(z
                .validate_chunk((z.base_ptr as usize + ZONE_SIZE) as *mut c_void)
                .is_err());
        });
    }

    #[test]
    fn usable_size_within_chunk() {
        let sc = classify(24);

        with_scratch_zone(&sc, |z| {
            let (chunk, _) = z.take_chunk().expect("zone has room");

            assert_eq!(z.usable_size(chunk.as_ptr()), sc.size);
            let interior = (chunk.as_ptr() as usize + 5) as *const c_void;
            assert_eq!(z.usable_size(interior), sc.size - 5);
        });
    }
}
