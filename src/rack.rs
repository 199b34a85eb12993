//! The rack recycles zone-sized regions between size classes.  A
//! single process-wide magazine of freed zones absorbs the
//! release/acquire ping-pong of a class draining and refilling; only
//! when it overflows do zones go back to the VM adapter, a batch at a
//! time.
use std::ffi::c_void;
use std::ptr;
use std::ptr::NonNull;

use static_assertions::const_assert;

use crate::class::ZONE_SIZE;
use crate::map;
use crate::options;
use crate::sync::SpinMutex;
use crate::zone::Zone;

pub(crate) const M_ZONE_ROUNDS: usize = 64;

/// When the rack is full, this many zones are unmapped in one batch;
/// the hysteresis keeps a steady-state workload from unmapping on
/// every release.
pub(crate) const M_ZONE_HYSTERESIS: usize = 32;

const_assert!(M_ZONE_HYSTERESIS < M_ZONE_ROUNDS);

struct ZoneRack {
    rounds: usize,
    zones: [*mut c_void; M_ZONE_ROUNDS],
}

// Zones in the rack are owned by the rack alone.
unsafe impl Send for ZoneRack {}

static RACK: SpinMutex<ZoneRack> = SpinMutex::new(ZoneRack {
    rounds: 0,
    zones: [ptr::null_mut(); M_ZONE_ROUNDS],
});

/// Returns a `ZONE_SIZE` region aligned to `ZONE_SIZE`, recycled when
/// possible.  The boolean is true for recycled regions, whose
/// contents must not be assumed zero.
pub(crate) fn zone_acquire() -> Option<(NonNull<c_void>, bool)> {
    {
        let mut rack = RACK.lock();

        if rack.rounds > 0 {
            rack.rounds -= 1;
            let region = rack.zones[rack.rounds];
            return NonNull::new(region).map(|r| (r, true));
        }
    }

    map::vmem_alloc(ZONE_SIZE, ZONE_SIZE, true).map(|region| (region, false))
}

/// Retires a fully free zone.
///
/// # Safety
///
/// `z` must be an unlinked zone with no live chunks; no other thread
/// may hold a reference to it.
pub(crate) unsafe fn zone_release(z: *mut Zone) {
    // A stale header must never validate as a live zone.
    ptr::write_bytes(z as *mut u8, 0, std::mem::size_of::<Zone>());

    let region = match NonNull::new(z as *mut c_void) {
        Some(region) => region,
        None => return,
    };

    if options::madvise_freed() {
        map::vmem_advise_free(region, ZONE_SIZE);
    }

    let mut victims = [ptr::null_mut::<c_void>(); M_ZONE_HYSTERESIS];
    let mut n_victims = 0;

    {
        let mut rack = RACK.lock();

        if rack.rounds == M_ZONE_ROUNDS {
            while n_victims < M_ZONE_HYSTERESIS {
                rack.rounds -= 1;
                victims[n_victims] = rack.zones[rack.rounds];
                n_victims += 1;
            }
        }

        let slot = rack.rounds;
        rack.zones[slot] = region.as_ptr();
        rack.rounds += 1;
    }

    // Unmap the overflow batch outside the lock.
    for victim in &victims[..n_victims] {
        if let Some(victim) = NonNull::new(*victim) {
            map::vmem_free(victim, ZONE_SIZE);
        }
    }
}

/// Fork hook support: the rack lock is taken after the depot lock.
pub(crate) unsafe fn raw_lock() {
    RACK.raw_lock();
}

pub(crate) unsafe fn raw_unlock() {
    RACK.raw_unlock();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn recycles_released_zones() {
        let _serial = test_util::serialize();

        let (region, _) = zone_acquire().expect("mmap should succeed");

        unsafe { zone_release(region.as_ptr() as *mut Zone) };

        // The very next acquire must hit the rack, not the kernel.
        let before = map::map_stats();
        let (again, recycled) = zone_acquire().expect("rack should have a zone");
        let after = map::map_stats();

        assert!(recycled);
        assert_eq!(again, region);
        assert_eq!(before.maps, after.maps);

        unsafe { zone_release(again.as_ptr() as *mut Zone) };
    }
}
