//! magma is a drop-in heap allocator: the C-family interface
//! (`malloc`, `calloc`, `realloc`, `free`, `aligned_alloc`,
//! `posix_memalign`, `malloc_usable_size`) over a two-level slab
//! engine.  Sub-16 KiB requests map onto 72 size classes served from
//! 64 KiB zones, fronted by per-thread magazine pairs that cycle
//! through a central depot; larger requests get their own mappings,
//! tracked in a sharded hash with a small reuse cache and periodic
//! reclamation of over-mapped tails.
mod api;
mod big;
mod cache;
mod class;
mod depot;
mod ffi;
mod fork;
mod magazine;
mod map;
mod options;
mod rack;
mod slab;
mod sync;
mod zone;

pub use api::aligned_alloc;
pub use api::calloc;
pub use api::free;
pub use api::malloc;
pub use api::memalign;
pub use api::posix_memalign;
pub use api::realloc;
pub use api::usable_size;
pub use api::Magma;
pub use map::map_stats;
pub use map::MapStats;
pub use options::set_trace_hook;
pub use options::TraceHook;
pub use options::TraceOp;

/// Fatal internal inconsistency: one line of diagnostic, then abort.
/// Callers drop any lock they hold first, so a crash handler that
/// allocates cannot wedge on it.
pub(crate) fn die(msg: &str, addr: usize) -> ! {
    eprintln!("magma: {} (addr={:#x})", msg, addr);
    std::process::abort();
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::Mutex;
    use std::sync::MutexGuard;

    lazy_static::lazy_static! {
        static ref SERIAL: Mutex<()> = Mutex::new(());
    }

    /// Tests that assert on global allocator state (addresses coming
    /// back, mapping counters, the excess pool) take this lock so
    /// they observe their own traffic only.
    pub fn serialize() -> MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
