//! C-ABI exports.  The symbols are prefixed so the crate can link
//! into a process without hijacking its libc; a shim or linker alias
//! can rename them for full interposition.
use std::ffi::c_void;

use crate::api;

#[no_mangle]
pub extern "C" fn magma_malloc(size: usize) -> *mut c_void {
    api::malloc(size)
}

#[no_mangle]
pub extern "C" fn magma_calloc(number: usize, size: usize) -> *mut c_void {
    api::calloc(number, size)
}

/// # Safety
///
/// `ptr` must be null or a live pointer returned by this allocator.
#[no_mangle]
pub unsafe extern "C" fn magma_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    api::realloc(ptr, size)
}

/// # Safety
///
/// `ptr` must be null or a live pointer returned by this allocator.
#[no_mangle]
pub unsafe extern "C" fn magma_free(ptr: *mut c_void) {
    api::free(ptr)
}

#[no_mangle]
pub extern "C" fn magma_aligned_alloc(align: usize, size: usize) -> *mut c_void {
    api::aligned_alloc(align, size)
}

/// # Safety
///
/// `out` must point to writable pointer-sized storage.
#[no_mangle]
pub unsafe extern "C" fn magma_posix_memalign(
    out: *mut *mut c_void,
    align: usize,
    size: usize,
) -> i32 {
    if out.is_null() {
        return libc::EINVAL;
    }

    let mut region: *mut c_void = std::ptr::null_mut();
    let rc = api::posix_memalign(&mut region, align, size);

    if rc == 0 {
        *out = region;
    }
    rc
}

/// # Safety
///
/// `ptr` must be null or a live pointer returned by this allocator.
#[no_mangle]
pub unsafe extern "C" fn magma_malloc_usable_size(ptr: *const c_void) -> usize {
    api::usable_size(ptr)
}
