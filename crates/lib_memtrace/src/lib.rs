//! Companion crate to [`memtrace`].  This crate compiles into a dynamic library that can be
//! loaded via `LD_PRELOAD` to intercept the `malloc` family of the program and redirect it to
//! the `memtrace` allocation tracker.  It also exports the entry points that instrumented code
//! calls for every memory access.

use std::{ffi::CStr, mem};

use libc::{c_char, c_int, c_void, size_t, EINVAL, ENOMEM};
use memtrace::{report_function, with_tracer, TraceAllocator};

/// When this library is loaded with `LD_PRELOAD`, this `malloc` implementation
/// records every block allocated by the program before handing it out.
///
/// # Safety
///
/// Same contract as C `malloc`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    TraceAllocator::malloc(size)
}

/// # Safety
///
/// Same contract as C `calloc`.
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    TraceAllocator::calloc(nmemb, size)
}

/// # Safety
///
/// Same contract as C `memalign`.
#[no_mangle]
pub unsafe extern "C" fn memalign(align: size_t, size: size_t) -> *mut c_void {
    TraceAllocator::memalign(align, size)
}

/// # Safety
///
/// Same contract as C `aligned_alloc`.
#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(align: size_t, size: size_t) -> *mut c_void {
    TraceAllocator::memalign(align, size)
}

/// # Safety
///
/// Same contract as C `posix_memalign`.
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    align: size_t,
    size: size_t,
) -> c_int {
    if !align.is_power_of_two() || align % mem::size_of::<*mut c_void>() != 0 {
        return EINVAL;
    }
    let ptr = TraceAllocator::memalign(align, size);
    if ptr.is_null() {
        return ENOMEM;
    }
    *memptr = ptr;
    0
}

/// # Safety
///
/// Same contract as C `realloc`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    TraceAllocator::realloc(ptr, size)
}

/// # Safety
///
/// Same contract as C `free`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    TraceAllocator::free(ptr)
}

/// # Safety
///
/// Same contract as C `malloc_usable_size`.
#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> size_t {
    TraceAllocator::usable_size(ptr)
}

/// Instruction fetch of `size` bytes at `addr`.
#[no_mangle]
pub extern "C" fn memtrace_on_fetch(addr: usize, size: usize) {
    with_tracer(|t| t.on_fetch(addr, size));
}

/// Load of `size` bytes at `addr`.
#[no_mangle]
pub extern "C" fn memtrace_on_load(addr: usize, size: usize) {
    with_tracer(|t| t.on_load(addr, size));
}

/// Store of `size` bytes at `addr`.
#[no_mangle]
pub extern "C" fn memtrace_on_store(addr: usize, size: usize) {
    with_tracer(|t| t.on_store(addr, size));
}

/// Load and store of the same `size` bytes at `addr`.
#[no_mangle]
pub extern "C" fn memtrace_on_modify(addr: usize, size: usize) {
    with_tracer(|t| t.on_modify(addr, size));
}

/// Execution entered the function `name`.
///
/// # Safety
///
/// `name` must point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn memtrace_on_function(name: *const c_char) {
    if name.is_null() {
        return;
    }
    report_function(CStr::from_ptr(name));
}
