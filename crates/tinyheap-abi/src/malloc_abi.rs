//! ABI layer for the tinyheap malloc family.
//!
//! Every export resolves the process-wide manager, maps `MmResult` onto the C
//! conventions (null / errno codes) and does the memory writes the core
//! leaves to its caller. Nothing here panics on bad input: invalid
//! alignments and negative heap indices fail like exhaustion does.

use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::Arc;

use libc::{EINVAL, ENOMEM};
use tinyheap_core::{HostContext, MemoryManager, MmConfig, MmResult, RegionDescriptor};

use crate::runtime::{self, InitStatus, TinyheapRegion};

#[inline]
fn to_ptr(result: MmResult<usize>) -> *mut c_void {
    match result {
        Ok(addr) => addr as *mut c_void,
        Err(_) => ptr::null_mut(),
    }
}

#[inline]
fn valid_alignment(alignment: usize) -> bool {
    alignment.is_power_of_two()
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

/// Builds and installs a flat manager over `count` user regions split into
/// `heap_count` heaps. `TINYHEAP_TRACK_SITES` and `TINYHEAP_TOPOLOGY` are
/// honoured; a topology that needs kernel regions is rejected because none
/// can be passed here.
///
/// Returns an [`InitStatus`] code.
///
/// # Safety
///
/// `regions` must point to `count` readable `TinyheapRegion` values, and
/// every described region must be memory the caller hands over to tinyheap
/// for the rest of the process.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_init(
    regions: *const TinyheapRegion,
    count: usize,
    heap_count: usize,
) -> c_int {
    if regions.is_null() {
        return InitStatus::NullRegions.into();
    }
    if runtime::manager().is_some() {
        return InitStatus::AlreadyInitialized.into();
    }
    // SAFETY: caller guarantees `regions` points to `count` readable entries.
    let table = unsafe { std::slice::from_raw_parts(regions, count) };
    let descriptors: Vec<RegionDescriptor> = table.iter().copied().map(Into::into).collect();

    let config = MmConfig::flat(heap_count).with_env_overrides();
    let Ok(manager) = MemoryManager::new(
        config,
        &descriptors,
        &[],
        Arc::new(HostContext::unprivileged()),
    ) else {
        return InitStatus::InvalidConfig.into();
    };
    match runtime::install(manager) {
        Ok(()) => InitStatus::Ok.into(),
        Err(_) => InitStatus::AlreadyInitialized.into(),
    }
}

// ---------------------------------------------------------------------------
// malloc / free
// ---------------------------------------------------------------------------

/// `malloc` -- allocates `size` bytes from the heap selected for the caller.
///
/// Returns null on failure or before initialization.
///
/// # Safety
///
/// Caller must eventually `tinyheap_free` the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_malloc(size: usize) -> *mut c_void {
    let Some(mm) = runtime::manager() else {
        return ptr::null_mut();
    };
    to_ptr(mm.malloc(size))
}

/// `malloc` attributing the allocation to `return_address` when site
/// tracking is enabled.
///
/// # Safety
///
/// Same contract as [`tinyheap_malloc`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_malloc_traced(
    size: usize,
    return_address: *const c_void,
) -> *mut c_void {
    let Some(mm) = runtime::manager() else {
        return ptr::null_mut();
    };
    to_ptr(mm.malloc_traced(size, return_address as usize))
}

/// `free` -- returns a block to the heap that owns it. Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by a `tinyheap_*`
/// allocation function.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_free(ptr: *mut c_void) {
    if let Some(mm) = runtime::manager() {
        mm.free(ptr as usize);
    }
}

/// Usable bytes of a live allocation, 0 for null or unknown pointers.
///
/// # Safety
///
/// `ptr` is only compared against heap bookkeeping, never dereferenced.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_usable_size(ptr: *mut c_void) -> usize {
    runtime::manager()
        .and_then(|mm| mm.usable_size(ptr as usize))
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// calloc / zalloc / realloc
// ---------------------------------------------------------------------------

/// `calloc` -- allocates `nmemb * size` zeroed bytes; null on overflow.
///
/// # Safety
///
/// Caller must eventually `tinyheap_free` the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(mm) = runtime::manager() else {
        return ptr::null_mut();
    };
    match mm.calloc(nmemb, size) {
        Ok(addr) => {
            let out = addr as *mut u8;
            // SAFETY: the block holds at least `nmemb * size` bytes (checked
            // for overflow by the manager) inside installed region memory.
            unsafe { ptr::write_bytes(out, 0, nmemb * size) };
            out.cast()
        }
        Err(_) => ptr::null_mut(),
    }
}

/// `zalloc` -- allocates `size` zeroed bytes.
///
/// # Safety
///
/// Caller must eventually `tinyheap_free` the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_zalloc(size: usize) -> *mut c_void {
    let Some(mm) = runtime::manager() else {
        return ptr::null_mut();
    };
    match mm.zalloc(size) {
        Ok(addr) => {
            let out = addr as *mut u8;
            // SAFETY: the block holds at least `size` bytes of installed region memory.
            unsafe { ptr::write_bytes(out, 0, size) };
            out.cast()
        }
        Err(_) => ptr::null_mut(),
    }
}

/// `realloc` -- resizes a block, moving and copying its contents when it
/// cannot stay in place. Null `ptr` allocates; zero `size` frees and returns
/// null. On failure the original block is untouched and null is returned.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by a `tinyheap_*`
/// allocation function.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let Some(mm) = runtime::manager() else {
        return ptr::null_mut();
    };
    let result = mm.realloc(ptr as usize, size, |src, dst, len| {
        // SAFETY: `src` is live for `len` bytes and `dst` is a distinct,
        // freshly allocated block of at least `len` bytes.
        unsafe { ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len) };
    });
    match result {
        Ok(Some(addr)) => addr as *mut c_void,
        Ok(None) | Err(_) => ptr::null_mut(),
    }
}

// ---------------------------------------------------------------------------
// memalign / posix_memalign
// ---------------------------------------------------------------------------

/// `memalign` -- allocates `size` bytes aligned to `alignment`, which must be
/// a power of two (null otherwise).
///
/// # Safety
///
/// Caller must eventually `tinyheap_free` the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_memalign(alignment: usize, size: usize) -> *mut c_void {
    let Some(mm) = runtime::manager() else {
        return ptr::null_mut();
    };
    if !valid_alignment(alignment) {
        return ptr::null_mut();
    }
    to_ptr(mm.memalign(alignment, size))
}

/// [`tinyheap_memalign`] attributing the allocation to `return_address`.
///
/// # Safety
///
/// Same contract as [`tinyheap_memalign`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_memalign_traced(
    alignment: usize,
    size: usize,
    return_address: *const c_void,
) -> *mut c_void {
    let Some(mm) = runtime::manager() else {
        return ptr::null_mut();
    };
    if !valid_alignment(alignment) {
        return ptr::null_mut();
    }
    to_ptr(mm.memalign_traced(alignment, size, return_address as usize))
}

/// `posix_memalign` -- stores an aligned block in `*memptr`.
///
/// Returns 0 on success, `EINVAL` for a bad alignment or null `memptr`,
/// `ENOMEM` when no heap can serve the request.
///
/// # Safety
///
/// `memptr` must be a valid pointer to a writable `*mut c_void`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    // Requirements: alignment power of 2, multiple of sizeof(void*)
    if memptr.is_null()
        || !valid_alignment(alignment)
        || !alignment.is_multiple_of(std::mem::size_of::<usize>())
    {
        return EINVAL;
    }
    let Some(mm) = runtime::manager() else {
        return ENOMEM;
    };
    match mm.memalign(alignment, size) {
        Ok(addr) => {
            // SAFETY: caller guarantees `memptr` points to writable `*mut c_void`.
            unsafe { *memptr = addr as *mut c_void };
            0
        }
        Err(_) => ENOMEM,
    }
}

// ---------------------------------------------------------------------------
// targeted heaps
// ---------------------------------------------------------------------------

/// Allocates from user heap `heap_index` only; null when the index is out of
/// range or the heap is full.
///
/// # Safety
///
/// Caller must eventually `tinyheap_free` the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_malloc_at(heap_index: c_int, size: usize) -> *mut c_void {
    let (Some(mm), Ok(index)) = (runtime::manager(), usize::try_from(heap_index)) else {
        return ptr::null_mut();
    };
    to_ptr(mm.malloc_at(index, size))
}

/// Aligned allocation from user heap `heap_index` only, with no fallback.
///
/// # Safety
///
/// Caller must eventually `tinyheap_free` the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_memalign_at(
    heap_index: c_int,
    alignment: usize,
    size: usize,
) -> *mut c_void {
    let (Some(mm), Ok(index)) = (runtime::manager(), usize::try_from(heap_index)) else {
        return ptr::null_mut();
    };
    if !valid_alignment(alignment) {
        return ptr::null_mut();
    }
    to_ptr(mm.memalign_at(index, alignment, size))
}

// ---------------------------------------------------------------------------
// kernel-side allocation
// ---------------------------------------------------------------------------

/// Allocates from the kernel heap group (the shared group in a flat build).
///
/// # Safety
///
/// Caller must eventually `tinyheap_kmm_free` the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_kmm_malloc(size: usize) -> *mut c_void {
    let Some(mm) = runtime::manager() else {
        return ptr::null_mut();
    };
    to_ptr(mm.kmm_malloc(size))
}

/// # Safety
///
/// Caller must eventually `tinyheap_kmm_free` the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_kmm_memalign(alignment: usize, size: usize) -> *mut c_void {
    let Some(mm) = runtime::manager() else {
        return ptr::null_mut();
    };
    if !valid_alignment(alignment) {
        return ptr::null_mut();
    }
    to_ptr(mm.kmm_memalign(alignment, size))
}

/// # Safety
///
/// `ptr` must be null or a live pointer from the kernel heap group.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_kmm_free(ptr: *mut c_void) {
    if let Some(mm) = runtime::manager() {
        mm.kmm_free(ptr as usize);
    }
}

/// Kernel code allocating memory for user space: always the shared user group.
///
/// # Safety
///
/// Caller must eventually `tinyheap_kumm_free` the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_kumm_malloc(size: usize) -> *mut c_void {
    let Some(mm) = runtime::manager() else {
        return ptr::null_mut();
    };
    to_ptr(mm.kumm_malloc(size))
}

/// # Safety
///
/// `ptr` must be null or a live pointer from the shared user group.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tinyheap_kumm_free(ptr: *mut c_void) {
    if let Some(mm) = runtime::manager() {
        mm.kumm_free(ptr as usize);
    }
}
