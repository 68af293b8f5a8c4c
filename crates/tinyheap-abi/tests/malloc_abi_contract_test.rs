//! C-ABI contract tests over leaked host memory.
//!
//! All tests share one process-wide manager, installed on first use, so
//! assertions never depend on which block a concurrent test took.

use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::{Arc, OnceLock};

use tinyheap_abi::malloc_abi::{
    tinyheap_calloc, tinyheap_free, tinyheap_init, tinyheap_kmm_free, tinyheap_kmm_malloc,
    tinyheap_kumm_free, tinyheap_kumm_malloc, tinyheap_malloc, tinyheap_malloc_at,
    tinyheap_malloc_traced, tinyheap_memalign, tinyheap_memalign_at, tinyheap_posix_memalign,
    tinyheap_realloc, tinyheap_usable_size, tinyheap_zalloc,
};
use tinyheap_abi::{InitStatus, TinyheapRegion};
use tinyheap_core::{HostContext, MemoryManager, MmConfig, RegionDescriptor};

const HEAP_BYTES: usize = 256 * 1024;

fn manager() -> &'static MemoryManager {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let arena: &'static mut [u8] = Box::leak(vec![0u8; 2 * HEAP_BYTES + 64].into_boxed_slice());
        let base = (arena.as_mut_ptr() as usize + 63) & !63;
        let regions = [
            RegionDescriptor::new(base, HEAP_BYTES, 0),
            RegionDescriptor::new(base + HEAP_BYTES, HEAP_BYTES, 1),
        ];
        let mm = MemoryManager::new(
            MmConfig::flat(2)
                .with_site_tracking(true)
                .with_contract_assertions(false),
            &regions,
            &[],
            Arc::new(HostContext::unprivileged()),
        )
        .expect("valid config");
        assert!(tinyheap_abi::install(mm).is_ok(), "installed twice");
    });
    tinyheap_abi::manager().expect("installed")
}

#[test]
fn malloc_free_round_trip() {
    manager();
    let p = unsafe { tinyheap_malloc(100) };
    assert!(!p.is_null());
    assert_eq!(p as usize % 8, 0);
    assert!(unsafe { tinyheap_usable_size(p) } >= 100);
    // SAFETY: p is a live 100-byte block.
    unsafe { ptr::write_bytes(p.cast::<u8>(), 0x5A, 100) };
    unsafe { tinyheap_free(p) };
    unsafe { tinyheap_free(ptr::null_mut()) };
    assert_eq!(unsafe { tinyheap_usable_size(ptr::null_mut()) }, 0);
}

#[test]
fn calloc_and_zalloc_return_zeroed_memory() {
    manager();
    let dirty = unsafe { tinyheap_malloc(256) };
    // SAFETY: dirty is a live 256-byte block.
    unsafe { ptr::write_bytes(dirty.cast::<u8>(), 0xFF, 256) };
    unsafe { tinyheap_free(dirty) };

    let c = unsafe { tinyheap_calloc(32, 8) };
    assert!(!c.is_null());
    // SAFETY: c is a live 256-byte block.
    let bytes = unsafe { std::slice::from_raw_parts(c.cast::<u8>(), 256) };
    assert!(bytes.iter().all(|&b| b == 0));

    let z = unsafe { tinyheap_zalloc(48) };
    // SAFETY: z is a live 48-byte block.
    let bytes = unsafe { std::slice::from_raw_parts(z.cast::<u8>(), 48) };
    assert!(bytes.iter().all(|&b| b == 0));

    assert!(unsafe { tinyheap_calloc(usize::MAX, 2) }.is_null());
    unsafe {
        tinyheap_free(c);
        tinyheap_free(z);
    }
}

#[test]
fn realloc_preserves_contents() {
    manager();
    let p = unsafe { tinyheap_malloc(64) }.cast::<u8>();
    let fence = unsafe { tinyheap_malloc(16) };
    for i in 0..64 {
        // SAFETY: p is a live 64-byte block.
        unsafe { p.add(i).write(i as u8) };
    }
    let q = unsafe { tinyheap_realloc(p.cast(), 8192) }.cast::<u8>();
    assert!(!q.is_null());
    // SAFETY: q is a live block of at least 8192 bytes.
    let bytes = unsafe { std::slice::from_raw_parts(q, 64) };
    assert_eq!(bytes, (0..64).collect::<Vec<u8>>().as_slice());

    assert!(unsafe { tinyheap_realloc(q.cast(), usize::MAX / 2) }.is_null());
    // A failed realloc leaves the block live.
    assert!(unsafe { tinyheap_usable_size(q.cast()) } >= 8192);

    assert!(unsafe { tinyheap_realloc(q.cast(), 0) }.is_null());
    let fresh = unsafe { tinyheap_realloc(ptr::null_mut(), 24) };
    assert!(!fresh.is_null());
    unsafe {
        tinyheap_free(fresh);
        tinyheap_free(fence);
    }
}

#[test]
fn aligned_entry_points() {
    manager();
    for alignment in [16usize, 64, 256, 4096] {
        let p = unsafe { tinyheap_memalign(alignment, 100) };
        assert!(!p.is_null());
        assert_eq!(p as usize % alignment, 0);
        unsafe { tinyheap_free(p) };
    }
    assert!(unsafe { tinyheap_memalign(48, 100) }.is_null());

    let mut out: *mut c_void = ptr::null_mut();
    assert_eq!(unsafe { tinyheap_posix_memalign(&mut out, 128, 40) }, 0);
    assert_eq!(out as usize % 128, 0);
    unsafe { tinyheap_free(out) };
    assert_eq!(
        unsafe { tinyheap_posix_memalign(&mut out, 4, 40) },
        libc::EINVAL
    );
    assert_eq!(
        unsafe { tinyheap_posix_memalign(ptr::null_mut(), 64, 40) },
        libc::EINVAL
    );
    assert_eq!(
        unsafe { tinyheap_posix_memalign(&mut out, 64, 4 * HEAP_BYTES) },
        libc::ENOMEM
    );
}

#[test]
fn targeted_entry_points_reject_bad_indices() {
    let mm = manager();
    assert!(unsafe { tinyheap_memalign_at(5, 16, 10) }.is_null());
    assert!(unsafe { tinyheap_memalign_at(-1, 16, 10) }.is_null());
    assert!(unsafe { tinyheap_malloc_at(2, 10) }.is_null());

    let p = unsafe { tinyheap_memalign_at(1, 64, 100) };
    assert!(!p.is_null());
    assert_eq!(p as usize % 64, 0);
    assert!(mm.heaps()[1].owns(p as usize));
    unsafe { tinyheap_free(p) };
}

#[test]
fn kernel_entry_points_share_the_flat_heaps() {
    let mm = manager();
    let k = unsafe { tinyheap_kmm_malloc(40) };
    let u = unsafe { tinyheap_kumm_malloc(40) };
    assert!(!k.is_null() && !u.is_null());
    assert!(mm.heaps().iter().any(|h| h.owns(k as usize)));
    unsafe {
        tinyheap_kmm_free(k);
        tinyheap_kumm_free(u);
    }
}

#[test]
fn traced_allocations_report_the_return_address() {
    let mm = manager();
    let p = unsafe { tinyheap_malloc_traced(72, 0xDEAD_BEEF_usize as *const c_void) };
    assert!(!p.is_null());
    let reports = serde_json::to_value(mm.site_reports()).expect("serialize");
    let found = reports
        .as_array()
        .expect("array")
        .iter()
        .flat_map(|r| r["entries"].as_array().cloned().unwrap_or_default())
        .any(|e| e["ptr"] == p as usize && e["site"] == "0xdeadbeef" && e["size"] == 72);
    assert!(found, "site missing: {reports}");
    unsafe { tinyheap_free(p) };
}

#[test]
fn init_after_install_is_refused() {
    manager();
    let region = TinyheapRegion {
        start: 0x7000_0000,
        size: 4096,
        heap_index: 0,
    };
    assert_eq!(
        unsafe { tinyheap_init(&region, 1, 1) },
        c_int::from(InitStatus::AlreadyInitialized)
    );
    assert_eq!(
        unsafe { tinyheap_init(ptr::null(), 0, 1) },
        c_int::from(InitStatus::NullRegions)
    );
}
