//! Shared fixtures for the tinyheap benches.

use std::sync::Arc;

use tinyheap_core::{Heap, HeapKind, HostContext, MemoryManager, MemoryRegion, MmConfig, RegionDescriptor};

/// Synthetic address where bench regions start. Heaps never touch the
/// memory they manage, so no backing buffer is needed.
pub const BENCH_BASE: usize = 0x1000_0000;

/// One user heap over a single `bytes`-sized region, lifecycle logging off.
#[must_use]
pub fn bench_heap(bytes: usize) -> Heap {
    let config = MmConfig {
        lifecycle_log_capacity: 0,
        assert_contract: false,
        ..MmConfig::default()
    };
    Heap::new(
        HeapKind::User,
        0,
        &[MemoryRegion::user(BENCH_BASE, bytes, 0)],
        &config,
    )
}

/// Flat manager over `heaps` equally sized heaps.
///
/// # Panics
///
/// Panics if the generated region table is rejected.
#[must_use]
pub fn bench_manager(heaps: usize, bytes_per_heap: usize) -> MemoryManager {
    let regions: Vec<RegionDescriptor> = (0..heaps)
        .map(|i| RegionDescriptor::new(BENCH_BASE + i * bytes_per_heap, bytes_per_heap, i))
        .collect();
    let config = MmConfig {
        lifecycle_log_capacity: 0,
        assert_contract: false,
        ..MmConfig::flat(heaps)
    };
    match MemoryManager::new(config, &regions, &[], Arc::new(HostContext::unprivileged())) {
        Ok(mm) => mm,
        Err(err) => panic!("bench region table rejected: {err}"),
    }
}
