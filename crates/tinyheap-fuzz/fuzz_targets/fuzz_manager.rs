#![no_main]
use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use tinyheap_core::{HostContext, MemoryManager, MmConfig, RegionDescriptor};

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    // First byte picks the heap shape: 1..=4 heaps of 512..=8192 bytes.
    let heaps = 1 + usize::from(data[0] % 4);
    let heap_bytes = 512usize << (data[1] % 5);
    let regions: Vec<RegionDescriptor> = (0..heaps)
        .map(|i| RegionDescriptor::new(0x2000_0000 + i * 0x10_0000, heap_bytes, i))
        .collect();
    let config = MmConfig {
        lifecycle_log_capacity: 16,
        assert_contract: false,
        ..MmConfig::flat(heaps)
    };
    let Ok(mm) = MemoryManager::new(config, &regions, &[], Arc::new(HostContext::unprivileged()))
    else {
        return;
    };

    let mut live: Vec<usize> = Vec::new();
    for chunk in data[2..].chunks_exact(3) {
        let size = usize::from(chunk[1]) * 8;
        match chunk[0] % 6 {
            0 => live.extend(mm.malloc(size).ok()),
            1 => {
                let alignment = 1usize << (chunk[2] % 10);
                if let Ok(ptr) = mm.memalign(alignment, size) {
                    assert_eq!(ptr % alignment, 0);
                    live.push(ptr);
                }
            }
            2 => {
                let index = usize::from(chunk[2] % 6);
                if let Ok(ptr) = mm.malloc_at(index, size) {
                    assert!(mm.heaps()[index].owns(ptr));
                    live.push(ptr);
                }
            }
            3 => live.extend(mm.calloc(usize::from(chunk[2]), size).ok()),
            4 if !live.is_empty() => {
                let idx = usize::from(chunk[2]) % live.len();
                mm.free(live.swap_remove(idx));
            }
            _ if !live.is_empty() => {
                let idx = usize::from(chunk[2]) % live.len();
                if let Ok(Some(moved)) = mm.realloc(live[idx], size.max(1), |_, _, _| {}) {
                    live[idx] = moved;
                }
            }
            _ => {}
        }
    }

    assert!(mm.heap_info().iter().all(|info| info.is_conserved()));
    for ptr in live {
        mm.free(ptr);
    }
    for info in mm.heap_info() {
        assert_eq!(info.live_allocations, 0);
    }
});
