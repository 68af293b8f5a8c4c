#![no_main]
use libfuzzer_sys::fuzz_target;
use tinyheap_core::{Heap, HeapKind, MemoryRegion, MmConfig};

// Unaligned start and odd size so trimming is exercised too.
const REGION: MemoryRegion = MemoryRegion::user(0x4000_0003, 16 * 1024 + 5, 0);

fuzz_target!(|data: &[u8]| {
    let config = MmConfig {
        lifecycle_log_capacity: 0,
        assert_contract: false,
        ..MmConfig::default()
    };
    let heap = Heap::new(HeapKind::User, 0, &[REGION], &config);
    let mut live: Vec<usize> = Vec::new();

    for chunk in data.chunks_exact(4) {
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        match chunk[0] % 5 {
            0 => {
                if let Ok(ptr) = heap.allocate(size) {
                    live.push(ptr);
                }
            }
            1 => {
                let alignment = 1usize << (chunk[3] % 13);
                if let Ok(ptr) = heap.memalign(alignment, size) {
                    assert_eq!(ptr % alignment, 0);
                    live.push(ptr);
                }
            }
            2 => {
                if !live.is_empty() {
                    let idx = chunk[3] as usize % live.len();
                    heap.free(live.swap_remove(idx));
                }
            }
            3 => {
                if !live.is_empty() {
                    let idx = chunk[3] as usize % live.len();
                    if let Ok(moved) = heap.realloc(live[idx], size, |_, _, _| {}) {
                        live[idx] = moved;
                    }
                }
            }
            _ => {
                // Odd addresses are never payloads.
                assert!(heap.try_free((REGION.start + size) | 1).is_err());
            }
        }
        let info = heap.info();
        assert!(info.is_conserved());
        assert_eq!(info.live_allocations, live.len());
    }

    for ptr in live {
        heap.free(ptr);
    }
    assert_eq!(heap.info().blocks, 1);
});
