//! Concurrent callers across a multi-heap manager.

use std::sync::Arc;
use std::thread;

use tinyheap_core::{HostContext, MemoryManager, MmConfig, RegionDescriptor};

#[derive(Clone, Copy, Debug)]
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }
}

#[test]
fn threads_churn_without_breaking_accounting() {
    const THREADS: u64 = 8;
    const ROUNDS: usize = 1_500;

    let regions: Vec<RegionDescriptor> = (0..4)
        .map(|i| RegionDescriptor::new(0x100_0000 * (i + 1), 64 * 1024, i))
        .collect();
    let mm = Arc::new(
        MemoryManager::new(
            MmConfig::flat(4).with_contract_assertions(true),
            &regions,
            &[],
            Arc::new(HostContext::unprivileged()),
        )
        .expect("valid config"),
    );

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let mm = Arc::clone(&mm);
            thread::spawn(move || {
                let mut rng = Lcg(0x9E37_79B9 ^ t);
                let mut live: Vec<(usize, usize)> = Vec::new();
                for _ in 0..ROUNDS {
                    match rng.next() % 4 {
                        0 | 1 => {
                            let size = (rng.next() % 512) as usize;
                            if let Ok(ptr) = mm.malloc(size) {
                                live.push((ptr, size));
                            }
                        }
                        2 => {
                            let alignment = 1usize << (4 + rng.next() % 5);
                            let size = 1 + (rng.next() % 256) as usize;
                            if let Ok(ptr) = mm.memalign(alignment, size) {
                                assert_eq!(ptr % alignment, 0);
                                live.push((ptr, size));
                            }
                        }
                        _ => {
                            if !live.is_empty() {
                                let idx = (rng.next() as usize) % live.len();
                                let (ptr, _) = live.swap_remove(idx);
                                mm.free(ptr);
                            }
                        }
                    }
                }
                live
            })
        })
        .collect();

    let mut all: Vec<(usize, usize)> = Vec::new();
    for handle in handles {
        all.extend(handle.join().expect("worker panicked"));
    }

    // Everything still live is disjoint across threads.
    all.sort_unstable();
    for pair in all.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0, "{pair:?} overlap");
    }
    assert!(mm.heap_info().iter().all(|i| i.is_conserved()));

    for (ptr, _) in all {
        mm.free(ptr);
    }
    for info in mm.heap_info() {
        assert_eq!(info.live_allocations, 0, "{}", info.label);
        assert_eq!(info.blocks, 1, "{} not fully coalesced", info.label);
    }
}
