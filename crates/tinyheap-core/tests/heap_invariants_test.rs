//! Conservation, disjointness and alignment under deterministic churn.

use tinyheap_core::heap::{BLOCK_OVERHEAD, MIN_ALIGN};
use tinyheap_core::{CallSite, Heap, HeapKind, MemoryRegion, MmConfig};

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[derive(Clone, Copy, Debug)]
struct Live {
    ptr: usize,
    size: usize,
    alignment: usize,
}

fn heap(regions: &[(usize, usize)]) -> Heap {
    let regions: Vec<MemoryRegion> = regions
        .iter()
        .map(|&(start, size)| MemoryRegion::user(start, size, 0))
        .collect();
    Heap::new(
        HeapKind::User,
        0,
        &regions,
        &MmConfig::default()
            .with_contract_assertions(true)
            .with_site_tracking(true),
    )
}

fn assert_invariants(heap: &Heap, live: &[Live], context: &str) {
    let info = heap.info();
    assert!(info.is_conserved(), "{context}: conservation broken: {info:?}");
    assert_eq!(info.live_allocations, live.len(), "{context}: live count");

    let mut spans: Vec<(usize, usize)> = live
        .iter()
        .map(|l| {
            let usable = heap
                .usable_size(l.ptr)
                .unwrap_or_else(|| panic!("{context}: {:#x} not live", l.ptr));
            assert!(usable >= l.size, "{context}: {:#x} too small", l.ptr);
            assert_eq!(l.ptr % l.alignment, 0, "{context}: {:#x} misaligned", l.ptr);
            assert_eq!(l.ptr % MIN_ALIGN, 0, "{context}: {:#x} below MIN_ALIGN", l.ptr);
            (l.ptr, l.ptr + usable)
        })
        .collect();
    spans.sort_unstable();
    for pair in spans.windows(2) {
        assert!(
            pair[0].1 + BLOCK_OVERHEAD <= pair[1].0,
            "{context}: {:#x?} overlaps {:#x?}",
            pair[0],
            pair[1]
        );
    }

    let layout = heap.layout();
    for pair in layout.windows(2) {
        let adjacent = pair[0].start + pair[0].size == pair[1].start;
        assert!(
            !(adjacent && !pair[0].in_use && !pair[1].in_use),
            "{context}: free neighbours {:?} and {:?} not merged",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn deterministic_churn_holds_core_invariants() {
    const SEEDS: [u64; 4] = [1, 2, 3, 0x5A17_11AB_1EC7_2026];
    const STEPS: usize = 3_000;
    const SLOTS: usize = 48;

    for seed in SEEDS {
        let heap = heap(&[(0x10_0000, 16 * 1024), (0x20_0008, 4 * 1024 - 8)]);
        let total = heap.info().total_bytes;
        let mut rng = XorShift64::new(seed);
        let mut slots: Vec<Option<Live>> = vec![None; SLOTS];

        for step in 0..STEPS {
            let idx = rng.gen_range_usize(0, SLOTS - 1);
            let op = rng.gen_range_usize(0, 99);
            match (op, slots[idx]) {
                (0..=39, None) => {
                    let size = rng.gen_range_usize(0, 700);
                    if let Ok(ptr) = heap.allocate(size) {
                        slots[idx] = Some(Live {
                            ptr,
                            size,
                            alignment: MIN_ALIGN,
                        });
                    }
                }
                (40..=59, None) => {
                    let alignment = 1 << rng.gen_range_usize(4, 9);
                    let size = rng.gen_range_usize(1, 300);
                    if let Ok(ptr) = heap.memalign(alignment, size) {
                        slots[idx] = Some(Live {
                            ptr,
                            size,
                            alignment,
                        });
                    }
                }
                (60..=69, Some(live)) => {
                    let size = rng.gen_range_usize(1, 900);
                    if let Ok(ptr) = heap.realloc(live.ptr, size, |_, _, _| {}) {
                        // A moved block keeps only the minimum alignment.
                        let alignment = if ptr == live.ptr { live.alignment } else { MIN_ALIGN };
                        slots[idx] = Some(Live {
                            ptr,
                            size,
                            alignment,
                        });
                    }
                }
                (_, Some(live)) => {
                    heap.free(live.ptr);
                    slots[idx] = None;
                }
                _ => {}
            }

            if step % 97 == 0 {
                let live: Vec<Live> = slots.iter().flatten().copied().collect();
                assert_invariants(&heap, &live, &format!("seed={seed} step={step}"));
            }
        }

        let live: Vec<Live> = slots.iter().flatten().copied().collect();
        assert_invariants(&heap, &live, &format!("seed={seed} end"));
        for l in live {
            heap.free(l.ptr);
        }
        let info = heap.info();
        assert_eq!(info.live_allocations, 0, "seed={seed}");
        assert_eq!(info.blocks, 2, "seed={seed}: one free block per region");
        assert_eq!(info.free_bytes, total - 2 * BLOCK_OVERHEAD, "seed={seed}");

        let report = heap.site_report().expect("tracking on");
        assert!(report.entries.is_empty(), "seed={seed}: stale sites");
    }
}

#[test]
fn failed_calls_leave_the_layout_untouched() {
    let heap = heap(&[(0x4000, 512)]);
    let mut ptrs = Vec::new();
    while let Ok(ptr) = heap.allocate(40) {
        ptrs.push(ptr);
    }
    for ptr in ptrs.iter().step_by(2) {
        heap.free(*ptr);
    }
    let before = heap.layout();
    let info_before = heap.info();

    assert!(heap.allocate(100).is_err());
    assert!(heap.memalign(64, 40).is_err());
    assert!(heap.realloc(ptrs[1], 400, |_, _, _| panic!("no copy")).is_err());

    assert_eq!(heap.layout(), before);
    let info = heap.info();
    assert_eq!(info.live_bytes, info_before.live_bytes);
    assert_eq!(info.free_bytes, info_before.free_bytes);
    assert_eq!(info.failed_allocations, info_before.failed_allocations + 3);
}

#[test]
fn freed_space_is_reused_for_equal_or_smaller_requests() {
    let heap = heap(&[(0x4000, 1024)]);
    let a = heap.allocate(200).unwrap();
    let _b = heap.allocate(200).unwrap();
    heap.free(a);
    let c = heap.allocate(200).unwrap();
    assert_eq!(c, a);
    heap.free(c);
    let d = heap.allocate(64).unwrap();
    assert_eq!(d, a);
}

#[test]
fn reports_serialize_to_json() {
    let heap = heap(&[(0x4000, 1024)]);
    let ptr = heap.allocate(24).unwrap();
    let info = serde_json::to_value(heap.info()).expect("serialize info");
    assert_eq!(info["label"], "heap0");
    assert_eq!(info["kind"], "user");
    assert_eq!(info["live_allocations"], 1);

    let logs = serde_json::to_value(heap.lifecycle_logs()).expect("serialize logs");
    let alloc = logs
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["event"] == "alloc")
        .expect("alloc record");
    assert_eq!(alloc["ptr"], ptr);
    assert_eq!(alloc["level"], "trace");
}

fn tracked_heap(track_sites: bool, site_table_capacity: usize) -> Heap {
    let regions = [
        MemoryRegion::user(0x8000, 2048, 0),
        MemoryRegion::user(0x8800, 1024, 0),
        MemoryRegion::user(0xA003, 1500, 0),
    ];
    let config = MmConfig {
        site_table_capacity,
        ..MmConfig::default()
            .with_contract_assertions(true)
            .with_site_tracking(track_sites)
    };
    Heap::new(HeapKind::User, 0, &regions, &config)
}

/// Replays one seeded trace and returns every call's outcome.
fn replay(heap: &Heap, seed: u64) -> Vec<Option<usize>> {
    let mut rng = XorShift64::new(seed);
    let mut live: Vec<usize> = Vec::new();
    let mut outcomes = Vec::new();
    for step in 0..2_000 {
        let site = Some(CallSite::address(0x4000_0000 + step));
        match rng.gen_range_usize(0, 9) {
            0..=3 => {
                let ptr = heap.allocate_from(rng.gen_range_usize(0, 300), site).ok();
                live.extend(ptr);
                outcomes.push(ptr);
            }
            4 | 5 => {
                let alignment = 1usize << rng.gen_range_usize(0, 10);
                let size = rng.gen_range_usize(1, 200);
                let ptr = heap.memalign_from(alignment, size, site).ok();
                live.extend(ptr);
                outcomes.push(ptr);
            }
            6 if !live.is_empty() => {
                let idx = rng.gen_range_usize(0, live.len() - 1);
                let size = rng.gen_range_usize(1, 400);
                let moved = heap.realloc_from(live[idx], size, site, |_, _, _| {}).ok();
                if let Some(ptr) = moved {
                    live[idx] = ptr;
                }
                outcomes.push(moved);
            }
            _ if !live.is_empty() => {
                let idx = rng.gen_range_usize(0, live.len() - 1);
                heap.free(live.swap_remove(idx));
            }
            _ => {}
        }

        if let Some(report) = heap.site_report() {
            for entry in &report.entries {
                assert!(
                    live.contains(&entry.ptr),
                    "seed={seed} step={step}: stale site entry {:#x}",
                    entry.ptr
                );
            }
        }
        assert!(heap.info().is_conserved(), "seed={seed} step={step}");
    }
    outcomes
}

#[test]
fn site_tracking_never_changes_results() {
    for seed in [3_u64, 0x5EED, 0xDEAD_BEEF, 0x1234_5678_9ABC] {
        let untracked = replay(&tracked_heap(false, 0), seed);
        let full_table = tracked_heap(true, 3);
        let tracked_full = replay(&full_table, seed);
        let tracked_roomy = replay(&tracked_heap(true, 4096), seed);

        assert_eq!(untracked, tracked_full, "seed={seed}: full table diverged");
        assert_eq!(untracked, tracked_roomy, "seed={seed}: tracking diverged");
        assert!(
            full_table.site_report().expect("tracking on").dropped > 0,
            "seed={seed}: table never filled"
        );
    }
}
